//! HTTP fetcher: homepage plus a handful of key pages, cleaned to text.
//!
//! Requests are spaced by a minimum interval across the whole fetcher, so
//! sequential batch runs never hit sites faster than the configured pace.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{StatusCode, Url};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Fetcher, PageContent, PageText};
use crate::error::{ConfigError, FetchError};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Path fragments that mark a page worth reading.
const KEY_PAGE_HINTS: &[&str] = &[
    "about",
    "services",
    "solutions",
    "products",
    "offerings",
    "what-we-do",
    "blog",
    "news",
    "insights",
    "team",
    "case-studies",
    "portfolio",
    "pricing",
];

/// Elements dropped wholesale before text extraction.
const STRIP_ELEMENTS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "noscript", "iframe", "svg", "form", "button",
];

/// Fetcher settings.
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Minimum spacing between any two requests.
    pub min_spacing: Duration,
    pub request_timeout: Duration,
    /// Pages read per prospect, homepage included.
    pub max_pages: usize,
    /// Characters kept per page.
    pub max_page_chars: usize,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_secs(1),
            request_timeout: Duration::from_secs(15),
            max_pages: 8,
            max_page_chars: 5000,
        }
    }
}

/// Normalize a user-supplied prospect URL.
///
/// Adds `https://` when no scheme is given and drops trailing slashes.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

/// Compiled patterns for markup stripping and link discovery.
struct HtmlCleaner {
    blocks: Vec<Regex>,
    tags: Regex,
    links: Regex,
    title: Regex,
}

impl HtmlCleaner {
    fn new() -> Result<Self, regex::Error> {
        let blocks = STRIP_ELEMENTS
            .iter()
            .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            blocks,
            tags: Regex::new(r"(?s)<!--.*?-->|<[^>]+>")?,
            links: Regex::new(r#"(?i)href\s*=\s*["']([^"'#]+)["']"#)?,
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>")?,
        })
    }

    fn title(&self, html: &str) -> Option<String> {
        self.title
            .captures(html)
            .map(|c| decode_entities(c[1].trim()))
            .filter(|t| !t.is_empty())
    }

    /// Visible text, one non-trivial line per entry, truncated to `max_chars`.
    fn text(&self, html: &str, max_chars: usize) -> String {
        let mut cleaned = html.to_string();
        for block in &self.blocks {
            cleaned = block.replace_all(&cleaned, "\n").into_owned();
        }
        let cleaned = self.tags.replace_all(&cleaned, "\n");
        let cleaned = decode_entities(&cleaned);

        let text = cleaned
            .lines()
            .map(str::trim)
            .filter(|line| line.chars().count() > 2)
            .collect::<Vec<_>>()
            .join("\n");

        if text.chars().count() > max_chars {
            let mut truncated: String = text.chars().take(max_chars).collect();
            truncated.push_str("\n... [content truncated]");
            truncated
        } else {
            text
        }
    }

    /// Same-host links whose path looks like a key page, in document order.
    fn key_links(&self, html: &str, base: &Url, limit: usize) -> Vec<Url> {
        let mut found: Vec<Url> = Vec::new();
        for cap in self.links.captures_iter(html) {
            if found.len() >= limit {
                break;
            }
            let Ok(mut link) = base.join(cap[1].trim()) else {
                continue;
            };
            link.set_fragment(None);
            if link.host_str() != base.host_str() || link.path() == base.path() {
                continue;
            }
            let path = link.path().to_ascii_lowercase();
            if !KEY_PAGE_HINTS.iter().any(|hint| path.contains(hint)) {
                continue;
            }
            if !found.contains(&link) {
                found.push(link);
            }
        }
        found
    }
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Fetcher backed by `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpFetcherConfig,
    cleaner: HtmlCleaner,
    last_request: Mutex<Option<Instant>>,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "http_client".into(),
                message: e.to_string(),
            })?;
        let cleaner = HtmlCleaner::new().map_err(|e| ConfigError::InvalidValue {
            key: "html_cleaner".into(),
            message: e.to_string(),
        })?;
        Ok(Self {
            client,
            config,
            cleaner,
            last_request: Mutex::new(None),
        })
    }

    /// Sleep until the minimum spacing since the previous request has elapsed.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.config.min_spacing;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn get_html(&self, url: &Url) -> Result<String, FetchError> {
        self.pace().await;
        debug!(url = %url, "Fetching page");

        let response = self
            .client
            .get(url.clone())
            .header("Accept", "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .map_err(|e| classify_request_error(url, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(FetchError::TransientNetwork(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::InvalidInput(format!("{url} returned {status}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !content_type.contains("text/html") && !content_type.contains("application/xhtml") {
            return Err(FetchError::InvalidInput(format!(
                "{url} is not HTML ({content_type})"
            )));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::TransientNetwork(format!("reading {url}: {e}")))
    }
}

fn classify_request_error(url: &Url, e: reqwest::Error) -> FetchError {
    if e.is_builder() {
        FetchError::InvalidInput(format!("{url}: {e}"))
    } else {
        FetchError::TransientNetwork(format!("{url}: {e}"))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<PageContent, FetchError> {
        let normalized = normalize_url(url);
        let base = Url::parse(&normalized)
            .map_err(|e| FetchError::InvalidInput(format!("{normalized}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(FetchError::InvalidInput(format!(
                "{normalized} is not an http(s) URL"
            )));
        }

        let homepage = self.get_html(&base).await?;
        let title = self.cleaner.title(&homepage);
        let mut pages = vec![PageText {
            page_url: base.to_string(),
            text: self.cleaner.text(&homepage, self.config.max_page_chars),
        }];

        let links = self
            .cleaner
            .key_links(&homepage, &base, self.config.max_pages.saturating_sub(1));
        for link in links {
            match self.get_html(&link).await {
                Ok(html) => pages.push(PageText {
                    page_url: link.to_string(),
                    text: self.cleaner.text(&html, self.config.max_page_chars),
                }),
                Err(e) => warn!(url = %link, error = %e, "Skipping key page"),
            }
        }

        let content = PageContent { pages };
        if content.is_empty() {
            return Err(FetchError::InvalidInput(format!(
                "{normalized} has no readable text"
            )));
        }

        info!(
            url = %normalized,
            title = title.as_deref().unwrap_or(""),
            pages = content.pages.len(),
            "Fetched prospect site"
        );
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_scheme_and_strips_slash() {
        assert_eq!(normalize_url("acme.test/"), "https://acme.test");
        assert_eq!(normalize_url("  http://acme.test  "), "http://acme.test");
        assert_eq!(normalize_url("https://acme.test/about/"), "https://acme.test/about");
    }

    #[test]
    fn text_drops_scripts_and_short_lines() {
        let cleaner = HtmlCleaner::new().unwrap();
        let html = r#"<html><head><script>var x = 1;</script><style>p{}</style></head>
            <body><nav>Home | About</nav><h1>Acme Plumbing</h1><p>We fix pipes &amp; drains.</p><p>ok</p></body></html>"#;
        let text = cleaner.text(html, 5000);
        assert!(text.contains("Acme Plumbing"));
        assert!(text.contains("We fix pipes & drains."));
        assert!(!text.contains("var x"));
        assert!(!text.contains("Home | About"));
        assert!(!text.lines().any(|l| l == "ok"));
    }

    #[test]
    fn text_truncates_on_char_boundary() {
        let cleaner = HtmlCleaner::new().unwrap();
        let html = format!("<p>{}</p>", "é".repeat(50));
        let text = cleaner.text(&html, 10);
        assert!(text.starts_with(&"é".repeat(10)));
        assert!(text.ends_with("[content truncated]"));
    }

    #[test]
    fn key_links_stay_on_host_and_match_hints() {
        let cleaner = HtmlCleaner::new().unwrap();
        let base = Url::parse("https://acme.test").unwrap();
        let html = r##"
            <a href="/about-us">About</a>
            <a href="https://other.test/services">Elsewhere</a>
            <a href="/careers#top">Jobs</a>
            <a href="services">Services</a>
            <a href="/about-us">Duplicate</a>
        "##;
        let links = cleaner.key_links(html, &base, 5);
        let urls: Vec<String> = links.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            urls,
            vec!["https://acme.test/about-us", "https://acme.test/services"]
        );
    }

    #[test]
    fn title_is_decoded() {
        let cleaner = HtmlCleaner::new().unwrap();
        assert_eq!(
            cleaner.title("<title> Acme &amp; Co </title>").as_deref(),
            Some("Acme & Co")
        );
        assert_eq!(cleaner.title("<p>no title</p>"), None);
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let fetcher = HttpFetcher::new(HttpFetcherConfig::default()).unwrap();
        let err = fetcher.fetch("ftp://acme.test").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidInput(_)));
    }
}
