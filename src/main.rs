use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use outreach_agent::capabilities::{
    Analysis, Analyzer, AnthropicClient, AnthropicConfig, Dispatcher, Drafter, DryRunDispatcher,
    EmailDraft, HttpFetcher, PageContent, SmtpDispatcher, Tone,
};
use outreach_agent::config::OutreachConfig;
use outreach_agent::error::{AnalyzeError, DraftError};
use outreach_agent::outreach::{OutreachRecord, Stage};
use outreach_agent::pipeline::{
    BatchConfig, BatchRunner, BatchSummary, CancelToken, Capabilities, EntryOutcome,
    Orchestrator, OrchestratorConfig, Prospect,
};
use outreach_agent::store::{LibSqlBackend, RecordStore};

#[derive(Parser)]
#[command(name = "outreach")]
#[command(version, about = "Website-driven cold outreach: scrape, analyze, draft, send")]
struct Cli {
    /// Database file (overrides OUTREACH_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run prospects through scrape, analyze and draft
    Run {
        /// Prospects as `url` or `url,recipient`
        prospects: Vec<String>,

        /// Read additional prospects from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,

        #[arg(short, long, default_value = "professional")]
        tone: Tone,

        /// Send each draft immediately when a recipient is known
        #[arg(long)]
        auto_send: bool,

        /// Use a throwaway database and never contact a mail server
        #[arg(long)]
        dry_run: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Continue an interrupted record
    Resume {
        id: String,
        /// Defaults to the current draft's tone
        #[arg(short, long)]
        tone: Option<Tone>,
    },
    /// Show one record
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// List records
    List {
        #[arg(long)]
        stage: Option<Stage>,
    },
    /// Replace the current draft
    Regenerate {
        id: String,
        /// Defaults to the current draft's tone
        #[arg(short, long)]
        tone: Option<Tone>,
    },
    /// Change the draft's subject or body by hand
    Edit {
        id: String,
        #[arg(long, required_unless_present = "body")]
        subject: Option<String>,
        /// New body text, or `-` to read it from stdin
        #[arg(long)]
        body: Option<String>,
    },
    /// Queue a drafted record for sending
    RequestSend { id: String },
    /// Confirm a queued send and dispatch it
    Confirm {
        id: String,
        #[arg(long)]
        to: String,
    },
    /// End a record that has not been sent
    Abort {
        id: String,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },
    MarkOpened { id: String },
    MarkReplied { id: String },
    /// Schedule or clear a follow-up
    FollowUp {
        id: String,
        /// Due date (YYYY-MM-DD)
        #[arg(long, conflicts_with_all = ["in_days", "clear"])]
        on: Option<NaiveDate>,
        #[arg(long, conflicts_with = "clear")]
        in_days: Option<i64>,
        #[arg(long)]
        clear: bool,
    },
    /// Push a follow-up back
    Snooze {
        id: String,
        #[arg(long, default_value = "3")]
        days: i64,
    },
    /// Attach a note to a record
    Note { id: String, text: Vec<String> },
    /// Follow-up dashboard
    FollowUps,
    /// Aggregate counts
    Stats,
}

impl Commands {
    fn needs_llm(&self) -> bool {
        matches!(
            self,
            Self::Run { .. } | Self::Resume { .. } | Self::Regenerate { .. }
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<ExitCode> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let mut config = OutreachConfig::from_env().context("Invalid configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let dry_run = matches!(cli.command, Commands::Run { dry_run: true, .. });
    let orchestrator = build_orchestrator(&config, cli.command.needs_llm(), dry_run).await?;
    let now = Utc::now();

    match cli.command {
        Commands::Run {
            prospects,
            file,
            tone,
            auto_send,
            dry_run,
            json,
        } => {
            let prospects = collect_prospects(&prospects, file.as_deref())?;
            if auto_send && !dry_run && !config.smtp.is_configured() {
                bail!("--auto-send needs SMTP_HOST, SMTP_USERNAME and SMTP_PASSWORD");
            }

            eprintln!("📨 Outreach v{}", env!("CARGO_PKG_VERSION"));
            eprintln!("   Model: {}", config.model);
            if dry_run {
                eprintln!("   Database: in-memory (dry run)");
            } else {
                eprintln!("   Database: {}", config.db_path.display());
            }
            eprintln!("   Prospects: {}\n", prospects.len());

            let cancel = cancel_on_ctrl_c();
            let runner = BatchRunner::new(orchestrator);
            let summary = runner
                .run_batch(prospects, &BatchConfig { tone, auto_send }, &cancel)
                .await;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            return Ok(if summary.all_succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Commands::Resume { id, tone } => {
            let tone = orchestrator.tone_for(&orchestrator.get(&id).await?, tone);
            let record = orchestrator.resume(&id, tone, &cancel_on_ctrl_c()).await?;
            print_record(&record);
            return Ok(exit_for(&record));
        }
        Commands::Show { id, json } => {
            let record = orchestrator.get(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
        }
        Commands::List { stage } => {
            let records = orchestrator.list(stage).await?;
            if records.is_empty() {
                println!("No records.");
            }
            for record in &records {
                println!("{:<48} {:<22} {}", record.id, record.stage.as_str(), record.url);
            }
        }
        Commands::Regenerate { id, tone } => {
            let tone = orchestrator.tone_for(&orchestrator.get(&id).await?, tone);
            let record = orchestrator
                .regenerate(&id, tone, &cancel_on_ctrl_c())
                .await?;
            print_record(&record);
        }
        Commands::Edit { id, subject, body } => {
            let body = match body.as_deref() {
                Some("-") => Some(
                    std::io::read_to_string(std::io::stdin())
                        .context("Failed to read body from stdin")?,
                ),
                _ => body,
            };
            let record = orchestrator
                .edit_draft(&id, subject.as_deref(), body.as_deref())
                .await?;
            print_record(&record);
        }
        Commands::RequestSend { id } => {
            let record = orchestrator.request_send(&id).await?;
            println!("{} is awaiting confirmation.", record.id);
        }
        Commands::Confirm { id, to } => {
            if !config.smtp.is_configured() {
                bail!("Sending needs SMTP_HOST, SMTP_USERNAME and SMTP_PASSWORD");
            }
            let record = orchestrator
                .confirm_send(&id, &to, &cancel_on_ctrl_c())
                .await?;
            print_record(&record);
            return Ok(exit_for(&record));
        }
        Commands::Abort { id, reason } => {
            let record = orchestrator.abort(&id, &reason).await?;
            println!("{} aborted.", record.id);
        }
        Commands::MarkOpened { id } => {
            let record = orchestrator.mark_opened(&id, now).await?;
            println!("{} is {}.", record.id, record.stage);
        }
        Commands::MarkReplied { id } => {
            let record = orchestrator.mark_replied(&id, now).await?;
            println!("{} is {}.", record.id, record.stage);
        }
        Commands::FollowUp {
            id,
            on,
            in_days,
            clear,
        } => {
            let record = if clear {
                orchestrator.clear_follow_up(&id).await?
            } else {
                let due = match (on, in_days) {
                    (Some(date), _) => date.and_hms_opt(9, 0, 0).map(|dt| dt.and_utc()),
                    (None, Some(days)) => Some(now + chrono::Duration::days(days)),
                    (None, None) => bail!("Pass --on DATE, --in-days N or --clear"),
                }
                .context("Invalid follow-up date")?;
                orchestrator.schedule_follow_up(&id, due).await?
            };
            match record.tracking.follow_up_due_at {
                Some(due) => println!("{} follow-up due {}.", record.id, due.format("%Y-%m-%d")),
                None => println!("{} has no follow-up.", record.id),
            }
        }
        Commands::Snooze { id, days } => {
            let record = orchestrator.snooze_follow_up(&id, days, now).await?;
            if let Some(due) = record.tracking.follow_up_due_at {
                println!("{} follow-up moved to {}.", record.id, due.format("%Y-%m-%d"));
            }
        }
        Commands::Note { id, text } => {
            let record = orchestrator.add_note(&id, &text.join(" ")).await?;
            println!("{} has {} note(s).", record.id, record.tracking.notes.len());
        }
        Commands::FollowUps => {
            let buckets = orchestrator.follow_up_dashboard(now).await?;
            if buckets.is_empty() {
                println!("No follow-ups scheduled.");
            }
            for (label, records) in [
                ("Overdue", &buckets.overdue),
                ("Next 7 days", &buckets.upcoming),
                ("Later", &buckets.later),
            ] {
                if records.is_empty() {
                    continue;
                }
                println!("{label}:");
                for record in records {
                    let due = record
                        .tracking
                        .follow_up_due_at
                        .map(|d| d.format("%Y-%m-%d").to_string())
                        .unwrap_or_default();
                    println!("  {due}  {:<48} {}", record.id, record.url);
                }
            }
        }
        Commands::Stats => {
            let stats = orchestrator.outreach_stats(now).await?;
            println!("Total:                 {}", stats.total);
            println!("In progress:           {}", stats.in_progress);
            println!("Drafted:               {}", stats.drafted);
            println!("Awaiting confirmation: {}", stats.awaiting_confirmation);
            println!("Sent:                  {}", stats.sent);
            println!("Opened:                {}", stats.opened);
            println!("Replied:               {}", stats.replied);
            println!("Failed:                {}", stats.failed);
            println!("Follow-ups due:        {}", stats.follow_ups_due);
            println!("Reply rate:            {:.1}%", stats.reply_rate());
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Log to stderr, or to a daily rolling file when a log directory is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "outreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Stands in for the LLM on commands that never generate text.
struct LlmNotConfigured;

#[async_trait]
impl Analyzer for LlmNotConfigured {
    async fn analyze(&self, _content: &PageContent) -> Result<Analysis, AnalyzeError> {
        Err(AnalyzeError::Other("ANTHROPIC_API_KEY is not set".into()))
    }
}

#[async_trait]
impl Drafter for LlmNotConfigured {
    async fn draft(&self, _analysis: &Analysis, _tone: Tone) -> Result<EmailDraft, DraftError> {
        Err(DraftError::Other("ANTHROPIC_API_KEY is not set".into()))
    }
}

async fn build_orchestrator(
    config: &OutreachConfig,
    needs_llm: bool,
    dry_run: bool,
) -> Result<Arc<Orchestrator>> {
    // ── Database ─────────────────────────────────────────────────────
    let store: Arc<dyn RecordStore> = if dry_run {
        Arc::new(LibSqlBackend::new_memory().await?)
    } else {
        Arc::new(
            LibSqlBackend::new_local(&config.db_path)
                .await
                .with_context(|| {
                    format!("Failed to open database at {}", config.db_path.display())
                })?,
        )
    };

    // ── Capabilities ─────────────────────────────────────────────────
    let fetcher = Arc::new(HttpFetcher::new(config.fetcher.clone())?);

    let (analyzer, drafter): (Arc<dyn Analyzer>, Arc<dyn Drafter>) =
        if config.api_key.expose_secret().trim().is_empty() {
            if needs_llm {
                bail!("ANTHROPIC_API_KEY not set\n  export ANTHROPIC_API_KEY=sk-ant-...");
            }
            let stub = Arc::new(LlmNotConfigured);
            (stub.clone() as Arc<dyn Analyzer>, stub as Arc<dyn Drafter>)
        } else {
            let client = Arc::new(AnthropicClient::new(AnthropicConfig {
                model: config.model.clone(),
                timeout: config.call_timeout,
                sender_name: config.sender_name.clone(),
                ..AnthropicConfig::new(config.api_key.clone())
            })?);
            (client.clone() as Arc<dyn Analyzer>, client as Arc<dyn Drafter>)
        };

    let dispatcher: Arc<dyn Dispatcher> = if dry_run {
        Arc::new(DryRunDispatcher::new())
    } else {
        Arc::new(SmtpDispatcher::new(config.smtp.clone()))
    };

    let caps = Capabilities {
        fetcher,
        analyzer,
        drafter,
        dispatcher,
    };
    let orchestrator_config = OrchestratorConfig {
        retry: config.retry.clone(),
        call_timeout: config.call_timeout,
        ..Default::default()
    };
    Ok(Arc::new(Orchestrator::new(store, caps, orchestrator_config)))
}

fn collect_prospects(args: &[String], file: Option<&Path>) -> Result<Vec<Prospect>> {
    let mut lines: Vec<String> = args.to_vec();
    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        lines.extend(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    if lines.is_empty() {
        bail!("No prospects given");
    }
    lines
        .iter()
        .map(|line| line.parse::<Prospect>().map_err(|e| anyhow!(e)))
        .collect()
}

/// Cancel the returned token on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current call");
            trigger.cancel();
        }
    });
    cancel
}

fn exit_for(record: &OutreachRecord) -> ExitCode {
    if record.stage == Stage::Failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_summary(summary: &BatchSummary) {
    for entry in &summary.entries {
        let id = entry.record_id.as_deref().unwrap_or("-");
        match &entry.outcome {
            EntryOutcome::Succeeded { stage } => {
                println!("  ✓ {:<40} {:<10} {id}", entry.url, stage.as_str());
            }
            EntryOutcome::Failed {
                step,
                classification,
                detail,
            } => {
                println!(
                    "  ✗ {:<40} failed at {step} ({classification}) {id}",
                    entry.url
                );
                if let Some(detail) = detail {
                    println!("      {detail}");
                }
            }
            EntryOutcome::Skipped => println!("  - {:<40} skipped", entry.url),
        }
    }
    println!(
        "\n{} total: {} succeeded, {} failed (scrape {}, analyze {}, draft {}, send {}), {} skipped",
        summary.total,
        summary.succeeded,
        summary.failed(),
        summary.failed_at_scrape,
        summary.failed_at_analyze,
        summary.failed_at_draft,
        summary.failed_at_send,
        summary.skipped,
    );
}

fn print_record(record: &OutreachRecord) {
    println!("{}  [{}]", record.id, record.stage);
    println!("  URL:       {}", record.url);
    if let Some(recipient) = &record.recipient {
        println!("  Recipient: {recipient}");
    }
    if let Some(failure) = record.failure() {
        println!(
            "  Failed at: {} ({})",
            failure.step, failure.classification
        );
        if let Some(detail) = failure.detail {
            println!("             {detail}");
        }
    }
    if let Some(analysis) = &record.analysis {
        if !analysis.company_name.is_empty() {
            println!("  Company:   {}", analysis.company_name);
        }
        println!("  Industry:  {}", analysis.industry);
        println!("  Angle:     {}", analysis.outreach_angle);
    }
    if let Some(draft) = &record.draft {
        println!("  Subject:   {}  ({})", draft.subject, draft.tone);
        println!();
        for line in draft.body.lines() {
            println!("    {line}");
        }
        println!();
    }
    if let Some(sent_at) = record.sent_at {
        println!("  Sent:      {}", sent_at.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(due) = record.tracking.follow_up_due_at {
        println!("  Follow-up: {}", due.format("%Y-%m-%d"));
    }
    for note in &record.tracking.notes {
        println!("  Note {}: {}", note.at.format("%Y-%m-%d"), note.text);
    }
    println!("  Attempts:");
    for attempt in &record.attempts {
        let class = attempt
            .classification
            .map(|c| format!(" ({c})"))
            .unwrap_or_default();
        println!(
            "    {:>3}. {} {}{class}",
            attempt.seq,
            attempt.kind,
            attempt.outcome.as_str()
        );
    }
}
