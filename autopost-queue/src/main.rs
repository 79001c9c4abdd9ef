//! autopost-queue - Inspect and manage the posting queue
//!
//! Unix-style tool working directly against the queue database.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use libautopost::config::resolve_db_path;
use libautopost::logging::{init_default, LoggingConfig, LEVEL_ENV};
use libautopost::rate::build_policy;
use libautopost::{AutopostError, Config, ContentStore, Database, MediaRef, Result, Submission};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "autopost-queue")]
#[command(version)]
#[command(about = "Inspect and manage the autopost queue")]
#[command(long_about = "\
autopost-queue - Inspect and manage the autopost queue

DESCRIPTION:
    autopost-queue is a Unix-style tool for looking into the queue of media
    submissions waiting to be posted. It reads the same database as the
    posting service.

COMMANDS:
    list    List pending submissions in posting order
    stats   Show how many submissions are in each state
    info    Show details about one submission
    delete  Remove a submission from the queue

USAGE EXAMPLES:
    # Next ten submissions to be posted
    autopost-queue list --limit 10

    # Queue statistics as JSON
    autopost-queue stats --format json

    # Where is this file in the queue?
    autopost-queue info AgADBAADr6cxG

CONFIGURATION:
    Configuration file: ~/.config/autopost/config.toml

    Override with environment variables:
        AUTOPOST_CONFIG    - Path to config file
        AUTOPOST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input or submission not found
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List pending submissions in posting order
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Maximum number of submissions to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Show queue statistics
    Stats {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show details about a submission
    Info {
        /// Media reference of the submission
        media_ref: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Delete a submission
    Delete {
        /// Media reference of the submission
        media_ref: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if std::env::var(LEVEL_ENV).is_ok() && !cli.verbose {
        init_default();
    } else {
        // Keep stderr quiet for scripts unless asked otherwise
        let mut logging = LoggingConfig::from_env();
        logging.level = if cli.verbose { "debug" } else { "error" }.to_string();
        logging.init();
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    let db_path = resolve_db_path(&config.database.path);
    debug!(path = %db_path.display(), "Opening queue database");
    let db = Database::new(&db_path.to_string_lossy()).await?;

    match cli.command {
        Commands::List { format, limit } => cmd_list(&db, format, limit).await,
        Commands::Stats { format } => cmd_stats(&db, format).await,
        Commands::Info { media_ref, format } => cmd_info(&db, &config, &media_ref, format).await,
        Commands::Delete { media_ref } => cmd_delete(&db, &media_ref).await,
    }
}

async fn cmd_list(db: &Database, format: OutputFormat, limit: usize) -> Result<()> {
    if limit == 0 {
        return Err(AutopostError::InvalidInput(
            "--limit must be at least 1".to_string(),
        ));
    }

    let pending = db.list_pending(limit).await?;

    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = pending
                .iter()
                .enumerate()
                .map(|(index, s)| {
                    serde_json::json!({
                        "position": index + 1,
                        "id": s.id,
                        "kind": s.kind,
                        "media_ref": s.media,
                        "submitted_by": s.submitted_by,
                        "submitted_at": s.submitted_at,
                        "caption": s.caption,
                    })
                })
                .collect();
            print_json(&serde_json::Value::Array(json));
        }
        OutputFormat::Text => {
            let now = Utc::now();
            for (index, submission) in pending.iter().enumerate() {
                println!(
                    "{:>4} | {} | {} | {} | {}",
                    index + 1,
                    submission.id,
                    submission.kind,
                    submission.media,
                    describe_age(submission, now)
                );
            }
        }
    }

    Ok(())
}

async fn cmd_stats(db: &Database, format: OutputFormat) -> Result<()> {
    let counts = db.counts().await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "pending": counts.pending,
            "posted": counts.posted,
            "errored": counts.errored,
            "deleted": counts.deleted,
            "total": counts.total(),
        })),
        OutputFormat::Text => {
            println!("Pending: {}", counts.pending);
            println!("Posted:  {}", counts.posted);
            println!("Errored: {}", counts.errored);
            println!("Deleted: {}", counts.deleted);
            println!("Total:   {}", counts.total());
        }
    }

    Ok(())
}

async fn cmd_info(
    db: &Database,
    config: &Config,
    media_ref: &str,
    format: OutputFormat,
) -> Result<()> {
    let submission = db.find_by_reference(&MediaRef(media_ref.to_string())).await?;

    // Position and wait are relative to the next post, which only the
    // running service knows; the estimate uses the configured edition.
    let (position, wait) = if submission.is_pending() {
        let position = db.position_of(submission.id).await?;
        let queue_length = db.queue_length().await?;
        let policy = build_policy(&config.rate)?;
        (
            Some(position),
            Some(policy.estimated_wait_for_position(position, queue_length)),
        )
    } else {
        (None, None)
    };

    let posted_at = submission
        .outcome
        .as_ref()
        .and_then(|o| DateTime::<Utc>::from_timestamp(o.posted_at, 0));

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "id": submission.id,
            "media_ref": submission.media,
            "kind": submission.kind,
            "state": submission.state(),
            "submitted_by": submission.submitted_by,
            "submitted_at": submission.submitted_at,
            "caption": submission.caption,
            "position": position,
            "wait_after_next_post_secs": wait.map(|w| w.as_secs()),
            "posted_at": posted_at.map(|t| t.to_rfc3339()),
            "external_ref": submission.outcome.as_ref().map(|o| &o.external_ref),
        })),
        OutputFormat::Text => {
            println!("ID:           {}", submission.id);
            println!("Media:        {} ({})", submission.media, submission.kind);
            println!("State:        {}", submission.state());
            println!("Submitted by: {}", submission.submitted_by);
            if let Some(at) = submission.submitted_at_utc() {
                println!("Submitted at: {}", at.to_rfc3339());
            }
            if !submission.caption.is_empty() {
                println!("Caption:      {}", truncate_caption(&submission.caption, 60));
            }
            if let (Some(position), Some(wait)) = (position, wait) {
                println!("Position:     {}", position);
                println!(
                    "Estimate:     {} after the next post",
                    humantime::format_duration(wait)
                );
            }
            if let (Some(at), Some(outcome)) = (posted_at, submission.outcome.as_ref()) {
                println!("Posted at:    {}", at.to_rfc3339());
                println!("Message:      {}", outcome.external_ref);
            }
        }
    }

    Ok(())
}

async fn cmd_delete(db: &Database, media_ref: &str) -> Result<()> {
    let submission = db.find_by_reference(&MediaRef(media_ref.to_string())).await?;
    db.mark_deleted(submission.id).await?;
    println!("Deleted submission {} ({})", submission.id, submission.media);
    Ok(())
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error: could not encode output: {}", e),
    }
}

/// Shorten a caption on a character boundary
fn truncate_caption(caption: &str, max_chars: usize) -> String {
    let single_line = caption.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let cut: String = single_line.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

fn describe_age(submission: &Submission, now: DateTime<Utc>) -> String {
    let age = now.timestamp() - submission.submitted_at;
    if age < 60 {
        return "just now".to_string();
    }
    let rounded = std::time::Duration::from_secs((age - age % 60) as u64);
    format!("{} ago", humantime::format_duration(rounded))
}
