//! tgrelay - Telegram archival and deduplicating forwarding engine
//!
//! Usage:
//!   tgrelay init                          - Write a starter configuration
//!   tgrelay auth                          - Authorize an account
//!   tgrelay forward <origin> <dest>       - Forward new messages
//!   tgrelay forward-all <dest>            - Total-forward every known channel
//!   tgrelay run                           - Run the cron scheduler
//!   tgrelay queue process                 - Drain the file-forward queue

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tgrelay::{
    config::Config,
    db::Archive,
    forwarding::{ForwardOptions, Forwarder},
    scheduler::Scheduler,
    telegram::ClientPool,
    Error, Result,
};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tgrelay")]
#[command(author = "tgrelay Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Telegram archival and deduplicating forwarding engine")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tgrelay_config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration file
    Init,

    /// Authorize an account (phone code, then 2FA if set)
    Auth {
        /// Account identifier (session name or phone number)
        #[arg(long)]
        account: Option<String>,
    },

    /// Forward new messages from an origin to a destination
    Forward {
        /// Origin entity (@handle or numeric id)
        origin: String,

        /// Destination entity (@handle or numeric id)
        destination: String,

        /// Account identifier to use
        #[arg(long)]
        account: Option<String>,

        /// Resume from this message id instead of the stored checkpoint
        #[arg(long)]
        start_id: Option<i32>,
    },

    /// Forward every channel recorded in account_channel_access
    ForwardAll {
        /// Destination entity
        destination: String,
    },

    /// Run the cron scheduler until interrupted
    Run,

    /// Schedule management
    #[command(subcommand)]
    Schedule(ScheduleCommands),

    /// File-forward queue management
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Hash every file in a channel into the inventory
    Scan {
        /// Channel to scan
        channel: String,

        #[arg(long)]
        account: Option<String>,
    },

    /// Re-post a channel's messages to strip forwarding headers
    Repost {
        /// Channel to rewrite
        channel: String,

        #[arg(long)]
        account: Option<String>,
    },

    /// Show the archive timeline
    Timeline {
        /// Year to expand into days
        #[arg(long)]
        year: Option<i32>,

        /// Month to expand into days
        #[arg(long)]
        month: Option<u32>,

        /// Messages per timeline page
        #[arg(long, default_value_t = 500)]
        page_size: i64,
    },

    /// List rows with missing checksums
    Verify {
        /// Table to check (messages or media)
        table: String,

        #[arg(long)]
        from: Option<i64>,

        #[arg(long)]
        to: Option<i64>,
    },

    /// Export a table to CSV
    Export {
        table: String,
        destination: PathBuf,
    },

    /// Show configuration and archive status
    Status,
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Add a file-forward schedule
    Add {
        /// Source entity
        source: String,

        /// Destination entity
        destination: String,

        /// Cron expression (5 or 6 fields)
        #[arg(long, default_value = "0 0 * * * *")]
        cron: String,

        /// Comma-separated MIME whitelist
        #[arg(long)]
        file_types: Option<String>,

        /// Minimum file size in bytes
        #[arg(long)]
        min_size: Option<i64>,

        /// Maximum file size in bytes
        #[arg(long)]
        max_size: Option<i64>,

        /// Priority (higher drains first)
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },

    /// List enabled schedules
    List,

    /// Enable a schedule
    Enable { id: i64 },

    /// Disable a schedule
    Disable { id: i64 },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List pending queue rows
    List,

    /// Drain pending rows
    Process {
        #[arg(long)]
        account: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &PathBuf) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            if let Ok(rest) = path.strip_prefix("~") {
                return home.join(rest);
            }
        }
    }
    path.clone()
}

/// 0 success, 1 general error, 2 configuration failure, 130 cancellation.
fn exit_code(e: &Error) -> i32 {
    match e {
        Error::Config { .. } | Error::InvalidConfig(_) => 2,
        Error::Cancelled => 130,
        _ => 1,
    }
}

/// Load config and wire the archive, pool, and forwarder together.
fn build(config_path: &PathBuf) -> Result<(Arc<Config>, Arc<Archive>, Arc<Forwarder>)> {
    let config = Arc::new(Config::load(config_path)?);
    let archive = Arc::new(Archive::open(&config.db_path)?);
    std::fs::create_dir_all(&config.media_dir)?;

    let session_dir = Config::session_dir(config_path);
    let pool = Arc::new(ClientPool::new(config.clone(), session_dir, archive.clone()));
    let forwarder = Arc::new(Forwarder::new(config.clone(), archive.clone(), pool)?);
    Ok((config, archive, forwarder))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))
}

/// Run a future, turning Ctrl-C into a cancellation error.
fn run_cancellable<F>(future: F) -> Result<F::Output>
where
    F: std::future::Future,
{
    runtime()?.block_on(async {
        tokio::select! {
            result = future => Ok(result),
            _ = tokio::signal::ctrl_c() => Err(Error::Cancelled),
        }
    })
}

fn run_command(command: Commands, config_path: &PathBuf) -> Result<()> {
    match command {
        Commands::Init => cmd_init(config_path),
        Commands::Auth { account } => cmd_auth(config_path, account.as_deref()),
        Commands::Forward {
            origin,
            destination,
            account,
            start_id,
        } => cmd_forward(config_path, &origin, &destination, account, start_id),
        Commands::ForwardAll { destination } => cmd_forward_all(config_path, &destination),
        Commands::Run => cmd_run(config_path),
        Commands::Schedule(schedule_cmd) => cmd_schedule(config_path, schedule_cmd),
        Commands::Queue(queue_cmd) => cmd_queue(config_path, queue_cmd),
        Commands::Scan { channel, account } => cmd_scan(config_path, &channel, account.as_deref()),
        Commands::Repost { channel, account } => {
            cmd_repost(config_path, &channel, account.as_deref())
        }
        Commands::Timeline {
            year,
            month,
            page_size,
        } => cmd_timeline(config_path, year, month, page_size),
        Commands::Verify { table, from, to } => cmd_verify(config_path, &table, from, to),
        Commands::Export { table, destination } => cmd_export(config_path, &table, &destination),
        Commands::Status => cmd_status(config_path),
    }
}

fn cmd_init(config_path: &PathBuf) -> Result<()> {
    if config_path.exists() {
        return Err(Error::InvalidConfig(format!(
            "{} already exists",
            config_path.display()
        )));
    }

    let config = Config {
        accounts: vec![tgrelay::config::AccountConfig {
            session_name: "relay_1".to_string(),
            api_id: 123456,
            api_hash: "0123456789abcdef0123456789abcdef".to_string(),
            phone_number: None,
            password: None,
        }],
        ..Config::default()
    };

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    config.save(config_path)?;

    info!("Configuration written to {}", config_path.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the account credentials (my.telegram.org)");
    info!("  2. Run 'tgrelay auth' to authorize the account");
    info!("  3. Run 'tgrelay forward <origin> <destination>'");
    Ok(())
}

fn cmd_auth(config_path: &PathBuf, account: Option<&str>) -> Result<()> {
    let (_config, _archive, forwarder) = build(config_path)?;
    let pool = forwarder_pool(&forwarder);

    runtime()?.block_on(async {
        if pool.is_authorized(account).await? {
            info!("Already authorized");
            return Ok(());
        }

        let token = pool.request_login_code(account).await?;
        info!("Login code sent");

        let code = prompt("Enter the code you received: ")?;
        if let Some(password_token) = pool.sign_in(account, &token, &code).await? {
            let hint = password_token.hint().unwrap_or("none");
            println!("2FA required (hint: {})", hint);
            let password = rpassword::prompt_password("Enter your 2FA password: ")
                .map_err(|e| Error::Internal(e.to_string()))?;
            pool.check_password(account, password_token, &password)
                .await?;
        }

        info!("Successfully authorized");
        pool.disconnect().await;
        Ok(())
    })
}

fn cmd_forward(
    config_path: &PathBuf,
    origin: &str,
    destination: &str,
    account: Option<String>,
    start_id: Option<i32>,
) -> Result<()> {
    let (_config, _archive, forwarder) = build(config_path)?;
    let options = ForwardOptions {
        account,
        start_message_id: start_id,
    };

    let result = run_cancellable(forwarder.forward_messages(origin, destination, &options))??;
    let (last_id, stats) = result;

    println!("Forwarding complete");
    println!("  Messages forwarded: {}", stats.messages_forwarded);
    println!("  Files forwarded:    {}", stats.files_forwarded);
    println!("  Bytes forwarded:    {}", stats.bytes_forwarded);
    if let Some(last) = last_id {
        println!("  Last message id:    {}", last);
    }
    Ok(())
}

fn cmd_forward_all(config_path: &PathBuf, destination: &str) -> Result<()> {
    let (_config, _archive, forwarder) = build(config_path)?;
    let report = run_cancellable(forwarder.forward_all_accessible_channels(destination))??;

    let totals = report.totals();
    println!("Total forward complete");
    println!("  Successful channels: {}", report.successful.len());
    println!("  Banned channels:     {}", report.banned.len());
    println!("  Failed channels:     {}", report.failed.len());
    println!(
        "  Recovered: {} messages, {} files ({} bytes)",
        totals.messages_forwarded, totals.files_forwarded, totals.bytes_forwarded
    );
    Ok(())
}

fn cmd_run(config_path: &PathBuf) -> Result<()> {
    let (config, archive, forwarder) = build(config_path)?;
    let scheduler = Scheduler::new(config, archive, forwarder);

    info!("Scheduler running; press Ctrl-C to stop");
    match run_cancellable(scheduler.run()) {
        Err(Error::Cancelled) => {
            info!("Scheduler stopped");
            Err(Error::Cancelled)
        }
        Err(e) => Err(e),
        Ok(inner) => inner,
    }
}

fn cmd_schedule(config_path: &PathBuf, command: ScheduleCommands) -> Result<()> {
    let (_config, archive, _forwarder) = build(config_path)?;
    match command {
        ScheduleCommands::Add {
            source,
            destination,
            cron,
            file_types,
            min_size,
            max_size,
            priority,
        } => {
            let id = archive.add_file_forward_schedule(
                &source,
                &destination,
                &cron,
                file_types.as_deref(),
                min_size,
                max_size,
                priority,
            )?;
            println!("Schedule {} added", id);
        }
        ScheduleCommands::List => {
            let schedules = archive.file_forward_schedules()?;
            if schedules.is_empty() {
                println!("No enabled schedules");
            }
            for s in schedules {
                println!(
                    "[{}] {} -> {} ({}), priority {}, watermark {}",
                    s.id, s.source, s.destination, s.schedule, s.priority, s.last_message_id
                );
            }
        }
        ScheduleCommands::Enable { id } => {
            archive.set_file_forward_schedule_enabled(id, true)?;
            println!("Schedule {} enabled", id);
        }
        ScheduleCommands::Disable { id } => {
            archive.set_file_forward_schedule_enabled(id, false)?;
            println!("Schedule {} disabled", id);
        }
    }
    Ok(())
}

fn cmd_queue(config_path: &PathBuf, command: QueueCommands) -> Result<()> {
    let (_config, archive, forwarder) = build(config_path)?;
    match command {
        QueueCommands::List => {
            let pending = archive.pending_file_forward_queue()?;
            if pending.is_empty() {
                println!("Queue is empty");
            }
            for item in pending {
                println!(
                    "[{}] schedule {:?}, message {}, file {}",
                    item.id, item.schedule_id, item.message_id, item.file_id
                );
            }
        }
        QueueCommands::Process { account } => {
            let report =
                run_cancellable(forwarder.process_file_forward_queue(account.as_deref()))??;
            println!(
                "Drained queue: {} forwarded, {} failed ({} bytes)",
                report.forwarded, report.failed, report.bytes_forwarded
            );
        }
    }
    Ok(())
}

fn cmd_scan(config_path: &PathBuf, channel: &str, account: Option<&str>) -> Result<()> {
    let (_config, _archive, forwarder) = build(config_path)?;
    let recorded = run_cancellable(forwarder.scan_channel(channel, account))??;
    println!("Recorded {} new file(s)", recorded);
    Ok(())
}

fn cmd_repost(config_path: &PathBuf, channel: &str, account: Option<&str>) -> Result<()> {
    let (_config, _archive, forwarder) = build(config_path)?;
    let reposted = run_cancellable(forwarder.repost_messages_in_channel(channel, account))??;
    println!("Re-posted {} message(s)", reposted);
    Ok(())
}

fn cmd_timeline(
    config_path: &PathBuf,
    year: Option<i32>,
    month: Option<u32>,
    page_size: i64,
) -> Result<()> {
    let (_config, archive, _forwarder) = build(config_path)?;

    match (year, month) {
        (Some(year), Some(month)) => {
            for day in archive.days(year, month, page_size)? {
                println!("{}  {:>6} message(s)  page {}", day.slug, day.count, day.page);
            }
        }
        _ => {
            for m in archive.months()? {
                println!("{}  {:>6} message(s)", m.slug, m.count);
            }
        }
    }
    Ok(())
}

fn cmd_verify(
    config_path: &PathBuf,
    table: &str,
    from: Option<i64>,
    to: Option<i64>,
) -> Result<()> {
    let (_config, archive, _forwarder) = build(config_path)?;
    let range = from.zip(to);
    let issues = archive.verify_checksums(table, range)?;
    if issues.is_empty() {
        println!("No integrity issues in {}", table);
    }
    for (id, issue) in issues {
        println!("{}: {}", id, issue);
    }
    Ok(())
}

fn cmd_export(config_path: &PathBuf, table: &str, destination: &PathBuf) -> Result<()> {
    let (_config, archive, _forwarder) = build(config_path)?;
    let rows = archive.export_csv(table, destination)?;
    println!("Exported {} row(s) to {}", rows, destination.display());
    Ok(())
}

fn cmd_status(config_path: &PathBuf) -> Result<()> {
    let (config, archive, _forwarder) = build(config_path)?;

    println!("tgrelay Status");
    println!("==============");
    println!();
    println!("Configuration: {}", config_path.display());
    println!("Archive:       {}", config.db_path);
    println!("Media dir:     {}", config.media_dir);
    println!("Accounts:      {}", config.accounts.len());
    println!(
        "Deduplication: {} (near-duplicates: {})",
        if config.forwarding.enable_deduplication { "enabled" } else { "disabled" },
        if config.deduplication.enable_near_duplicates { "enabled" } else { "disabled" },
    );
    println!("Messages archived: {}", archive.message_count()?);
    println!(
        "Pending queue rows: {}",
        archive.pending_file_forward_queue()?.len()
    );
    Ok(())
}

/// Accessor kept local to the binary: the pool is owned by the forwarder.
fn forwarder_pool(forwarder: &Arc<Forwarder>) -> Arc<ClientPool> {
    forwarder.client_pool().clone()
}

fn prompt(message: &str) -> Result<String> {
    use std::io::Write;
    print!("{}", message);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
