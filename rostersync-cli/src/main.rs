use clap::{Parser, Subcommand, ValueEnum};
use rostersync::notification::{build_notifier, Message, NotificationQueue, RetryPolicy};
use rostersync::{Daemon, EmployeeStore, Reconciler, SyncConfig};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};

/// rostersync: keep the employee store in step with the HR export file
#[derive(Parser)]
#[command(name = "rostersync", version, about)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, default_value = "rostersync.yaml")]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    /// Also append warnings and errors to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the export directory and reconcile on every change
    Watch {
        /// Directory to watch (overrides watch.path)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Store connection string (overrides store.connection_string)
        #[arg(long)]
        db: Option<String>,
    },

    /// Run a single reconciliation pass over an export file
    Run {
        /// Export file to reconcile
        file: PathBuf,
        /// Print the report instead of sending it
        #[arg(long)]
        no_notify: bool,
    },

    /// Create the employee table, optionally seeding names
    Init {
        /// File with one "Last, First" name per line
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// List stored employee names
    List,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_file.as_deref()).and_then(|_| run(cli)) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

/// Console logging for everything the filter allows; the optional file only
/// receives warnings and errors.
fn init_logging(log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let sink = match log_file {
        Some(path) => Some(WarnFileSink::open(path).map_err(|e| {
            format!("Failed to open log file '{}': {e}", path.display())
        })?),
        None => None,
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(move |buf, record| {
            let line = format!("{} {}: {}", buf.timestamp(), record.level(), record.args());
            if let Some(sink) = &sink {
                sink.record(record.level(), &line);
            }
            writeln!(buf, "{line}")
        })
        .init();
    Ok(())
}

/// Appends warning and error lines to a file.
struct WarnFileSink {
    file: Mutex<File>,
}

impl WarnFileSink {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(WarnFileSink {
            file: Mutex::new(file),
        })
    }

    fn record(&self, level: log::Level, line: &str) {
        if level > log::Level::Warn {
            return;
        }
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{line}");
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SyncConfig::load(&cli.config)?;

    match cli.command {
        Command::Watch { path, db } => {
            if let Some(path) = path {
                config.watch.path = path;
            }
            if let Some(db) = db {
                config.store.connection_string = db;
            }
            watch(config)?;
        }

        Command::Run { file, no_notify } => {
            let reconciler = Reconciler::new(open_store(&config)?);
            let summary = reconciler.run_pass(&file)?;

            if no_notify {
                print!("{}", summary.report);
            } else if !summary.report.is_empty() {
                let queue = start_queue(&config)?;
                let message = Message::for_report(
                    &config.notify,
                    &summary.report,
                    chrono::Local::now().date_naive(),
                );
                queue.enqueue(message);
                queue.shutdown();
            }
            print_output(&serde_json::to_value(&summary)?, &cli.format)?;
        }

        Command::Init { seed } => {
            let store = open_store(&config)?;
            let inserted = match seed {
                Some(path) => store.seed(&read_seed_names(&path)?)?,
                None => 0,
            };
            print_output(
                &serde_json::json!({ "ok": true, "table": store.table(), "seeded": inserted }),
                &cli.format,
            )?;
        }

        Command::List => {
            let names = open_store(&config)?.list_names()?;
            print_output(&serde_json::json!(names), &cli.format)?;
        }
    }

    Ok(())
}

/// Run the daemon on a blocking thread until Ctrl-C, then let it finish the
/// in-flight pass and flush notifications.
fn watch(config: SyncConfig) -> Result<(), Box<dyn std::error::Error>> {
    let reconciler = Arc::new(Reconciler::new(open_store(&config)?));
    let daemon = Daemon::new(&config, reconciler, start_queue(&config)?);
    let stop = daemon.stop_handle();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let mut task = tokio::task::spawn_blocking(move || daemon.run());
        tokio::select! {
            res = &mut task => return res,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupt received; stopping after the current pass");
                stop.stop();
            }
        }
        task.await
    })??;
    Ok(())
}

fn open_store(config: &SyncConfig) -> rostersync::Result<EmployeeStore> {
    EmployeeStore::open(
        &config.store.connection_string,
        &config.store.table,
        config.store.busy_timeout(),
    )
}

fn start_queue(config: &SyncConfig) -> rostersync::Result<NotificationQueue> {
    let notifier = build_notifier(&config.notify)?;
    Ok(NotificationQueue::start(
        notifier,
        config.notify.queue_capacity,
        RetryPolicy::from_config(&config.notify),
    ))
}

fn read_seed_names(path: &Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read seed file '{}': {e}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
