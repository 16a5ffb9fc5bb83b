pub mod config;
pub mod output;
pub mod zfs;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

use config::Config;
use zfs::{
    BasePreference, Cancellation, DatasetAddress, Endpoint, Planner, Replicator,
    ReplicationError, RetentionRule, SnapshotAddress, SnapshotRequest, SystemRunner,
    TransferOptions,
};

pub const LOG_ENV: &str = "ZRELAY_LOG";

static LONG_VERSION: Lazy<String> = Lazy::new(|| {
    format!(
        "{}\ncommit: {}\nbuilt: {}\ntarget: {}",
        env!("CARGO_PKG_VERSION"),
        option_env!("ZRELAY_GIT_COMMIT").unwrap_or("unknown"),
        option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown"),
        option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
    )
});

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "zrelay",
    version,
    long_version = LONG_VERSION.as_str(),
    about = "Create, replicate, and prune ZFS snapshots across hosts"
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Print machine-readable JSON reports
    #[arg(long, global = true)]
    pub json: bool,

    /// Path to config.toml (overrides ZRELAY_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by `send` and `sync`.
#[derive(Args, Debug, Clone, Default)]
pub struct TransferArgs {
    /// Command inserted between send and receive, run on this host (repeatable)
    #[arg(long = "pipe", value_name = "CMD")]
    pub pipes: Vec<String>,

    /// Extra option for `zfs send` (repeatable)
    #[arg(long = "send-opt", value_name = "OPT", allow_hyphen_values = true)]
    pub send_opts: Vec<String>,

    /// Extra option for `zfs receive` (repeatable)
    #[arg(long = "recv-opt", value_name = "OPT", allow_hyphen_values = true)]
    pub recv_opts: Vec<String>,

    /// SSH option for the source host (repeatable)
    #[arg(long = "source-ssh-opt", value_name = "OPT")]
    pub source_ssh_opts: Vec<String>,

    /// SSH option for the target host (repeatable)
    #[arg(long = "target-ssh-opt", value_name = "OPT")]
    pub target_ssh_opts: Vec<String>,

    /// Print the pipeline instead of running it
    #[arg(long)]
    pub dry_run: bool,

    /// Bandwidth limit passed to the shaping command, e.g. 10M
    #[arg(long, value_name = "RATE")]
    pub bwlimit: Option<String>,

    /// Prefer a bookmark over a snapshot of the same name as incremental base
    #[arg(long)]
    pub prefer_bookmark: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one snapshot to a target dataset
    Send {
        /// Source snapshot, [user@host:]dataset@snapshot
        source: String,
        /// Target dataset, [user@host:]dataset
        target: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Send every source snapshot newer than the target's latest
    Sync {
        /// Source dataset, [user@host:]dataset
        source: String,
        /// Target dataset, [user@host:]dataset
        target: String,
        /// Only consider snapshots whose name matches this regex
        #[arg(long, value_name = "REGEX")]
        filter: Option<String>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Create a snapshot (and bookmark) of a dataset
    Snapshot {
        /// Dataset, [user@host:]dataset
        dataset: String,
        /// Name template; {datetime} is replaced by the current time
        #[arg(long, value_name = "TEMPLATE")]
        name: Option<String>,
        /// Suffix appended as _TAG, used by retention rules
        #[arg(long)]
        tag: Option<String>,
        /// Also create a bookmark of the snapshot
        #[arg(long, overrides_with = "no_bookmark")]
        bookmark: bool,
        /// Do not create a bookmark
        #[arg(long, overrides_with = "bookmark")]
        no_bookmark: bool,
        /// strftime format for {datetime}
        #[arg(long, value_name = "FMT")]
        time_format: Option<String>,
        /// SSH option (repeatable)
        #[arg(long = "ssh-opt", value_name = "OPT")]
        ssh_opts: Vec<String>,
    },
    /// Destroy snapshots not kept by retention rules
    Prune {
        /// Dataset, [user@host:]dataset
        dataset: String,
        /// Keep the newest COUNT snapshots matching PATTERN (repeatable)
        #[arg(long, num_args = 2, value_names = ["PATTERN", "COUNT"], action = ArgAction::Append)]
        keep: Vec<String>,
        /// List the destroy commands without running them
        #[arg(long)]
        dry_run: bool,
        /// SSH option (repeatable)
        #[arg(long = "ssh-opt", value_name = "OPT")]
        ssh_opts: Vec<String>,
    },
    /// List snapshots and bookmarks of a dataset
    List {
        /// Dataset, [user@host:]dataset
        dataset: String,
        /// Only show names matching this regex
        #[arg(long, value_name = "REGEX")]
        filter: Option<String>,
        /// Include bookmarks
        #[arg(long)]
        bookmarks: bool,
        /// Omit snapshots
        #[arg(long)]
        no_snapshots: bool,
        /// SSH option (repeatable)
        #[arg(long = "ssh-opt", value_name = "OPT")]
        ssh_opts: Vec<String>,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "zrelay", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::Send {
            source,
            target,
            transfer,
        } => {
            let source: SnapshotAddress = source.parse().map_err(ReplicationError::from)?;
            let target: DatasetAddress = target.parse().map_err(ReplicationError::from)?;
            let source_endpoint = endpoint(&config, source.dataset, &transfer.source_ssh_opts);
            let target_endpoint = endpoint(&config, target, &transfer.target_ssh_opts);
            let options = transfer_options(&config, &transfer);
            let planner = planner(&transfer);
            let snapshot = source.snapshot;

            let outcome = blocking(move |runner| {
                Replicator::new(runner).with_planner(planner).send(
                    &source_endpoint,
                    &snapshot,
                    &target_endpoint,
                    &options,
                )
            })
            .await?;
            output::print_send(&mut std::io::stdout(), &outcome, json)?;
        }
        Commands::Sync {
            source,
            target,
            filter,
            transfer,
        } => {
            let source: DatasetAddress = source.parse().map_err(ReplicationError::from)?;
            let target: DatasetAddress = target.parse().map_err(ReplicationError::from)?;
            let filter = config.filter(filter.as_deref())?;
            let source_endpoint = endpoint(&config, source, &transfer.source_ssh_opts);
            let target_endpoint = endpoint(&config, target, &transfer.target_ssh_opts);
            let options = transfer_options(&config, &transfer);
            let planner = planner(&transfer);

            let mut report = blocking(move |runner| {
                Replicator::new(runner).with_planner(planner).sync(
                    &source_endpoint,
                    &target_endpoint,
                    &filter,
                    &options,
                )
            })
            .await?;
            output::print_sync(&mut std::io::stdout(), &report, json)?;
            if let Some(err) = report.halted.take() {
                return Err(err.into());
            }
        }
        Commands::Snapshot {
            dataset,
            name,
            tag,
            bookmark,
            no_bookmark,
            time_format,
            ssh_opts,
        } => {
            let dataset: DatasetAddress = dataset.parse().map_err(ReplicationError::from)?;
            let request = SnapshotRequest {
                name: name.unwrap_or_else(|| config.snapshot.name.clone()),
                tag,
                time_format: time_format.unwrap_or_else(|| config.snapshot.time_format.clone()),
                bookmark: match (bookmark, no_bookmark) {
                    (true, _) => true,
                    (_, true) => false,
                    _ => config.snapshot.bookmark,
                },
            };
            let target = endpoint(&config, dataset, &ssh_opts);
            let now = chrono::Local::now();

            let outcome =
                blocking(move |runner| zfs::create_snapshot(runner, &target, &request, &now))
                    .await?;
            output::print_snapshot(&mut std::io::stdout(), &outcome, json)?;
        }
        Commands::Prune {
            dataset,
            keep,
            dry_run,
            ssh_opts,
        } => {
            let dataset: DatasetAddress = dataset.parse().map_err(ReplicationError::from)?;
            let rules = if keep.is_empty() {
                config.prune_rules(&dataset)?
            } else {
                keep_rules(&keep)?
            };
            if rules.is_empty() {
                tracing::warn!(dataset = %dataset, "no retention rules; nothing will be destroyed");
            }
            let target = endpoint(&config, dataset, &ssh_opts);

            let report =
                blocking(move |runner| zfs::prune(runner, &target, &rules, dry_run)).await?;
            output::print_prune(&mut std::io::stdout(), &report, json)?;
            report.into_result()?;
        }
        Commands::List {
            dataset,
            filter,
            bookmarks,
            no_snapshots,
            ssh_opts,
        } => {
            let dataset: DatasetAddress = dataset.parse().map_err(ReplicationError::from)?;
            let filter = filter
                .as_deref()
                .map(|pattern| {
                    regex::Regex::new(pattern)
                        .map_err(|e| ReplicationError::invalid_pattern(pattern, &e))
                })
                .transpose()?;
            let target = endpoint(&config, dataset, &ssh_opts);

            let inventory =
                blocking(move |runner| zfs::InventoryReader::new(runner).list_snapshots(&target))
                    .await?;
            let view = output::ListView {
                snapshots: !no_snapshots,
                bookmarks,
            };
            output::print_list(
                &mut std::io::stdout(),
                &inventory,
                filter.as_ref(),
                view,
                json,
            )?;
        }
        Commands::Completions { .. } | Commands::Man => {}
    }
    Ok(())
}

fn endpoint(config: &Config, address: DatasetAddress, cli_ssh_opts: &[String]) -> Endpoint {
    let ssh_options = config.ssh_options_for(address.remote.as_ref(), cli_ssh_opts);
    Endpoint::new(address, ssh_options)
}

fn transfer_options(config: &Config, args: &TransferArgs) -> TransferOptions {
    let mut send_options = config.transfer.send_options.clone();
    send_options.extend(args.send_opts.iter().cloned());
    let mut recv_options = config.transfer.recv_options.clone();
    recv_options.extend(args.recv_opts.iter().cloned());
    TransferOptions {
        send_options,
        recv_options,
        pipes: args.pipes.clone(),
        bandwidth_limit: args.bwlimit.clone(),
        shaper: config.transfer.shaper.clone(),
        resumable: config.transfer.resumable,
        dry_run: args.dry_run,
    }
}

fn planner(args: &TransferArgs) -> Planner {
    Planner::new(if args.prefer_bookmark {
        BasePreference::Bookmark
    } else {
        BasePreference::Snapshot
    })
}

/// Pair up `--keep PATTERN COUNT` values.
fn keep_rules(values: &[String]) -> Result<Vec<RetentionRule>> {
    values
        .chunks(2)
        .map(|pair| -> Result<RetentionRule> {
            let [pattern, count] = pair else {
                return Err(Cli::command()
                    .error(ErrorKind::WrongNumberOfValues, "--keep takes PATTERN COUNT")
                    .into());
            };
            let keep: usize = count.parse().map_err(|_| {
                Cli::command().error(
                    ErrorKind::ValueValidation,
                    format!("--keep count '{count}' is not a non-negative integer"),
                )
            })?;
            Ok(RetentionRule::new(pattern, keep)?)
        })
        .collect()
}

/// Run blocking engine work off the async runtime, racing it against
/// SIGINT/SIGTERM.
///
/// On a signal the runner kills whatever stages are still running and the
/// task is awaited, so no child outlives the process.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SystemRunner) -> Result<T, ReplicationError> + Send + 'static,
{
    let cancellation = Cancellation::default();
    let runner = SystemRunner::new(cancellation.clone());
    let mut task = tokio::task::spawn_blocking(move || work(&runner));
    tokio::select! {
        joined = &mut task => Ok(joined.context("replication task panicked")??),
        () = shutdown_signal() => {
            tracing::warn!("interrupted, stopping");
            cancellation.cancel();
            let _ = task.await;
            Err(ReplicationError::Interrupted.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
