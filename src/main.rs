use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{Local, LocalResult, TimeZone, Utc};
use clap::{ArgAction, Parser, Subcommand};

use clickwheel::config::{
    Config, default_config_path, ledger_path, load_config, queue_path, save_config,
};
use clickwheel::ipod::{self, DeviceState, TrackDescriptor};
use clickwheel::ledger::{Ledger, load_ledger, save_ledger};
use clickwheel::queue::{load_queue, save_queue};
use clickwheel::scrobble::{
    count_already_synced_plays, filter_tracks_for_ledger, has_reportable_meta, prepare_scrobbles,
};
use clickwheel::service::HttpSubmitter;
use clickwheel::sync::{SyncOptions, sync_batch, sync_individually};

#[derive(Parser)]
#[command(
    name = "clickwheel",
    version,
    about = "Sync iPod play counts to a scrobbling service"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Scan(ScanArgs),
    Sync(SyncArgs),
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Parser)]
struct ScanArgs {
    #[arg(long, help = "Path to the mounted device")]
    device: Option<PathBuf>,
    #[arg(long, help = "Optional path to the library database file")]
    library: Option<PathBuf>,
    #[arg(long, help = "Optional path to the play counts file")]
    counts: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    config_path: Option<PathBuf>,
}

#[derive(Parser)]
struct SyncArgs {
    #[arg(long, help = "Path to the mounted device")]
    device: Option<PathBuf>,
    #[arg(long, help = "Optional path to the library database file")]
    library: Option<PathBuf>,
    #[arg(long, help = "Optional path to the play counts file")]
    counts: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    config_path: Option<PathBuf>,
    #[arg(
        long,
        default_value_t = false,
        help = "Submit every new play instead of at most one per track"
    )]
    repeat: bool,
    #[arg(
        long,
        default_value_t = false,
        help = "Submit track by track instead of one batch"
    )]
    individual: bool,
    #[arg(long, help = "Submission timeout in seconds (0 disables it)")]
    timeout_secs: Option<u64>,
    #[arg(
        long,
        default_value_t = false,
        help = "Plan and report without submitting"
    )]
    dry_run: bool,
    #[arg(
        long = "no-clear",
        action = ArgAction::SetFalse,
        default_value_t = true,
        help = "Do not clear the play counter file after the pass"
    )]
    clear: bool,
}

#[derive(Subcommand)]
enum QueueCommand {
    List {
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    Retry {
        #[arg(long, help = "Submission timeout in seconds (0 disables it)")]
        timeout_secs: Option<u64>,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    Clear {
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show {
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    SetDevice {
        path: PathBuf,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    SetUrl {
        url: String,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    SetSession {
        key: String,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    SetRepeat {
        enabled: bool,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Scan(args) => handle_scan(args),
        Commands::Sync(args) => handle_sync(args),
        Commands::Queue { command } => handle_queue(command),
        Commands::Config { command } => handle_config(command),
    }
}

fn resolve_device_files(
    config: &Config,
    device: Option<PathBuf>,
    library: Option<PathBuf>,
    counts: Option<PathBuf>,
) -> (PathBuf, PathBuf, PathBuf) {
    let device = device.unwrap_or_else(|| config.device_path.clone());
    let library = library.unwrap_or_else(|| device.join(ipod::LIBRARY_FILE));
    let counts = counts.unwrap_or_else(|| device.join(ipod::COUNTS_FILE));
    (device, library, counts)
}

fn decode_device(library: &Path, counts: &Path) -> Result<Vec<TrackDescriptor>> {
    let mut tracks = ipod::parse_library(library)?;
    ipod::parse_play_counts(counts, &mut tracks)?;
    Ok(tracks)
}

fn handle_scan(args: ScanArgs) -> Result<()> {
    let config_path = args.config_path.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    let explicit_files = args.library.is_some() || args.counts.is_some();
    let (device, library, counts) =
        resolve_device_files(&config, args.device, args.library, args.counts);

    if !explicit_files {
        match ipod::probe_device(&device) {
            DeviceState::NotConnected => bail!("No device mounted at {}", device.display()),
            DeviceState::NoPlays => {
                println!("Device at {} has no recorded plays.", device.display());
                return Ok(());
            }
            DeviceState::Ready => {}
        }
    }

    let tracks = decode_device(&library, &counts)?;
    let ledger = load_ledger(&ledger_path(&config_path))?;
    print_scan_report(&tracks, &ledger);
    Ok(())
}

fn print_scan_report(tracks: &[TrackDescriptor], ledger: &Ledger) {
    let pending = filter_tracks_for_ledger(tracks, ledger);
    let already_synced = count_already_synced_plays(tracks, ledger);
    let total_plays: u64 = tracks.iter().map(|track| u64::from(track.play_count)).sum();
    let listened_secs: u64 = tracks
        .iter()
        .map(|track| u64::from(track.duration_ms) / 1000 * u64::from(track.play_count))
        .sum();
    let unreportable = tracks
        .iter()
        .filter(|track| !has_reportable_meta(track))
        .count();

    println!("{} tracks in the library", tracks.len());
    println!(
        "{} plays on the device ({}h {:02}m of listening), {} already synced",
        total_plays,
        listened_secs / 3600,
        listened_secs % 3600 / 60,
        already_synced
    );
    if unreportable > 0 {
        println!("{unreportable} tracks lack title or artist and would be skipped");
    }
    if pending.is_empty() {
        println!("No new plays to sync.");
        return;
    }
    println!("{} tracks with new plays:", pending.len());
    for track in pending {
        println!(
            "  {} - {} ({} plays, last {})",
            track.artist.as_deref().unwrap_or("?"),
            track.title.as_deref().unwrap_or("?"),
            track.play_count,
            format_timestamp(track.last_played_at)
        );
    }
}

fn handle_sync(args: SyncArgs) -> Result<()> {
    let config_path = args.config_path.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    let explicit_files = args.library.is_some() || args.counts.is_some();
    let (device, library, counts) =
        resolve_device_files(&config, args.device, args.library, args.counts);

    if !explicit_files {
        match ipod::probe_device(&device) {
            DeviceState::NotConnected => bail!("No device mounted at {}", device.display()),
            DeviceState::NoPlays => {
                println!("Nothing to sync: no plays recorded at {}.", device.display());
                return Ok(());
            }
            DeviceState::Ready => {}
        }
    }

    let tracks = decode_device(&library, &counts)?;
    let allow_repeat = args.repeat || config.repeat_scrobbles;
    let ledger_file = ledger_path(&config_path);
    let mut ledger = load_ledger(&ledger_file)?;
    let now = Utc::now().timestamp();

    if args.dry_run {
        let plan = prepare_scrobbles(&tracks, allow_repeat, &ledger, now);
        println!(
            "Would submit {} scrobbles ({} tracks skipped).",
            plan.scrobbles.len(),
            plan.skipped.len()
        );
        return Ok(());
    }

    let (Some(service_url), Some(session_key)) =
        (config.service_url.as_deref(), config.session_key.as_deref())
    else {
        bail!("Service not configured. Run clickwheel config set-url and set-session first.");
    };
    let submitter = HttpSubmitter::new(service_url, session_key)?;
    let options = SyncOptions {
        allow_repeat,
        timeout: Duration::from_secs(args.timeout_secs.unwrap_or(config.submit_timeout_secs)),
    };
    let queue_file = queue_path(&config_path);
    let mut queue = load_queue(&queue_file)?;

    let outcome = if args.individual {
        sync_individually(&tracks, &mut ledger, &mut queue, &submitter, options, now)
    } else {
        sync_batch(&tracks, &mut ledger, &mut queue, &submitter, options, now)
    };

    if outcome.ledger_changed {
        save_ledger(&ledger, &ledger_file)?;
    }
    if outcome.enqueued > 0 {
        save_queue(&queue, &queue_file)?;
    }
    println!(
        "Submitted {} scrobbles, queued {} for retry, skipped {} tracks.",
        outcome.submitted, outcome.enqueued, outcome.skipped
    );

    // Failed events already sit in the retry queue; clearing is safe even
    // after a failed pass.
    if args.clear && config.clear_counts {
        ipod::clear_play_counts(&counts)
            .with_context(|| format!("Failed clearing {}", counts.display()))?;
        println!("Cleared {}", counts.display());
    }
    Ok(())
}

fn handle_queue(command: QueueCommand) -> Result<()> {
    match command {
        QueueCommand::List { config_path } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let queue = load_queue(&queue_path(&config_path))?;
            if queue.is_empty() {
                println!("Retry queue is empty.");
                return Ok(());
            }
            for item in queue.items() {
                println!(
                    "{} - {} at {} ({} attempts)",
                    item.event.artist,
                    item.event.title,
                    format_timestamp(item.event.timestamp),
                    item.attempts
                );
            }
        }
        QueueCommand::Retry {
            timeout_secs,
            config_path,
        } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let config = load_config(&config_path)?;
            let queue_file = queue_path(&config_path);
            let mut queue = load_queue(&queue_file)?;
            if queue.is_empty() {
                println!("Retry queue is empty.");
                return Ok(());
            }
            let (Some(service_url), Some(session_key)) =
                (config.service_url.as_deref(), config.session_key.as_deref())
            else {
                bail!(
                    "Service not configured. Run clickwheel config set-url and set-session first."
                );
            };
            let submitter = HttpSubmitter::new(service_url, session_key)?;
            let timeout =
                Duration::from_secs(timeout_secs.unwrap_or(config.submit_timeout_secs));
            let summary = queue.replay(&submitter, timeout);
            save_queue(&queue, &queue_file)?;
            println!(
                "Replayed queue: {} submitted, {} still pending.",
                summary.succeeded, summary.failed
            );
        }
        QueueCommand::Clear { config_path } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let queue_file = queue_path(&config_path);
            let mut queue = load_queue(&queue_file)?;
            if queue.is_empty() {
                println!("Retry queue is already empty.");
                return Ok(());
            }
            let dropped = queue.len();
            queue.clear();
            save_queue(&queue, &queue_file)?;
            println!("Dropped {dropped} queued scrobbles.");
        }
    }
    Ok(())
}

fn handle_config(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show { config_path } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let config = load_config(&config_path)?;
            println!("device_path: {}", config.device_path.display());
            println!(
                "service_url: {}",
                config.service_url.as_deref().unwrap_or("(unset)")
            );
            println!(
                "session_key: {}",
                if config.session_key.is_some() {
                    "(set)"
                } else {
                    "(unset)"
                }
            );
            println!("repeat_scrobbles: {}", config.repeat_scrobbles);
            println!("clear_counts: {}", config.clear_counts);
            println!("submit_timeout_secs: {}", config.submit_timeout_secs);
        }
        ConfigCommand::SetDevice { path, config_path } => {
            let saved_to = update_config(config_path, |config| config.device_path = path)?;
            println!("Saved device path in {}", saved_to.display());
        }
        ConfigCommand::SetUrl { url, config_path } => {
            let saved_to = update_config(config_path, |config| config.service_url = Some(url))?;
            println!("Saved service URL in {}", saved_to.display());
        }
        ConfigCommand::SetSession { key, config_path } => {
            let saved_to = update_config(config_path, |config| config.session_key = Some(key))?;
            println!("Saved session key in {}", saved_to.display());
        }
        ConfigCommand::SetRepeat {
            enabled,
            config_path,
        } => {
            let saved_to =
                update_config(config_path, |config| config.repeat_scrobbles = enabled)?;
            println!("Saved repeat preference in {}", saved_to.display());
        }
    }
    Ok(())
}

fn update_config(
    config_path: Option<PathBuf>,
    apply: impl FnOnce(&mut Config),
) -> Result<PathBuf> {
    let config_path = config_path.unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)?;
    apply(&mut config);
    save_config(&config, &config_path)?;
    Ok(config_path)
}

fn format_timestamp(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0) {
        LocalResult::Single(datetime) => datetime.format("%Y-%m-%d %H:%M").to_string(),
        _ => timestamp.to_string(),
    }
}
