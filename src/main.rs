use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use clap::{Args, Parser, Subcommand};
use playlog::aggregate::{QueryOutcome, aggregate_named, day_keys, format_playtime};
use playlog::config::{EffectiveConfig, default_config_yaml, load_effective_config};
use playlog::downtime::DowntimeTracker;
use playlog::reconcile::Reconciler;
use playlog::source::{A2sSource, JsonFileSource, Snapshot, SnapshotSource};
use playlog::store::DayLogStore;
use playlog::tracker::Tracker;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DATA_DIR_NAME: &str = ".playlog";
const CONFIG_FILE: &str = "config.yml";
const STATS_DIR: &str = "stats";
const CYCLE_STAMP_FILE: &str = "server_time.json";
const LOG_ENV: &str = "PLAYLOG_LOG";

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "playlog")]
#[command(about = "Reconstructs per-day player sessions from game server snapshots")]
struct Cli {
    #[arg(long, global = true)]
    global: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    Poll(PollArgs),
    Watch(WatchArgs),
    Status(StatusArgs),
    Stats(StatsArgs),
}

#[derive(Args, Debug)]
struct PollArgs {
    /// Read the snapshot from a JSON file instead of querying the server.
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Cycle time (RFC 3339) instead of the wall clock.
    #[arg(long)]
    now: Option<String>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    interval: Option<u64>,
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(long)]
    snapshot: Option<PathBuf>,
    #[arg(long)]
    pretty: bool,
}

#[derive(Args, Debug)]
struct StatsArgs {
    /// today, yesterday, this_week or this_month
    period: String,
    #[arg(long)]
    now: Option<String>,
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Clone)]
struct DataPaths {
    root: PathBuf,
    stats: PathBuf,
    cycle_stamp: PathBuf,
    data_config: PathBuf,
    user_config: Option<PathBuf>,
    mode: StorageMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageMode {
    Local,
    Global,
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let paths = data_paths(&cwd, cli.global)?;
    match cli.command {
        Command::Init => cmd_init(&paths),
        Command::Poll(args) => cmd_poll(&paths, args),
        Command::Watch(args) => cmd_watch(&paths, args),
        Command::Status(args) => cmd_status(&paths, args),
        Command::Stats(args) => cmd_stats(&paths, args),
    }
}

fn cmd_init(paths: &DataPaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.stats).map_err(|err| CliError::io("mkdir_error", err))?;
    if !paths.data_config.exists() {
        fs::write(&paths.data_config, default_config_yaml())
            .map_err(|err| CliError::io("write_error", err))?;
    }

    let mode = match paths.mode {
        StorageMode::Local => "local",
        StorageMode::Global => "global",
    };
    print_json(&json!({
        "status": "ok",
        "data_dir": paths.root,
        "stats_dir": paths.stats,
        "config": paths.data_config,
        "mode": mode,
    }))
}

fn cmd_poll(paths: &DataPaths, args: PollArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let config = load_config(paths)?;
    let now = resolve_now(args.now.as_deref(), &config)?;
    let tracker = build_tracker(paths, &config, snapshot_source(&config, args.snapshot));

    let report = tracker
        .run_cycle(now)
        .map_err(|err| CliError::new("cycle_error", err.to_string()))?;
    print_json(&json!({
        "status": "ok",
        "cycle": report,
    }))
}

fn cmd_watch(paths: &DataPaths, args: WatchArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let config = load_config(paths)?;
    let interval = args
        .interval
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(config.poll_interval);
    let tracker = build_tracker(paths, &config, snapshot_source(&config, args.snapshot));
    let cache = tracker.cache();

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::SeqCst))
        .map_err(|err| CliError::new("signal_error", err.to_string()))?;

    info!(
        server = %config.server,
        interval_secs = interval.as_secs(),
        "tracking started, press Ctrl+C to stop"
    );
    let stats = tracker.run_until(interval, &stop);

    print_json(&json!({
        "status": "stopped",
        "cycles": stats.cycles,
        "failures": stats.failures,
        "last_player_count": cache.latest().map(|snapshot| snapshot.players.len()),
    }))
}

fn cmd_status(paths: &DataPaths, args: StatusArgs) -> Result<(), CliError> {
    let config = load_config(paths)?;
    let snapshot = snapshot_source(&config, args.snapshot)
        .fetch()
        .map_err(|err| CliError::new("source_error", err.to_string()))?;

    if args.pretty {
        print_pretty_status(&snapshot);
        return Ok(());
    }

    let players = snapshot
        .players
        .iter()
        .map(|player| {
            json!({
                "name": player.name,
                "duration": player.elapsed_seconds,
                "score": player.score,
                "played": player.elapsed_seconds.map(format_playtime),
            })
        })
        .collect::<Vec<_>>();
    print_json(&json!({
        "status": "ok",
        "info": snapshot.info,
        "players": players,
    }))
}

fn cmd_stats(paths: &DataPaths, args: StatsArgs) -> Result<(), CliError> {
    require_initialized_paths(paths)?;
    let config = load_config(paths)?;
    let today = resolve_now(args.now.as_deref(), &config)?.date_naive();
    let store = DayLogStore::new(&paths.stats, config.stats_prefix.as_str());

    let outcome = aggregate_named(&store, &args.period, today)
        .map_err(|err| CliError::new("store_error", err.to_string()))?;
    match outcome {
        QueryOutcome::Ranked {
            period,
            days,
            results,
        } => {
            if args.pretty {
                println!("{} player stats", period.as_str());
                for (rank, entry) in results.iter().enumerate() {
                    println!(
                        "{}  {} | {} | {}",
                        rank + 1,
                        entry.name,
                        format_playtime(entry.total_seconds),
                        entry.total_score
                    );
                }
                return Ok(());
            }
            let results = results
                .iter()
                .map(|entry| {
                    json!({
                        "name": entry.name,
                        "total_seconds": entry.total_seconds,
                        "total_score": entry.total_score,
                        "played": format_playtime(entry.total_seconds),
                    })
                })
                .collect::<Vec<_>>();
            print_json(&json!({
                "status": "ok",
                "period": period.as_str(),
                "days": day_keys(&days),
                "results": results,
            }))
        }
        QueryOutcome::Rejected(rejection) => {
            if args.pretty {
                println!("{rejection}");
                return Ok(());
            }
            let mut payload = serde_json::to_value(&rejection)?;
            if let Value::Object(map) = &mut payload {
                map.insert("status".to_string(), json!("rejected"));
                map.insert("message".to_string(), json!(rejection.to_string()));
            }
            print_json(&payload)
        }
    }
}

fn print_pretty_status(snapshot: &Snapshot) {
    if let Some(info) = &snapshot.info {
        println!("Server: {}", info.server_name);
        println!("Map: {}", info.map);
        println!("Players: {} / {}", info.player_count, info.max_players);
    }
    if snapshot.players.is_empty() {
        return;
    }
    println!();
    println!("{:<24}| PLAYED", "PLAYER");
    for player in &snapshot.players {
        let name = match player.name.as_deref().map(str::trim) {
            Some("") | None => "NoName",
            Some(name) => name,
        };
        let played = player
            .elapsed_seconds
            .map(format_playtime)
            .unwrap_or_default();
        println!("{:<24}| {played}", name.chars().take(23).collect::<String>());
    }
}

fn build_tracker<S: SnapshotSource>(
    paths: &DataPaths,
    config: &EffectiveConfig,
    source: S,
) -> Tracker<S> {
    Tracker::new(
        source,
        DayLogStore::new(&paths.stats, config.stats_prefix.as_str()),
        DowntimeTracker::new(&paths.cycle_stamp),
        Reconciler::new(config.min_session_gap_secs),
        config.utc_offset,
    )
}

fn snapshot_source(config: &EffectiveConfig, snapshot: Option<PathBuf>) -> Box<dyn SnapshotSource> {
    match snapshot {
        Some(path) => Box::new(JsonFileSource::new(path)),
        None => Box::new(A2sSource::new(config.server.clone(), config.query_timeout)),
    }
}

fn resolve_now(raw: Option<&str>, config: &EffectiveConfig) -> Result<DateTime<FixedOffset>, CliError> {
    match raw {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|now| now.with_timezone(&config.utc_offset))
            .map_err(|err| CliError::new("invalid_now", format!("`{raw}`: {err}"))),
        None => Ok(Utc::now().with_timezone(&config.utc_offset)),
    }
}

fn load_config(paths: &DataPaths) -> Result<EffectiveConfig, CliError> {
    load_effective_config(Some(&paths.data_config), paths.user_config.as_deref())
        .map_err(|err| CliError::new("config_error", err.to_string()))
}

fn data_paths(cwd: &Path, global: bool) -> Result<DataPaths, CliError> {
    let home = home_dir();
    let (root, mode) = if global {
        let home = home.clone().ok_or_else(|| {
            CliError::new("home_error", "HOME environment variable is not set")
        })?;
        (home.join(DATA_DIR_NAME), StorageMode::Global)
    } else {
        (cwd.join(DATA_DIR_NAME), StorageMode::Local)
    };

    let user_config = home
        .map(|home| home.join(DATA_DIR_NAME).join(CONFIG_FILE))
        .filter(|path| *path != root.join(CONFIG_FILE));
    Ok(DataPaths {
        stats: root.join(STATS_DIR),
        cycle_stamp: root.join(CYCLE_STAMP_FILE),
        data_config: root.join(CONFIG_FILE),
        user_config,
        root,
        mode,
    })
}

fn require_initialized_paths(paths: &DataPaths) -> Result<(), CliError> {
    if !paths.root.exists() || !paths.stats.exists() {
        return Err(CliError::new(
            "not_initialized",
            "data directory is not initialized; run `playlog init`",
        ));
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
