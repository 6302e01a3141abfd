use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use beacon::{
    BeaconConfig, BeaconSession, FileStore, MessageKind, PlayerSnapshot, TargetInfo, TimeUnit,
    TransportEvent, WidGen, WidGenOptions, all_targets, is_beacon_capable, parse_wid_with_unit,
    resolve_active, topic_for, validate_wid_with_unit,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beacon")]
#[command(author, version, about = "WID session ids and player-state beacon", long_about = None)]
struct Cli {
    /// JSON config file (defaults to $WALDIEZ_BEACON_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate WIDs, persisting generator state in the data dir
    Next {
        #[arg(long, short = 'n', default_value_t = 1)]
        count: usize,
        #[arg(long, value_parser = parse_time_unit)]
        unit: Option<TimeUnit>,
    },
    /// Check a WID; prints true/false
    Validate {
        wid: String,
        #[arg(short = 'W', long = "width", default_value_t = 4)]
        w: usize,
        #[arg(long, value_parser = parse_time_unit, default_value = "ms")]
        unit: TimeUnit,
    },
    /// Print the components of a WID as JSON
    Parse {
        wid: String,
        #[arg(short = 'W', long = "width", default_value_t = 4)]
        w: usize,
        #[arg(long, value_parser = parse_time_unit, default_value = "ms")]
        unit: TimeUnit,
    },
    /// List built-in and custom targets
    Targets,
    /// Print the target the beacon would connect to
    Resolve,
    /// Print the MQTT topic for a session
    Topic {
        session_id: String,
        #[arg(long)]
        channel: Option<String>,
    },
    /// Run one beacon session against the resolved target
    Send {
        #[arg(long, default_value = "beacon-cli")]
        name: String,
        #[arg(long, short = 'n', default_value_t = 3)]
        count: usize,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Give up if the target is not open after this long
        #[arg(long, default_value_t = 5000)]
        connect_timeout_ms: u64,
    },
    /// Quick monotonicity check
    Selftest,
}

fn parse_time_unit(s: &str) -> Result<TimeUnit, String> {
    TimeUnit::parse(s).ok_or_else(|| "time unit must be sec or ms".to_string())
}

fn working_root() -> PathBuf {
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn print_json(value: &serde_json::Value) -> Result<(), String> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn run_next(config: &BeaconConfig, count: usize, unit: Option<TimeUnit>) -> Result<(), String> {
    let root = working_root();
    let stdout = io::stdout();
    emit_next(config, &root, count, unit, &mut stdout.lock())
}

/// Generate `count` ids, save the generator state, then write the ids.
/// The state is saved even when `out` is gone.
fn emit_next(
    config: &BeaconConfig,
    root: &std::path::Path,
    count: usize,
    unit: Option<TimeUnit>,
    out: &mut dyn Write,
) -> Result<(), String> {
    let data_dir = config.resolve_data_dir(root);
    let store = Arc::new(FileStore::in_dir(&data_dir));
    let options = WidGenOptions {
        time_unit: unit.unwrap_or(config.time_unit),
        auto_persist: false,
        ..config.wid_options()
    };
    let mut generator = WidGen::with_store(options, store).map_err(|e| e.to_string())?;

    let ids = generator.next_n(count);
    generator
        .persist()
        .map_err(|e| format!("state not saved to {}: {e}", data_dir.display()))?;
    debug!(state = ?generator.state(), "saved generator state");

    for wid in &ids {
        writeln!(out, "{wid}").map_err(|e| e.to_string())?;
    }
    out.flush().map_err(|e| e.to_string())
}

fn run_validate(wid: &str, w: usize, unit: TimeUnit) -> Result<(), String> {
    let ok = validate_wid_with_unit(wid, w, unit);
    println!("{}", if ok { "true" } else { "false" });
    if ok {
        Ok(())
    } else {
        Err("invalid wid".to_string())
    }
}

fn run_parse(wid: &str, w: usize, unit: TimeUnit) -> Result<(), String> {
    let parsed = parse_wid_with_unit(wid, w, unit).map_err(|e| e.to_string())?;
    print_json(&json!({
        "raw": parsed.raw,
        "timestamp": parsed.timestamp.to_rfc3339(),
        "sequence": parsed.sequence,
        "suffix": parsed.suffix,
        "time_unit": unit.as_str(),
    }))
}

fn target_listing(config: &BeaconConfig) -> Result<serde_json::Value, String> {
    let mut rows = Vec::new();
    for profile in all_targets(&config.settings) {
        let mut row = serde_json::to_value(&profile).map_err(|e| e.to_string())?;
        row["beaconCapable"] = json!(is_beacon_capable(&profile));
        row["active"] = json!(config.settings.active_target.as_deref() == Some(profile.id.as_str()));
        rows.push(row);
    }
    Ok(serde_json::Value::Array(rows))
}

fn resolve_target(config: &BeaconConfig) -> Result<TargetInfo, String> {
    resolve_active(&all_targets(&config.settings), &config.settings).ok_or_else(|| {
        "no beacon-capable target: add a ws/wss target, or an mqtt target with a ws:// or wss:// url"
            .to_string()
    })
}

fn run_resolve(config: &BeaconConfig) -> Result<(), String> {
    let target = resolve_target(config)?;
    print_json(&serde_json::to_value(&target).map_err(|e| e.to_string())?)
}

#[derive(Debug, Clone)]
struct SendOpts {
    name: String,
    count: usize,
    interval: Duration,
    connect_timeout: Duration,
}

async fn wait_until_open(session: &mut BeaconSession) -> Result<(), String> {
    match session.next_event().await {
        Some(TransportEvent::Open) => Ok(()),
        Some(TransportEvent::ConnectError(message)) => Err(format!("connect failed: {message}")),
        Some(TransportEvent::Close { .. }) | None => Err(session
            .last_error()
            .unwrap_or("connection closed before open")
            .to_string()),
    }
}

fn send_checked(
    session: &BeaconSession,
    kind: MessageKind,
    snapshot: &PlayerSnapshot,
) -> Result<(), String> {
    match session.send(kind, snapshot) {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!(
            "session closed: {}",
            session.last_error().unwrap_or("not live")
        )),
        Err(e) => Err(e.to_string()),
    }
}

async fn send_session(config: &BeaconConfig, opts: SendOpts) -> Result<(), String> {
    let target = resolve_target(config)?;
    let data_dir = config.resolve_data_dir(&working_root());
    let store = Arc::new(FileStore::in_dir(&data_dir));
    let mut ids = WidGen::with_store(config.wid_options(), store).map_err(|e| e.to_string())?;

    let mut session = BeaconSession::start(&mut ids, target, &config.source);
    println!("{}", session.id());
    if let Some(topic) = session.topic() {
        info!(%topic, "publishing to mqtt topic");
    }

    match tokio::time::timeout(opts.connect_timeout, wait_until_open(&mut session)).await {
        Ok(result) => result?,
        Err(_) => {
            session.stop();
            return Err(format!(
                "target {} not open after {} ms",
                session.target().url,
                opts.connect_timeout.as_millis()
            ));
        }
    }

    let mut snapshot = PlayerSnapshot {
        name: opts.name,
        playing: true,
        volume: 1.0,
        rate: 1.0,
        ..PlayerSnapshot::default()
    };
    send_checked(&session, MessageKind::Start, &snapshot)?;
    for _ in 0..opts.count {
        tokio::time::sleep(opts.interval).await;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::ZERO, session.next_event()).await
        {
            debug!(?event, "transport event");
        }
        snapshot.position += opts.interval.as_secs_f64();
        send_checked(&session, MessageKind::State, &snapshot)?;
    }
    snapshot.playing = false;
    send_checked(&session, MessageKind::Stop, &snapshot)?;

    session.stop();
    while session.next_event().await.is_some() {}
    Ok(())
}

fn run_send(config: &BeaconConfig, opts: SendOpts) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;
    runtime.block_on(send_session(config, opts))
}

fn run_selftest() -> Result<(), String> {
    let mut generator =
        WidGen::new(WidGenOptions::default()).map_err(|e| e.to_string())?;
    let ids = generator.next_n(1000);
    if ids.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err("selftest failed: non-monotonic".to_string());
    }
    if !ids.iter().all(|id| validate_wid_with_unit(id, 4, TimeUnit::Ms)) {
        return Err("selftest failed: malformed id".to_string());
    }
    println!("ok");
    Ok(())
}

fn run(cli: Cli) -> Result<(), String> {
    let config = BeaconConfig::load(cli.config.as_deref()).map_err(|e| e.to_string())?;
    match cli.command {
        Command::Next { count, unit } => run_next(&config, count, unit),
        Command::Validate { wid, w, unit } => run_validate(&wid, w, unit),
        Command::Parse { wid, w, unit } => run_parse(&wid, w, unit),
        Command::Targets => print_json(&target_listing(&config)?),
        Command::Resolve => run_resolve(&config),
        Command::Topic {
            session_id,
            channel,
        } => {
            println!("{}", topic_for(channel.as_deref(), &session_id));
            Ok(())
        }
        Command::Send {
            name,
            count,
            interval_ms,
            connect_timeout_ms,
        } => run_send(
            &config,
            SendOpts {
                name,
                count,
                interval: Duration::from_millis(interval_ms),
                connect_timeout: Duration::from_millis(connect_timeout_ms),
            },
        ),
        Command::Selftest => run_selftest(),
    }
}

fn init_logging(level: &str) {
    let fallback = format!("beacon={level}");
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&fallback)),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(err) = run(cli) {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}
