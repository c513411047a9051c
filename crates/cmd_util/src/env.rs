//! Process bootstrap shared by the daemon and its companion tools:
//! environment overrides for tunables, and tracing initialization with an
//! optional file sink for installs that keep an audit log next to the key
//! store.

use std::{
    env,
    fmt::Debug,
    fs::OpenOptions,
    io,
    path::PathBuf,
    str::FromStr,
};

use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::MakeWriter,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

/// Environment variable naming the daemon's secondary log file. When set,
/// everything the console layer sees is also appended there, uncolored.
pub const LOG_FILE_VAR: &str = "ENROLLD_LOG_FILE";

/// Environment variable switching console output to JSON lines
/// (`ENROLLD_LOG_FORMAT=json`); anything else means the compact format.
pub const LOG_FORMAT_VAR: &str = "ENROLLD_LOG_FORMAT";

/// Reads a tunable from the environment, keeping the built-in default when
/// the variable is unset or unparseable. Every knob in `common::knobs`
/// resolves through here.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    T::Err: Debug,
{
    let Ok(raw) = env::var(name) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => {
            tracing::info!("Knob {name} set to {value:?} from the environment");
            value
        },
        Err(e) => {
            tracing::warn!("Ignoring {name}={raw} ({e:?}); keeping the default {default:?}");
            default
        },
    }
}

/// Keeps the background log-file worker alive; hold it for as long as the
/// process should keep logging.
pub struct TracingGuard {
    _file_worker: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Tracing for the long-running daemon: info and up on stdout.
pub fn config_service() -> TracingGuard {
    init_tracing(io::stdout, Level::INFO)
}

/// Tracing for one-shot companion tools: errors only, on stderr.
pub fn config_tool() -> TracingGuard {
    init_tracing(io::stderr, Level::ERROR)
}

fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(default_level).into())
        .from_env_lossy()
}

fn init_tracing<W>(writer: W, default_level: Level) -> TracingGuard
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let console = tracing_subscriber::fmt::layer()
        .with_ansi(env::var("NO_COLOR").is_err())
        .with_writer(writer);
    let console = if env::var(LOG_FORMAT_VAR).is_ok_and(|format| format == "json") {
        console.json().with_filter(env_filter(default_level)).boxed()
    } else {
        console.compact().with_filter(env_filter(default_level)).boxed()
    };
    let mut layers = vec![console];

    let mut file_worker = None;
    if let Some(path) = env::var_os(LOG_FILE_VAR) {
        let path = PathBuf::from(path);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                let (file_writer, worker) = tracing_appender::non_blocking(file);
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(file_writer)
                        .with_filter(env_filter(default_level))
                        .boxed(),
                );
                file_worker = Some(worker);
            },
            // Tracing isn't up yet, so this one goes to stderr directly.
            Err(e) => eprintln!("enrolld: cannot open log file {}: {e}", path.display()),
        }
    }

    tracing_subscriber::registry().with(layers).init();
    TracingGuard {
        _file_worker: file_worker,
    }
}

/// Best-effort initialization for tests, where an earlier test has usually
/// installed a subscriber already.
pub fn config_test() {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
