//! Tracing setup for loop binaries.
//!
//! Dosing decisions must be reconstructable after the fact. Every process
//! start mints a `run_id`; file logs land in `logs/<run_id>.log` and the
//! same id is meant to name the decision-record JSONL, so a log line and
//! the decision that produced it can be joined offline. Stdout stays
//! quiet (WARN and up) no matter what `RUST_LOG` says; the detail lives
//! in the file.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Handle for an initialized telemetry run.
///
/// Holds the non-blocking writer guard; dropping it loses buffered file
/// logs, so keep it alive for the whole process.
pub struct Telemetry {
    run_id: String,
    log_path: PathBuf,
    _guard: WorkerGuard,
}

impl Telemetry {
    /// Run identifier to share with the decision log for offline joins.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

/// Install the global subscriber for a loop binary.
///
/// The stdout layer is clamped to WARN so a five-minute tick loop cannot
/// flood a supervising terminal; `RUST_LOG` shapes only the file layer,
/// which defaults to full detail for insuloop crates and WARN for
/// dependencies.
pub fn init(service: &str) -> Telemetry {
    let run_id = format!("{}_{}", service, chrono::Utc::now().format("%Y%m%d_%H%M%S"));
    let log_dir = PathBuf::from("logs");
    // File logging is best effort; the WARN stdout layer works regardless.
    let _ = fs::create_dir_all(&log_dir);
    let log_path = log_dir.join(format!("{run_id}.log"));

    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        &log_dir,
        format!("{run_id}.log"),
    ));

    let file_detail =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("insuloop=debug,warn"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .without_time()
                .with_target(false)
                .with_filter(LevelFilter::WARN),
        )
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_detail),
        )
        .init();

    tracing::info!(run_id = %run_id, log = %log_path.display(), "loop telemetry ready");

    Telemetry {
        run_id,
        log_path,
        _guard: guard,
    }
}
