pub mod directory;
pub mod events;
pub mod structured;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use directory::{LogDirectoryManager, RunDirectory, RunMetadata};
pub use events::DomainEventLogger;
pub use structured::StructuredLogger;

/// Correlation scope for one engine run.
///
/// Created by the engine constructor, shared read-only with every logger and
/// component. `engine_now` tracks the current engine timestamp so log
/// records carry both simulated and wall-clock time.
#[derive(Debug)]
pub struct RunContext {
    pub correlation_id: String,
    pub pid: u32,
    pub mode: String,
    pub capital: f64,
    pub started_at: DateTime<Utc>,
    engine_now: AtomicU64,
}

impl RunContext {
    pub fn new(mode: &str, capital: f64) -> Self {
        Self {
            correlation_id: Uuid::new_v4().simple().to_string(),
            pid: std::process::id(),
            mode: mode.to_string(),
            capital,
            started_at: Utc::now(),
            engine_now: AtomicU64::new(0),
        }
    }

    pub fn engine_now(&self) -> u64 {
        self.engine_now.load(Ordering::Relaxed)
    }

    pub fn set_engine_now(&self, timestamp: u64) {
        self.engine_now.store(timestamp, Ordering::Relaxed);
    }
}

/// Install the console tracing subscriber (idempotent). Honors `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init();
}
