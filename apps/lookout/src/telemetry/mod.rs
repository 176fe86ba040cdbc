use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

static PERF_ENABLED: Lazy<bool> = Lazy::new(|| env_truthy("LOOKOUT_PERF").unwrap_or(false));

static SUMMARIES: Lazy<Mutex<HashMap<Measure, Summary>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// What the client times or counts when `LOOKOUT_PERF` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    /// Applying a remote offer through to the local answer.
    AnswerRemoteOffer,
    LocalOffer,
    /// From session creation to its first `Connected`.
    TimeToConnected,
    /// Time a clip upload sat at the high watermark.
    TransferPaused,
    ChunkSent,
}

impl Measure {
    pub fn as_str(self) -> &'static str {
        match self {
            Measure::AnswerRemoteOffer => "negotiation.answer",
            Measure::LocalOffer => "negotiation.offer",
            Measure::TimeToConnected => "session.time_to_connected",
            Measure::TransferPaused => "transfer.paused",
            Measure::ChunkSent => "transfer.chunk",
        }
    }

    /// Samples between two log lines.
    fn report_every(self) -> u64 {
        match self {
            Measure::TimeToConnected => 1,
            Measure::AnswerRemoteOffer | Measure::LocalOffer | Measure::TransferPaused => 10,
            Measure::ChunkSent => 200,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
    pub bytes: u64,
}

impl Summary {
    fn add_elapsed(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    fn add_bytes(&mut self, bytes: usize) {
        self.count += 1;
        self.bytes += bytes as u64;
    }

    pub fn average(&self) -> Duration {
        u32::try_from(self.count)
            .ok()
            .filter(|count| *count > 0)
            .map(|count| self.total / count)
            .unwrap_or_default()
    }
}

pub fn enabled() -> bool {
    *PERF_ENABLED
}

pub fn elapsed(measure: Measure, duration: Duration) {
    if enabled() {
        update(measure, |summary| summary.add_elapsed(duration));
    }
}

pub fn bytes(measure: Measure, len: usize) {
    if enabled() {
        update(measure, |summary| summary.add_bytes(len));
    }
}

pub fn summary(measure: Measure) -> Option<Summary> {
    SUMMARIES.lock().get(&measure).copied()
}

fn update(measure: Measure, apply: impl FnOnce(&mut Summary)) {
    let mut summaries = SUMMARIES.lock();
    let summary = summaries.entry(measure).or_default();
    apply(summary);
    if summary.count % measure.report_every() == 0 {
        tracing::info!(
            target = "perf",
            measure = measure.as_str(),
            count = summary.count,
            avg_ms = summary.average().as_secs_f64() * 1_000.0,
            max_ms = summary.max.as_secs_f64() * 1_000.0,
            kib = summary.bytes as f64 / 1024.0,
            "perf summary"
        );
    }
}

/// Times a scope when `LOOKOUT_PERF` is set.
pub struct PerfGuard {
    measure: Measure,
    start: Instant,
}

impl PerfGuard {
    pub fn new(measure: Measure) -> Option<Self> {
        enabled().then(|| Self {
            measure,
            start: Instant::now(),
        })
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        elapsed(self.measure, self.start.elapsed());
    }
}

#[cfg(test)]
mod summary_tests {
    use super::*;

    #[test]
    fn summary_tracks_average_and_max() {
        let mut summary = Summary::default();
        assert_eq!(summary.average(), Duration::ZERO);
        summary.add_elapsed(Duration::from_millis(10));
        summary.add_elapsed(Duration::from_millis(30));
        assert_eq!(summary.count, 2);
        assert_eq!(summary.average(), Duration::from_millis(20));
        assert_eq!(summary.max, Duration::from_millis(30));
    }

    #[test]
    fn summary_counts_bytes() {
        let mut summary = Summary::default();
        summary.add_bytes(16_384);
        summary.add_bytes(1_000);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.bytes, 17_384);
    }

    #[test]
    fn connection_time_is_always_reported() {
        assert_eq!(Measure::TimeToConnected.report_every(), 1);
        assert!(Measure::ChunkSent.report_every() > Measure::LocalOffer.report_every());
    }
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let (env_filter, throttled_deps) = build_env_filter(config.level.to_filter());

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        if throttled_deps {
            tracing::info!(
                "suppressing dependency trace noise; set LOOKOUT_TRACE_DEPS=1 or LOOKOUT_LOG_FILTER to override"
            );
        }
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> (EnvFilter, bool) {
        if let Ok(filter) = std::env::var("LOOKOUT_LOG_FILTER") {
            return (EnvFilter::new(filter), false);
        }
        let (filter, throttled) = default_filter_for(level, allow_dependency_traces());
        (EnvFilter::new(filter), throttled)
    }

    const TRACE_DEP_TARGETS: &[&str] = &[
        "tokio_tungstenite",
        "tungstenite",
        "webrtc",
        "webrtc_ice",
        "webrtc_sctp",
        "webrtc_dtls",
        "webrtc_srtp",
        "webrtc_mdns",
        "mio",
    ];

    pub(crate) fn default_filter_for(level: LevelFilter, allow_deps: bool) -> (String, bool) {
        let base = match level {
            LevelFilter::TRACE => "info,lookout_client_core=trace,lookout=trace,relay_proto=trace",
            LevelFilter::DEBUG => "info,lookout_client_core=debug,lookout=debug,relay_proto=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        if level == LevelFilter::TRACE && !allow_deps {
            (throttle_dependency_traces(base), true)
        } else {
            (base.to_owned(), false)
        }
    }

    fn allow_dependency_traces() -> bool {
        super::env_truthy("LOOKOUT_TRACE_DEPS").unwrap_or(false)
    }

    fn throttle_dependency_traces(base: &str) -> String {
        let mut filter = base.to_owned();
        for target in TRACE_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
        filter
    }

}
