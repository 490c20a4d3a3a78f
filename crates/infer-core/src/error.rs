use thiserror::Error;

/// Rejected before any load is generated; no artifacts are written.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("generation rate must be > 0 (got {0})")]
    InvalidRate(f64),

    #[error("iteration budget must be > 0")]
    ZeroIterations,

    #[error("warm-up count {warm_up} must be smaller than the iteration budget {iterations}")]
    WarmUpTooLarge { warm_up: u64, iterations: u64 },

    #[error("latency threshold must be > 0 (got {0}s)")]
    InvalidLatencyThreshold(f64),

    #[error("queue threshold must be > 0 (got {0}us)")]
    InvalidQueueThreshold(u64),

    #[error("violation fraction must be within (0, 1] (got {0})")]
    InvalidViolationFraction(f64),

    #[error("input shape must be non-empty with non-zero dims")]
    InvalidInputShape,

    #[error("connections and per-connection queue depth must be > 0")]
    InvalidTransportSizing,

    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
}

/// Transport-level failure. Always fatal for the run: at startup nothing has
/// been measured yet, mid-run whatever was measured is flushed before exit.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http handshake with {addr}: {detail}")]
    Handshake { addr: String, detail: String },

    #[error("transport closed: {0}")]
    Closed(String),
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Terminal status of a run. SlaViolated is not a software defect: the
/// partial result set it leaves behind is valid data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    SlaViolated,
    FatalError,
}

impl Outcome {
    /// Distinct exit codes so callers can tell "ran to completion but broke
    /// the SLA" apart from "could not complete the run".
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Completed => 0,
            Outcome::FatalError => 1,
            Outcome::SlaViolated => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::SlaViolated => "sla_violated",
            Outcome::FatalError => "fatal_error",
        }
    }
}
