use thiserror::Error;

/// Errors produced by the engine core.
///
/// Configuration problems fail fast at construction time. Faults raised by
/// user-provided actions and outputs are wrapped with the cycle context they
/// occurred in and surface through the motor, which transitions its slot to
/// `Errored`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("rate must be greater than 0.0, got {0}")]
    RateTooLow(f64),

    /// Scheduling is done in integer nanoseconds, so rates above 1e9 ops/s
    /// cannot be represented.
    #[error("rate must not exceed 1000000000 ops/s, got {0}")]
    RateTooHigh(f64),

    #[error("strictness must be within [0.0, 1.0], got {0}")]
    StrictnessOutOfRange(f64),

    #[error("a strict rate limiter only accepts strictness 1.0, got {0}")]
    StrictnessNotStrict(f64),

    #[error("burst ratio must be at least 1.0, got {0}")]
    BurstRatioTooLow(f64),

    #[error("invalid rate spec '{spec}': {reason}")]
    RateSpecParse { spec: String, reason: String },

    #[error("invalid activity parameter '{key}': {reason}")]
    BadParameter { key: String, reason: String },

    #[error("the async parameter was given for this activity, but its action is synchronous")]
    AsyncParamOnSyncAction,

    #[error("cycle {cycle} is outside the tracked interval [{min},{max})")]
    CycleOutOfBounds { cycle: i64, min: i64, max: i64 },

    #[error("cycle {cycle} was marked twice")]
    CycleMarkedTwice { cycle: i64 },

    #[error("error while processing cycle {cycle}: {source}")]
    Action {
        cycle: i64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("error while feeding results to output: {source}")]
    Output {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to spawn thread '{name}'")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("metrics serialization failed")]
    MetricsSerialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
