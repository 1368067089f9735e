//! Benchmark execution engine

pub mod executor;
pub mod rate_limiter;

pub use executor::{
    ConsoleProgress, Executor, ExecutorConfig, NoOpProgress, PairingAbort, ProgressCallback, SessionReport,
    TransitionError, TrialProgress, TrialStage,
};
pub use rate_limiter::RateLimiter;
