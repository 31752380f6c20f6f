//! Retry and circuit breaking for operations that wrap subprocesses
//!
//! - **Classify**: map an error to a failure category and retryability
//! - **Patterns**: remember what each category looked like and what fixed it
//! - **Coordinator**: adaptive exponential backoff with jitter and cancellation
//! - **Circuit**: stop calling a dependency that keeps failing
//!
//! The coordinator and the breaker are independent; wrap a breaker call in
//! `with_retry` to get both. An open circuit classifies as `circuit_open`,
//! which is not retried unless listed in `retryable_kinds`.

pub mod circuit;
pub mod classify;
pub mod coordinator;
pub mod patterns;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError, CircuitState};
pub use classify::{classify, Classification, FailureCategory, RetryableError};
pub use coordinator::{
    backoff_delay, RetryConfig, RetryCoordinator, RetryFailure, RetryOptions, RetryResult, TaskComplexity,
    TaskContext,
};
pub use patterns::{FailurePattern, FailurePatternDetector, RetryStrategy};
