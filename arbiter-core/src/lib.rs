//! # Arbiter Core Library
//!
//! In-process asynchronous lock engine.
//!
//! ## Features
//!
//! - **Modes**: exclusive acquisition and shared reader/writer acquisition on the same lock
//! - **Reentrancy**: optional, per lock; N acquisitions need N releases
//! - **Scheduling**: FIFO, round-robin, priority and weighted strategies
//! - **Deadlock detection**: wait-for graph shared by every lock of a [`LockManager`]
//! - **Priority aging**: queued requests gain priority the longer they wait
//! - **Timeouts, cancellation and backoff**: per request, with bounded retries
//! - **Diagnostics**: lifecycle events, statistics and read-only snapshots
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use arbiter_core::{AcquireOptions, Lock, LockOptions};
//!
//! # async fn example() -> arbiter_core::Result<()> {
//! let lock = Lock::new(LockOptions::default());
//!
//! let guard = lock
//!     .acquire(AcquireOptions::new().with_timeout(Duration::from_millis(50)))
//!     .await?;
//! drop(guard);
//!
//! let total = lock
//!     .run_exclusive(None, || async { Ok::<_, std::io::Error>(40 + 2) })
//!     .await?;
//! assert_eq!(total, 42);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod lock;
pub mod manager;
pub mod snapshot;
pub mod timer;

pub use config::{
    AgingOptions, ArbiterConfig, BackoffOptions, ConfigLoader, KindWeights, LockOptions,
    SchedulingStrategy, ValidateConfig,
};
pub use error::{BoxError, ConfigError, LockError, LockErrorKind, Result};
pub use events::{LockEvent, Subscription};
pub use graph::{GraphSnapshot, LockId, OwnerId, WaitForGraph};
pub use lock::{AcquireOptions, ContentionLevel, Lock, LockGuard, LockStats, RequestKind};
pub use manager::LockManager;
pub use snapshot::{LockSnapshot, QueueEntrySnapshot, StateSnapshot};
pub use timer::{ManualTimer, Timer, TimerHandle, TokioTimer};
