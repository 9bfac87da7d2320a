//! Wait/notify services.
//!
//! - `engine`: the Notify API (`wait_for_all`, `notify`, `cancel`, `progress_on`)
//! - `consumer`: event handling and single-winner completion
//! - `reconciler`: periodic repair and garbage collection
//! - `progress`: delivery of intermediate progress updates

pub mod consumer;
pub mod engine;
pub mod progress;
pub mod reconciler;

pub use consumer::{ConsumeOutcome, NotifyEventConsumer};
pub use engine::{EngineConfig, EngineError, WaitNotifyEngine};
pub use progress::{ProgressConfig, ProgressDispatcher, ProgressHandle};
pub use reconciler::{Reconciler, ReconcilerConfig, ReconcilerHandle, SweepReport};
