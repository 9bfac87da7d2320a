//! Rendezvous - durable wait/notify correlation engine
//!
//! Lets one party register interest in the completion of N asynchronous
//! operations, identified by correlation ids, and have a callback fire
//! exactly once when all N results have been reported, across processes
//! and restarts.

pub mod bus;
pub mod config;
pub mod model;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod storage;
pub mod utils;

pub use model::{NotifyResponse, Payload, ProgressUpdate, ResponseMap, WaitInstance, WaitQueue};
pub use registry::{CallbackError, CallbackRegistry, NotifyCallback};
pub use runtime::{Runtime, RuntimeBuilder};
pub use services::WaitNotifyEngine;
