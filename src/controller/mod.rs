//! Reconcile controller
//!
//! Turns store change events into reconcile keys and runs them on a worker
//! pool through a deduplicating queue.

mod daemon;
mod queue;

pub use daemon::{
    Controller, ControllerCommand, ControllerConfig, ControllerEvent, DEFAULT_EVENT_CHANNEL_CAPACITY,
    DEFAULT_RESYNC_INTERVAL, DEFAULT_WORKERS,
};
pub use queue::WorkQueue;
