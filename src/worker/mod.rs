//! GPU-aware polling worker.
//!
//! A worker repeatedly checks local GPU load, asks the queue manager for the
//! next job, runs it against a chat model backend, and reports the outcome.
//!
//! # Components
//!
//! - [`WorkerCore`]: the polling loop (admission, retry/backoff, execution, reporting)
//! - [`WorkerControl`]: cancellation flag and pause gate shared with the host
//! - [`QueueApi`] / [`HttpQueueClient`]: calls to the queue manager
//! - [`ChatBackend`] / [`OllamaBackend`]: calls to the model server
//! - [`ResourceSampler`] / [`NvidiaSmiSampler`]: GPU utilization for admission control
//! - [`WorkerObserver`]: lifecycle hooks; [`BroadcastObserver`] turns them into [`WorkerEvent`]s
//! - `WorkerEngine` (feature `engine`): runs the core on its own thread with a stats publisher

pub mod backend;
pub mod client;
pub mod control;
pub mod core;
#[cfg(feature = "engine")]
pub mod engine;
pub mod events;
pub mod gpu;
pub mod stats;

pub use backend::{tags_url, ChatBackend, OllamaBackend};
pub use client::{HttpQueueClient, JobReport, QueueApi};
pub use control::WorkerControl;
pub use core::WorkerCore;
#[cfg(feature = "engine")]
pub use engine::{CoreFactory, WorkerEngine};
pub use events::{BroadcastObserver, NoopObserver, WorkerEvent, WorkerObserver};
pub use gpu::{parse_utilization, NvidiaSmiSampler, ResourceSampler};
pub use stats::{StatsSnapshot, StatusHandle, WorkerState, WorkerStats};
