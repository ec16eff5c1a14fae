//! Client side of voxrun task orchestration.
//!
//! Tasks are registered in a [`TaskRegistry`] before any network call, then
//! driven by per-task progress channels ([`ProgressHub`]) and reconciled
//! against the service ([`Reconciler`], [`QueueStreamSync`]).
//! [`QueueController`] is the entry point for producers and the queue view;
//! [`CleaningPipeline`] cleans text either locally or on the service.

pub mod channel;
pub mod cleaning;
pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod preset;
pub mod reconcile;
pub mod registry;
pub mod service;
pub mod sse;

#[cfg(test)]
mod testing;

pub use channel::{ChannelHandle, ProgressHub, CONNECTION_LOST};
pub use cleaning::{split_chunks, ChunkGenerator, CleaningBackend, CleaningPipeline, PREVIEW_CHARS};
pub use config::ClientConfig;
pub use controller::{QueueController, TaskObserver};
pub use error::ClientError;
pub use http::HttpTaskService;
pub use preset::{CleaningOptions, CleaningPreset};
pub use reconcile::{PollReport, QueueStreamSync, Reconciler};
pub use registry::{PrioritySnapshot, RegistryEvent, TaskRegistry};
pub use service::{
    ChainStep, CleaningRequest, JobList, ListFilter, ProgressStream, QueueStream, SubmitRequest,
    TaskService,
};
pub use sse::{sse_frames, SseFrame, SseParser};
