//! # gator-runtime
//!
//! Threads, memory and lifecycle for the gator per-core trace collector.
//!
//! This crate provides:
//! - Channel storage (one mmap'd ring per core and channel)
//! - The frame commit protocol and record marshalling
//! - The per-tick sampling and backtrace pipeline
//! - Per-core producer threads and the deferred consumer wake
//! - The lifecycle controller, consumer drain and control surface
//!
//! ## Threads
//!
//! Each core gets a `gator-core-N` thread standing in for its timer
//! interrupt; it is the only writer of that core's rings. A single
//! `gator-wake` thread turns commits into consumer wake-ups. The consumer
//! is whoever calls [`Collector::blocking_read`].

pub mod config;
pub mod platform;
pub mod store;
pub mod commit;
pub mod marshal;
mod sampling;
pub mod wake;
mod tick;
pub mod lifecycle;
pub mod drain;
pub mod control;

// Re-exports
pub use config::GatorConfig;
pub use store::{ChannelRing, ChannelStore, CoreRings};
pub use marshal::CoreWriter;
pub use wake::{BufferWait, DeferredWake};
pub use lifecycle::{Collector, CollectorBuilder, CpuEvent, Phase, PmEvent};
pub use control::{to_errno, BufferHandle, Caller, ControlSurface, Endpoint};
