//! Shared runtime plumbing.

pub mod event_bus;

pub use event_bus::{InProcEventBus, JobEventStream};
