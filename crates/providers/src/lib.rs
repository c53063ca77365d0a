//! Model backend implementations for TaskLoop.
//!
//! All backends implement the `taskloop_core::ModelBackend` trait. Vendor
//! transports live outside this workspace; these are the backends the engine
//! itself needs for replay and failover.

pub mod fallback;
pub mod scripted;

pub use fallback::FallbackBackend;
pub use scripted::ScriptedBackend;
