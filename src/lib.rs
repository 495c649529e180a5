//! # Ensemble Core
//!
//! Ensemble Core is a multi-agent coordination server that mediates work
//! between a planner agent, an executor agent reached over a
//! tool-invocation protocol, and a human operator.
//!
//! ## Architecture
//!
//! The system consists of:
//! - **State Store**: the single source of truth for tasks, advisory file
//!   locks, and conversation contexts (in-memory and sqlite backends)
//! - **Lock Registry**: multi-reader / single-writer file access with
//!   expiry, batch acquisition, and conflict diagnostics
//! - **Task Queue**: capability-matched discovery, race-safe claiming,
//!   progress, completion, and handoffs
//! - **Session Manager**: collaboration lifecycle with a live per-session
//!   event stream
//! - **Tool Dispatcher**: the fixed six-tool surface the executor invokes
//!
//! The HTTP/WebSocket surface in [`api`] is a thin adapter; every durable
//! change flows through the state store.

/// Operator REST surface and transport adapters
pub mod api;
/// System configuration
pub mod config;
/// Process-wide service container with init/shutdown lifecycle
pub mod container;
/// System-wide constants
pub mod constants;
/// Error types and the response envelope
pub mod error;
/// Advisory file-lock registry
pub mod locks;
/// Core data models
pub mod models;
/// System monitoring and metrics
pub mod monitoring;
/// Task queue, handoffs, and agent registration
pub mod queue;
/// Request throttling middleware
pub mod rate_limit;
/// Collaboration sessions and event streams
pub mod session;
/// Persistent state store backends
pub mod store;
/// Executor-facing tool dispatcher
pub mod tools;

#[cfg(test)]
mod tests;

pub use error::{CoordinationError, Result};
