//! Execution of compiled and symbolic graphs.
//!
//! This crate runs a [`CompiledGraph`](tessera_compile::CompiledGraph) on
//! pluggable compute backends, and evaluates symbolic graphs directly as a
//! reference for checking compiled results.
//!
//! # Modules
//!
//! - [`error`] -- Backend and runtime error types
//! - [`backend`] -- Backend trait, completion tokens, the dispatcher and the
//!   built-in CPU and queued backends
//! - [`engine`] -- Run-state machine executing compiled units
//! - [`interpreter`] -- Reference interpreter over symbolic graphs

pub mod backend;
pub mod engine;
pub mod error;
pub mod interpreter;

pub use backend::{Backend, BackendDispatcher, CompletionToken, QueuedBackend, ReferenceBackend};
pub use engine::{Engine, EngineConfig, RunState, TraceEntry};
pub use error::{BackendError, RuntimeError};
pub use interpreter::Interpreter;
