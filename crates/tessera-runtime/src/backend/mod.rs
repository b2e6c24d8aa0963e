//! Compute backends and the dispatcher that routes units to them.
//!
//! A [`Backend`] runs one command against byte ranges of a shared
//! [`ArenaBuffer`] and answers with a [`CompletionToken`]. Synchronous
//! backends return an already-resolved token; asynchronous ones return a
//! pending token that resolves when the work finishes. The engine decides
//! when to wait.

mod queued;
mod reference;

pub use queued::QueuedBackend;
pub use reference::{execute, ReferenceBackend};

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use tessera_compile::{ArenaBuffer, TensorBinding};
use tessera_core::{BackendId, Command};

use crate::error::BackendError;

/// A device (or device emulation) able to run commands.
pub trait Backend: Send + Sync {
    fn id(&self) -> BackendId;

    /// Starts `command` reading `inputs` and writing `outputs` in `arena`.
    fn dispatch(
        &self,
        command: &Command,
        arena: &ArenaBuffer,
        inputs: &[TensorBinding],
        outputs: &[TensorBinding],
    ) -> CompletionToken;

    /// Blocks until the work behind `token` is done.
    fn wait(&self, token: CompletionToken) -> Result<(), BackendError> {
        token.wait()
    }
}

// ---------------------------------------------------------------------------
// CompletionToken
// ---------------------------------------------------------------------------

/// Result of a dispatched command, possibly still on its way.
pub enum CompletionToken {
    Ready(Result<(), BackendError>),
    Pending {
        backend: BackendId,
        receiver: Receiver<Result<(), BackendError>>,
    },
}

impl CompletionToken {
    pub fn done() -> Self {
        CompletionToken::Ready(Ok(()))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, CompletionToken::Ready(_))
    }

    /// Blocks until the result is known.
    pub fn wait(self) -> Result<(), BackendError> {
        match self {
            CompletionToken::Ready(result) => result,
            CompletionToken::Pending { backend, receiver } => receiver
                .recv()
                .unwrap_or(Err(BackendError::Disconnected { backend })),
        }
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionToken::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            CompletionToken::Pending { backend, .. } => {
                f.debug_struct("Pending").field("backend", backend).finish()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BackendDispatcher
// ---------------------------------------------------------------------------

/// Backend id -> backend.
#[derive(Clone, Default)]
pub struct BackendDispatcher {
    backends: HashMap<BackendId, Arc<dyn Backend>>,
}

impl BackendDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher with the reference CPU backend registered as `CpuRef`.
    pub fn with_reference() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Arc::new(ReferenceBackend::new(BackendId::CpuRef)));
        dispatcher
    }

    /// Registers `backend` under its id, returning any backend it replaces.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Option<Arc<dyn Backend>> {
        self.backends.insert(backend.id(), backend)
    }

    pub fn get(&self, id: BackendId) -> Option<&Arc<dyn Backend>> {
        self.backends.get(&id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl fmt::Debug for BackendDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<String> = self.backends.keys().map(ToString::to_string).collect();
        ids.sort();
        f.debug_struct("BackendDispatcher").field("backends", &ids).finish()
    }
}
