//! Asynchronous wrapper running another backend on a worker thread.

use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tessera_compile::{ArenaBuffer, TensorBinding};
use tessera_core::{BackendId, Command};

use super::{Backend, CompletionToken};
use crate::error::BackendError;

struct Job {
    command: Command,
    arena: ArenaBuffer,
    inputs: Vec<TensorBinding>,
    outputs: Vec<TensorBinding>,
    reply: Sender<Result<(), BackendError>>,
}

/// Queues commands for a single worker thread and hands out pending tokens.
///
/// Commands complete in submission order. Dropping the backend closes the
/// queue and joins the worker after it drains.
pub struct QueuedBackend {
    id: BackendId,
    queue: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl QueuedBackend {
    /// Starts a worker that runs every job on `inner`.
    pub fn spawn(inner: Arc<dyn Backend>) -> io::Result<Self> {
        let id = inner.id();
        let (queue, jobs) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(format!("tessera-{id}"))
            .spawn(move || {
                for job in jobs {
                    let token = inner.dispatch(&job.command, &job.arena, &job.inputs, &job.outputs);
                    let result = inner.wait(token);
                    if let Err(err) = &result {
                        tracing::debug!(backend = %id, error = %err, "queued command failed");
                    }
                    // The engine may have given up on the token.
                    let _ = job.reply.send(result);
                }
            })?;
        Ok(QueuedBackend {
            id,
            queue: Some(queue),
            worker: Some(worker),
        })
    }
}

impl Backend for QueuedBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn dispatch(
        &self,
        command: &Command,
        arena: &ArenaBuffer,
        inputs: &[TensorBinding],
        outputs: &[TensorBinding],
    ) -> CompletionToken {
        let (reply, receiver) = mpsc::channel();
        let job = Job {
            command: command.clone(),
            arena: arena.clone(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            reply,
        };
        let Some(queue) = &self.queue else {
            return CompletionToken::Ready(Err(BackendError::Disconnected { backend: self.id }));
        };
        if queue.send(job).is_err() {
            return CompletionToken::Ready(Err(BackendError::Disconnected { backend: self.id }));
        }
        CompletionToken::Pending {
            backend: self.id,
            receiver,
        }
    }
}

impl Drop for QueuedBackend {
    fn drop(&mut self) {
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(backend = %self.id, "backend worker panicked");
            }
        }
    }
}
