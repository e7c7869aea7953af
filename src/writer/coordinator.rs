//! Write Coordinator
//!
//! Owns the writer thread and the bounded queue in front of it.
//!
//! ## Shutdown:
//! 1. Stop accepting new submissions
//! 2. Enqueue a shutdown marker; everything ahead of it is applied
//! 3. Anything that slipped in behind the marker gets `ShuttingDown`
//! 4. Final checkpoint, then the thread exits and is joined

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{EmberError, Result};

use super::applier::Applier;
use super::{Mutation, Outcome};

/// Work the writer thread runs before it starts draining the queue
/// (a background index rebuild)
pub type StartupTask = Box<dyn FnOnce() -> Result<()> + Send>;

enum Command {
    Apply {
        mutation: Mutation,
        reply: Sender<Result<Outcome>>,
    },
    Shutdown,
}

pub struct WriteCoordinator {
    sender: Sender<Command>,
    accepting: AtomicBool,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl WriteCoordinator {
    /// Spawn the writer thread
    pub fn start(applier: Applier, capacity: usize, startup: Option<StartupTask>) -> Result<Self> {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        let handle = thread::Builder::new()
            .name("emberkv-writer".to_string())
            .spawn(move || Self::run(applier, receiver, startup))?;

        Ok(Self {
            sender,
            accepting: AtomicBool::new(true),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Block until `mutation` has been applied (or rejected)
    pub fn submit(&self, mutation: Mutation) -> Result<Outcome> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EmberError::ShuttingDown);
        }
        let (reply, response) = channel::bounded(1);
        self.sender
            .send(Command::Apply { mutation, reply })
            .map_err(|_| EmberError::ShuttingDown)?;
        response.recv().map_err(|_| EmberError::ShuttingDown)?
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Drain, checkpoint and join the writer thread
    ///
    /// Idempotent; returns the final checkpoint result the first time.
    pub fn stop(&self) -> Result<()> {
        self.accepting.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        // The thread only exits after seeing the marker, so this cannot fail
        // unless it already died
        let _ = self.sender.send(Command::Shutdown);
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(EmberError::Storage("writer thread panicked".to_string())),
        }
    }

    // =========================================================================
    // Writer Thread
    // =========================================================================

    fn run(
        mut applier: Applier,
        receiver: Receiver<Command>,
        startup: Option<StartupTask>,
    ) -> Result<()> {
        let failed = match startup.map(|task| task()) {
            Some(Err(e)) => {
                tracing::error!("Writer startup task failed: {}", e);
                Some(e.to_string())
            }
            _ => None,
        };

        for command in receiver.iter() {
            match command {
                Command::Apply { mutation, reply } => {
                    let result = match &failed {
                        Some(reason) => Err(EmberError::RecoveryFailed(Box::new(
                            EmberError::Storage(reason.clone()),
                        ))),
                        None => applier.apply(mutation),
                    };
                    if let Err(e) = &result {
                        tracing::debug!("Mutation failed: {}", e);
                    }
                    let _ = reply.send(result);
                }
                Command::Shutdown => break,
            }
        }

        let mut rejected = 0;
        while let Ok(command) = receiver.try_recv() {
            if let Command::Apply { reply, .. } = command {
                let _ = reply.send(Err(EmberError::ShuttingDown));
                rejected += 1;
            }
        }
        if rejected > 0 {
            tracing::debug!("Rejected {} mutations queued after shutdown", rejected);
        }

        if failed.is_some() {
            return Ok(());
        }
        applier.checkpoint().map_err(|e| {
            tracing::error!("Final index checkpoint failed: {}", e);
            e
        })
    }
}

impl Drop for WriteCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("Error stopping writer: {}", e);
        }
    }
}
