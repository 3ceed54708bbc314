//! Bounded-concurrency FIFO admission of uploads
//!
//! The scheduler runs as a single task that alone owns the queue, the active
//! count, the auth probe state and the failed set. Everything else talks to it
//! through a [`Scheduler`] handle, so none of that state needs a lock.
//!
//! Transfer tasks only report their outcome. The actor records it and then
//! applies the terminal transition, so anyone woken by `Complete` or `Failed`
//! already sees the slot released and the failed set updated.

use crate::error::{Error, Result};
use crate::proof::ProofAgent;
use crate::transfer::{TransferDriver, TransferOutcome};
use crate::types::{UploadId, UploadStatus};
use crate::upload::Upload;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// What a transfer task needs
pub(crate) struct Pipeline {
    pub driver: TransferDriver,
    pub agent: Option<ProofAgent>,
    /// Target of the one-shot `CHECKAUTH` probe
    pub auth_url: Url,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    /// Waiting for admission, in admission order
    pub queued: Vec<UploadId>,
    /// Uploads currently transferring
    pub active: usize,
    pub failed: Vec<UploadId>,
    pub auth_probed: bool,
}

enum Command {
    Enqueue(Arc<Upload>),
    Retry {
        id: UploadId,
        reply: oneshot::Sender<Result<Arc<Upload>>>,
    },
    Failed {
        reply: oneshot::Sender<Vec<Arc<Upload>>>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
}

struct Finished {
    upload: Arc<Upload>,
    outcome: TransferOutcome,
}

/// One-shot `CHECKAUTH` probe, re-armed when it fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthProbe {
    Armed,
    Running,
    Passed,
}

/// Handle to the scheduler task
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl Scheduler {
    /// Start the scheduler task with at most `concurrency` uploads transferring
    pub(crate) fn spawn(pipeline: Pipeline, concurrency: usize) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            pipeline: Arc::new(pipeline),
            concurrency: concurrency.max(1),
            queue: VecDeque::new(),
            active: 0,
            auth: AuthProbe::Armed,
            failed: BTreeMap::new(),
            done_tx,
            probe_tx,
        };
        tokio::spawn(actor.run(command_rx, done_rx, probe_rx));

        Self { commands }
    }

    /// Queue a `Pending` upload for admission
    pub fn enqueue(&self, upload: Arc<Upload>) -> Result<()> {
        self.commands
            .send(Command::Enqueue(upload))
            .map_err(|_| Error::SchedulerClosed)
    }

    /// Resubmit a failed upload; it goes back to `Pending` at the tail of the queue
    pub async fn retry(&self, id: UploadId) -> Result<Arc<Upload>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Retry { id, reply })
            .map_err(|_| Error::SchedulerClosed)?;
        rx.await.map_err(|_| Error::SchedulerClosed)?
    }

    /// Uploads whose last transfer attempt failed
    pub async fn failed(&self) -> Result<Vec<Arc<Upload>>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Failed { reply })
            .map_err(|_| Error::SchedulerClosed)?;
        rx.await.map_err(|_| Error::SchedulerClosed)
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|_| Error::SchedulerClosed)?;
        rx.await.map_err(|_| Error::SchedulerClosed)
    }
}

struct Actor {
    pipeline: Arc<Pipeline>,
    concurrency: usize,
    queue: VecDeque<Arc<Upload>>,
    active: usize,
    auth: AuthProbe,
    failed: BTreeMap<UploadId, Arc<Upload>>,
    done_tx: mpsc::UnboundedSender<Finished>,
    probe_tx: mpsc::UnboundedSender<bool>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut done: mpsc::UnboundedReceiver<Finished>,
        mut probes: mpsc::UnboundedReceiver<bool>,
    ) {
        let mut open = true;

        loop {
            tokio::select! {
                biased;
                Some(finished) = done.recv() => self.on_finished(finished),
                Some(passed) = probes.recv() => self.on_probe(passed),
                command = commands.recv(), if open => match command {
                    Some(command) => self.handle(command),
                    None => open = false,
                },
            }

            self.admit();

            if !open && self.active == 0 && self.queue.is_empty() {
                break;
            }
        }
        tracing::debug!("Scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(upload) => {
                if upload.status() != UploadStatus::Pending {
                    tracing::warn!(id = %upload.id(), status = %upload.status(), "Ignoring enqueue of non-pending upload");
                    return;
                }
                tracing::debug!(id = %upload.id(), queued = self.queue.len() + 1, "Upload queued");
                self.queue.push_back(upload);
            }
            Command::Retry { id, reply } => {
                let result = match self.failed.get(&id) {
                    Some(upload) if upload.reset_for_retry() => {
                        tracing::info!(id = %id, "Upload resubmitted");
                        self.queue.push_back(Arc::clone(upload));
                        Ok(Arc::clone(upload))
                    }
                    _ => Err(Error::NotFailed { id }),
                };
                let _ = reply.send(result);
            }
            Command::Failed { reply } => {
                let _ = reply.send(self.failed.values().cloned().collect());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(SchedulerSnapshot {
                    queued: self.queue.iter().map(|u| u.id()).collect(),
                    active: self.active,
                    failed: self.failed.keys().copied().collect(),
                    auth_probed: self.auth == AuthProbe::Passed,
                });
            }
        }
    }

    fn on_finished(&mut self, finished: Finished) {
        let Finished { upload, outcome } = finished;
        self.active = self.active.saturating_sub(1);
        let id = upload.id();
        if outcome.is_complete() {
            self.failed.remove(&id);
        } else {
            self.failed.insert(id, Arc::clone(&upload));
        }
        tracing::debug!(id = %id, active = self.active, queued = self.queue.len(), "Transfer slot released");

        if upload.finish(&outcome, self.pipeline.agent.is_some()) {
            let pipeline = Arc::clone(&self.pipeline);
            tokio::spawn(async move {
                if let Some(agent) = &pipeline.agent {
                    upload.attach_proof(agent, pipeline.driver.transport()).await;
                }
            });
        }
    }

    fn admit(&mut self) {
        while self.active < self.concurrency {
            let Some(upload) = self.queue.pop_front() else {
                break;
            };

            self.probe_auth();

            if !upload.begin_transfer() {
                tracing::warn!(id = %upload.id(), status = %upload.status(), "Skipping upload that is no longer pending");
                continue;
            }
            self.active += 1;
            tracing::info!(id = %upload.id(), name = %upload.display_name(), active = self.active, "Upload admitted");

            let pipeline = Arc::clone(&self.pipeline);
            let done = self.done_tx.clone();
            tokio::spawn(async move {
                let outcome = upload.run_transfer(&pipeline.driver).await;
                let _ = done.send(Finished { upload, outcome });
            });
        }
    }

    /// Start the authentication probe in the background unless it already
    /// passed or is running. Admission never waits for it.
    fn probe_auth(&mut self) {
        if self.auth != AuthProbe::Armed {
            return;
        }
        self.auth = AuthProbe::Running;

        let pipeline = Arc::clone(&self.pipeline);
        let probes = self.probe_tx.clone();
        tokio::spawn(async move {
            let url = &pipeline.auth_url;
            let passed = match pipeline.driver.transport().check_auth(url).await {
                Ok(status) if status.is_success() => {
                    tracing::debug!(url = %url, "Authentication probe succeeded");
                    true
                }
                Ok(status) => {
                    tracing::warn!(url = %url, status = %status, "Authentication probe failed");
                    false
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "Authentication probe failed");
                    false
                }
            };
            let _ = probes.send(passed);
        });
    }

    fn on_probe(&mut self, passed: bool) {
        self.auth = if passed {
            AuthProbe::Passed
        } else {
            AuthProbe::Armed
        };
    }
}
