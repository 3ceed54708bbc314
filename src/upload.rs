//! Upload entity and its state machine
//!
//! ```text
//! Hashing -> Stamping -> Pending -> Uploading -> Complete
//!    |           (skipped           |
//!    |            without agent)    +--------> Failed -> Pending (retry)
//!    +-> Failed
//! ```
//!
//! Hashing and stamping run once per entity. Only the transfer step is
//! re-entered on retry, and it resumes from whatever the server holds.

use crate::hasher::hash_source;
use crate::proof::{AttachState, ProofAgent, ProofArtifact, ProofState, ProofStatus};
use crate::source::SourceFile;
use crate::transfer::{classify, ProgressFn, TransferDriver, TransferOutcome};
use crate::transport::Transport;
use crate::types::{Fingerprint, HashAlgorithm, TransferProgress, UploadEvent, UploadId, UploadStatus};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Observable state of one upload
#[derive(Debug, Clone)]
pub struct UploadState {
    pub status: UploadStatus,
    pub fingerprint: Option<Fingerprint>,
    /// Bytes durably stored on the server before the current attempt
    pub transfer_offset: u64,
    /// Bytes sent by the current attempt
    pub bytes_sent: u64,
    /// Set only in `Failed`; empty for aborts and connection failures
    pub failure_reason: Option<String>,
    pub proof: ProofState,
    pub progress: TransferProgress,
    /// Transfer attempts started so far
    pub attempts: u32,
}

impl UploadState {
    /// Terminal, with no proof attachment still running
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && self.proof.attachment != AttachState::InFlight
    }
}

/// Throughput and time-remaining estimator fed by progress ticks
#[derive(Debug, Default)]
pub struct ProgressMeter {
    last: Option<(Instant, u64)>,
}

impl ProgressMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous tick; the next one has no throughput
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn tick(&mut self, offset: u64, sent: u64, total: u64) -> TransferProgress {
        self.tick_at(Instant::now(), offset, sent, total)
    }

    pub fn tick_at(&mut self, now: Instant, offset: u64, sent: u64, total: u64) -> TransferProgress {
        let acknowledged = offset + sent;

        let throughput = self.last.and_then(|(then, previous)| {
            let elapsed = now.saturating_duration_since(then).as_secs_f64();
            (elapsed > 0.0).then(|| acknowledged.saturating_sub(previous) as f64 / elapsed)
        });
        let remaining = throughput
            .filter(|rate| *rate > 0.0)
            .and_then(|rate| {
                Duration::try_from_secs_f64(total.saturating_sub(acknowledged) as f64 / rate).ok()
            });

        self.last = Some((now, acknowledged));

        TransferProgress {
            bytes_sent: sent,
            bytes_acknowledged: acknowledged,
            total_bytes: total,
            throughput,
            remaining,
        }
    }
}

/// One selected file on its way to the server
#[derive(Debug)]
pub struct Upload {
    id: UploadId,
    display_name: String,
    target: Url,
    source: SourceFile,
    state: watch::Sender<UploadState>,
    events: broadcast::Sender<UploadEvent>,
    cancel: Mutex<CancellationToken>,
    meter: Mutex<ProgressMeter>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Upload {
    pub(crate) fn new(
        display_name: String,
        target: Url,
        source: SourceFile,
        events: broadcast::Sender<UploadEvent>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(UploadState {
            status: UploadStatus::Hashing,
            fingerprint: None,
            transfer_offset: 0,
            bytes_sent: 0,
            failure_reason: None,
            proof: ProofState::default(),
            progress: TransferProgress {
                total_bytes: source.len(),
                ..Default::default()
            },
            attempts: 0,
        });

        Arc::new(Self {
            id: UploadId::next(),
            display_name,
            target,
            source,
            state,
            events,
            cancel: Mutex::new(CancellationToken::new()),
            meter: Mutex::new(ProgressMeter::new()),
        })
    }

    pub fn id(&self) -> UploadId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Size of the source
    pub fn len(&self) -> u64 {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn status(&self) -> UploadStatus {
        self.state.borrow().status
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.state.borrow().fingerprint.clone()
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.state.borrow().failure_reason.clone()
    }

    pub fn proof(&self) -> ProofState {
        self.state.borrow().proof.clone()
    }

    /// Current state
    pub fn snapshot(&self) -> UploadState {
        self.state.borrow().clone()
    }

    /// Watch the state as it changes
    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.state.subscribe()
    }

    /// Wait until the entity is terminal and any proof attachment has finished
    pub async fn wait_settled(&self) -> UploadState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(UploadState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        };
        settled
    }

    /// Cancel the running attempt, or the next one if still queued
    pub fn abort(&self) {
        tracing::debug!(id = %self.id, name = %self.display_name, "Abort requested");
        lock(&self.cancel).cancel();
    }

    fn emit(&self, event: UploadEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_proof(&self) {
        let (phase, attachment) = {
            let state = self.state.borrow();
            (state.proof.phase, state.proof.attachment.clone())
        };
        self.emit(UploadEvent::ProofChanged {
            id: self.id,
            phase,
            attachment,
        });
    }

    /// Move to `to` and apply `update`, if the state machine allows it
    fn transition(&self, to: UploadStatus, update: impl FnOnce(&mut UploadState)) -> bool {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if !state.status.can_transition_to(to) {
                return false;
            }
            from = Some(state.status);
            state.status = to;
            update(state);
            true
        });

        match from {
            Some(from) => {
                tracing::debug!(id = %self.id, %from, %to, "Status changed");
                self.emit(UploadEvent::StatusChanged {
                    id: self.id,
                    from,
                    to,
                });
                true
            }
            None => {
                tracing::warn!(id = %self.id, status = %self.status(), %to, "Rejected status change");
                false
            }
        }
    }

    /// Hash the source and, with an agent, stamp the fingerprint.
    /// Returns whether the entity reached `Pending` and may be enqueued.
    pub(crate) async fn prepare(
        &self,
        agent: Option<&ProofAgent>,
        algorithm: HashAlgorithm,
        chunk_size: usize,
    ) -> bool {
        let fingerprint = match hash_source(&self.source, algorithm, chunk_size, |fraction| {
            self.emit(UploadEvent::Hashing {
                id: self.id,
                fraction,
            })
        })
        .await
        {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                tracing::error!(id = %self.id, name = %self.display_name, error = %e, "Hashing failed");
                let reason = e.to_string();
                self.transition(UploadStatus::Failed, |s| s.failure_reason = Some(reason));
                return false;
            }
        };

        tracing::info!(id = %self.id, name = %self.display_name, fingerprint = %fingerprint, "Fingerprint computed");
        self.state
            .send_modify(|s| s.fingerprint = Some(fingerprint.clone()));

        let Some(agent) = agent else {
            return self.transition(UploadStatus::Pending, |_| {});
        };

        self.transition(UploadStatus::Stamping, |s| s.proof.creating());
        self.emit_proof();

        match agent.create_proof(&fingerprint).await {
            Ok(artifact) => {
                self.state.send_modify(|s| s.proof.created(artifact));
            }
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "Proof creation failed, uploading without proof");
                let reason = e.to_string();
                self.state.send_modify(|s| s.proof.failed(reason));
            }
        }
        self.emit_proof();

        self.transition(UploadStatus::Pending, |_| {})
    }

    /// Admission: `Pending -> Uploading`
    pub(crate) fn begin_transfer(&self) -> bool {
        self.transition(UploadStatus::Uploading, |s| {
            s.attempts += 1;
            s.bytes_sent = 0;
        })
    }

    /// Run one transfer attempt. The first attempt is a fresh `PUT`; later
    /// ones rediscover the offset first.
    pub(crate) async fn run_transfer(self: &Arc<Self>, driver: &TransferDriver) -> TransferOutcome {
        let token = lock(&self.cancel).clone();
        if token.is_cancelled() {
            tracing::info!(id = %self.id, "Aborted before transfer started");
            return TransferOutcome::aborted();
        }

        lock(&self.meter).reset();
        let first = self.state.borrow().attempts <= 1;

        let upload = Arc::clone(self);
        let progress: ProgressFn = Arc::new(move |sent| upload.on_progress(sent));

        let attempt = async {
            if first {
                driver.send(&self.target, &self.source, 0, progress).await
            } else {
                driver
                    .retry(&self.target, &self.source, progress, |offset| {
                        self.set_offset(offset)
                    })
                    .await
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::info!(id = %self.id, "Transfer aborted");
                TransferOutcome::aborted()
            }
            result = attempt => classify(&result),
        }
    }

    fn set_offset(&self, offset: u64) {
        let previous = self.state.borrow().transfer_offset;
        if offset < previous {
            tracing::warn!(
                id = %self.id,
                previous,
                offset,
                "Server holds fewer bytes than before, trusting the probe"
            );
        }
        let total = self.source.len();
        self.state.send_modify(|s| {
            s.transfer_offset = offset;
            s.progress = TransferProgress {
                bytes_sent: 0,
                bytes_acknowledged: offset,
                total_bytes: total,
                throughput: None,
                remaining: None,
            };
        });
        tracing::debug!(id = %self.id, offset, "Resume offset discovered");
    }

    fn on_progress(&self, sent: u64) {
        let offset = self.state.borrow().transfer_offset;
        let progress = lock(&self.meter).tick(offset, sent, self.source.len());
        self.state.send_modify(|s| {
            s.bytes_sent = sent;
            s.progress = progress;
        });
        self.emit(UploadEvent::Progress {
            id: self.id,
            progress,
        });
    }

    /// Record the outcome of an attempt. Returns whether a proof attachment
    /// should follow; in that case the attachment is already marked in flight.
    pub(crate) fn finish(&self, outcome: &TransferOutcome, attach: bool) -> bool {
        match outcome {
            TransferOutcome::Complete => {
                let mut will_attach = false;
                let total = self.source.len();
                let completed = self.transition(UploadStatus::Complete, |s| {
                    s.failure_reason = None;
                    s.progress.bytes_acknowledged = total;
                    if attach && s.proof.has_artifact() {
                        s.proof.attachment = AttachState::InFlight;
                        will_attach = true;
                    }
                });
                if completed {
                    tracing::info!(id = %self.id, name = %self.display_name, "Upload complete");
                }
                will_attach
            }
            TransferOutcome::Failed { reason } => {
                tracing::warn!(id = %self.id, name = %self.display_name, reason = %reason, "Upload failed");
                let reason = reason.clone();
                self.transition(UploadStatus::Failed, |s| s.failure_reason = Some(reason));
                false
            }
        }
    }

    /// Resubmission: `Failed -> Pending` with a fresh cancellation token
    pub(crate) fn reset_for_retry(&self) -> bool {
        if self.status() != UploadStatus::Failed || self.fingerprint().is_none() {
            return false;
        }
        *lock(&self.cancel) = CancellationToken::new();
        self.transition(UploadStatus::Pending, |s| {
            s.failure_reason = None;
            s.bytes_sent = 0;
        })
    }

    /// Best-effort `POST <target>?ots` of the proof artifact
    pub(crate) async fn attach_proof(&self, agent: &ProofAgent, transport: &Transport) {
        let artifact = self.state.borrow().proof.artifact.clone();
        let Some(artifact) = artifact else {
            self.state
                .send_modify(|s| s.proof.attachment = AttachState::NotAttempted);
            return;
        };
        let attachment = match agent.attach(transport, &self.target, &artifact).await {
            Ok(()) => AttachState::Attached,
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "Proof attachment failed");
                AttachState::Failed(e.to_string())
            }
        };
        self.state.send_modify(|s| s.proof.attachment = attachment);
        self.emit_proof();
    }

    /// Ask whether the proof has been anchored; a confirmation is recorded
    pub async fn poll_proof(&self, agent: &ProofAgent) -> Option<ProofStatus> {
        let artifact: ProofArtifact = self.state.borrow().proof.artifact.clone()?;
        let status = agent.query_status(&artifact).await;
        if matches!(status, ProofStatus::Confirmed { .. }) {
            self.state.send_modify(|s| s.proof.confirmed());
            self.emit_proof();
        }
        Some(status)
    }
}
