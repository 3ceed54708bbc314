//! Entry point tying hashing, proofs, scheduling and transfer together

use crate::config::Config;
use crate::error::Result;
use crate::proof::{ProofAgent, ProofStatus};
use crate::scheduler::{Pipeline, Scheduler, SchedulerSnapshot};
use crate::source::SourceFile;
use crate::transfer::TransferDriver;
use crate::transport::{target_url, Transport};
use crate::types::{logical_name, UploadEvent, UploadId, UploadStatus};
use crate::upload::{Upload, UploadState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use url::Url;

/// Uploads files to one server
///
/// Must be created inside a tokio runtime; it spawns the scheduler task.
pub struct Uploader {
    config: Config,
    base_url: Url,
    transport: Transport,
    agent: Option<ProofAgent>,
    scheduler: Scheduler,
    events: broadcast::Sender<UploadEvent>,
    uploads: Mutex<Vec<Arc<Upload>>>,
}

impl Uploader {
    /// Without an agent the proof step is skipped entirely
    pub fn new(config: Config, transport: Transport, agent: Option<ProofAgent>) -> Result<Self> {
        config.validate()?;
        let base_url = config.server_url()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        let pipeline = Pipeline {
            driver: TransferDriver::new(transport.clone(), config.chunk_size),
            agent: agent.clone(),
            auth_url: base_url.clone(),
        };
        let scheduler = Scheduler::spawn(pipeline, config.concurrency);

        tracing::debug!(
            server = %base_url,
            transport = transport.name(),
            concurrency = config.concurrency,
            proofs = agent.is_some(),
            "Uploader ready"
        );

        Ok(Self {
            config,
            base_url,
            transport,
            agent,
            scheduler,
            events,
            uploads: Mutex::new(Vec::new()),
        })
    }

    /// HTTP transport and, when proofs are enabled, the configured calendars
    pub fn from_config(config: Config) -> Result<Self> {
        let transport = Transport::http(&config)?;
        let agent = if config.proofs {
            Some(ProofAgent::from_config(&config)?)
        } else {
            None
        };
        Self::new(config, transport, agent)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn agent(&self) -> Option<&ProofAgent> {
        self.agent.as_ref()
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Arc<Upload>>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start uploading `source` as `display_name` below the configured directory.
    ///
    /// Hashing and stamping start right away; the entity joins the scheduler
    /// queue once they are done.
    pub fn upload(&self, display_name: &str, source: SourceFile) -> Result<Arc<Upload>> {
        let name = logical_name(&self.config.remote_dir, display_name);
        let target = target_url(&self.base_url, &name)?;
        let upload = Upload::new(name, target, source, self.events.clone());
        self.registry().push(Arc::clone(&upload));

        tracing::info!(id = %upload.id(), name = %upload.display_name(), size = upload.len(), "Upload created");

        let entity = Arc::clone(&upload);
        let scheduler = self.scheduler.clone();
        let agent = self.agent.clone();
        let algorithm = self.config.hash_algorithm;
        let chunk_size = self.config.chunk_size;
        tokio::spawn(async move {
            if entity.prepare(agent.as_ref(), algorithm, chunk_size).await {
                if let Err(e) = scheduler.enqueue(entity) {
                    tracing::error!(error = %e, "Could not queue upload");
                }
            }
        });

        Ok(upload)
    }

    /// Every event of every upload
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// All uploads created so far
    pub fn uploads(&self) -> Vec<Arc<Upload>> {
        self.registry().clone()
    }

    pub fn get(&self, id: UploadId) -> Option<Arc<Upload>> {
        self.registry().iter().find(|u| u.id() == id).cloned()
    }

    /// Resubmit one failed upload
    pub async fn retry(&self, id: UploadId) -> Result<Arc<Upload>> {
        self.scheduler.retry(id).await
    }

    /// Resubmit every upload currently failed; returns the resubmitted ones
    pub async fn retry_failed(&self) -> Result<Vec<Arc<Upload>>> {
        let mut resubmitted = Vec::new();
        for upload in self.scheduler.failed().await? {
            if upload.status() == UploadStatus::Failed {
                resubmitted.push(self.scheduler.retry(upload.id()).await?);
            }
        }
        Ok(resubmitted)
    }

    /// Uploads whose last transfer attempt failed
    pub async fn failed(&self) -> Result<Vec<Arc<Upload>>> {
        self.scheduler.failed().await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        self.scheduler.snapshot().await
    }

    /// Abort every transfer, running or still to come
    pub fn abort_all(&self) {
        let uploads = self.uploads();
        tracing::info!(count = uploads.len(), "Aborting all uploads");
        for upload in uploads {
            if !upload.status().is_terminal() {
                upload.abort();
            }
        }
    }

    /// Wait until every upload created so far has settled
    pub async fn wait_all(&self) -> Vec<UploadState> {
        let mut states = Vec::new();
        for upload in self.uploads() {
            states.push(upload.wait_settled().await);
        }
        states
    }

    /// Check whether an upload's proof has been anchored
    pub async fn poll_proof(&self, upload: &Upload) -> Option<ProofStatus> {
        let agent = self.agent.as_ref()?;
        upload.poll_proof(agent).await
    }
}
