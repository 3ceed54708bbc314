//! Timestamp proofs for upload fingerprints
//!
//! Proof work never decides the fate of an upload: every failure here is
//! reported on the entity's proof state and the transfer goes on without it.

pub mod calendar;
pub mod ots;

pub use calendar::{CalendarClient, ProofNetwork};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{with_query, Transport};
use crate::types::{Fingerprint, HashAlgorithm};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ots::{Attestation, DetachedTimestamp, Op, Timestamp};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Public ledger a proof can be anchored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Bitcoin,
    Litecoin,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Bitcoin => write!(f, "bitcoin"),
            Chain::Litecoin => write!(f, "litecoin"),
        }
    }
}

/// Serialized proof, in OpenTimestamps `.ots` format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofArtifact(Bytes);

impl ProofArtifact {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode the artifact
    pub fn parse(&self) -> Result<DetachedTimestamp> {
        DetachedTimestamp::from_bytes(&self.0)
    }
}

/// Result of a confirmation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofStatus {
    /// Submitted, not anchored yet
    Pending,

    /// Anchored in a block
    Confirmed {
        chain: Chain,
        block_height: u64,
        block_time: Option<DateTime<Utc>>,
    },

    /// The status could not be determined
    Indeterminate { reason: String },
}

impl fmt::Display for ProofStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProofStatus::Pending => write!(f, "pending"),
            ProofStatus::Confirmed {
                chain,
                block_height,
                block_time,
            } => {
                write!(f, "confirmed in {} block {}", chain, block_height)?;
                if let Some(time) = block_time {
                    write!(f, " ({})", time.format("%Y-%m-%d %H:%M:%S UTC"))?;
                }
                Ok(())
            }
            ProofStatus::Indeterminate { reason } => write!(f, "indeterminate: {}", reason),
        }
    }
}

/// Where an entity's proof is in its lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofPhase {
    #[default]
    None,
    Creating,
    PendingConfirmation,
    Confirmed,
    Failed,
}

/// Outcome of uploading the artifact next to the transferred file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AttachState {
    #[default]
    NotAttempted,
    InFlight,
    Attached,
    Failed(String),
}

/// Proof state owned by an upload entity
#[derive(Debug, Clone, Default)]
pub struct ProofState {
    pub phase: ProofPhase,
    pub artifact: Option<ProofArtifact>,
    pub created_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attachment: AttachState,
}

impl ProofState {
    pub(crate) fn creating(&mut self) {
        self.phase = ProofPhase::Creating;
        self.error = None;
    }

    pub(crate) fn created(&mut self, artifact: ProofArtifact) {
        self.phase = ProofPhase::PendingConfirmation;
        self.artifact = Some(artifact);
        self.created_at = Some(Utc::now());
    }

    pub(crate) fn failed(&mut self, error: impl Into<String>) {
        self.phase = ProofPhase::Failed;
        self.artifact = None;
        self.error = Some(error.into());
    }

    pub(crate) fn confirmed(&mut self) {
        if self.phase == ProofPhase::PendingConfirmation {
            self.phase = ProofPhase::Confirmed;
        }
    }

    /// An artifact exists
    pub fn has_artifact(&self) -> bool {
        matches!(
            self.phase,
            ProofPhase::PendingConfirmation | ProofPhase::Confirmed
        ) && self.artifact.is_some()
    }
}

/// Creates, checks and attaches timestamp proofs
#[derive(Clone)]
pub struct ProofAgent {
    network: Arc<dyn ProofNetwork>,
}

impl ProofAgent {
    pub fn new(network: Arc<dyn ProofNetwork>) -> Self {
        Self { network }
    }

    /// Agent backed by the configured calendars
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(Arc::new(CalendarClient::from_config(config)?)))
    }

    /// Submit a fingerprint and build a pending proof from the calendar replies
    pub async fn create_proof(&self, fingerprint: &Fingerprint) -> Result<ProofArtifact> {
        if fingerprint.algorithm != HashAlgorithm::Sha256 {
            return Err(Error::proof(format!(
                "{} fingerprints cannot be timestamped",
                fingerprint.algorithm
            )));
        }

        let replies = self.network.stamp(fingerprint.digest()).await?;

        let mut merged: Option<Timestamp> = None;
        for reply in replies {
            match Timestamp::parse(&reply) {
                Ok(timestamp) => match merged.as_mut() {
                    Some(existing) => existing.merge(timestamp),
                    None => merged = Some(timestamp),
                },
                Err(e) => tracing::warn!(error = %e, "Discarding malformed calendar reply"),
            }
        }
        let timestamp = merged.ok_or_else(|| Error::proof("no usable calendar reply"))?;

        let detached = DetachedTimestamp::new(Op::Sha256, fingerprint.digest().to_vec(), timestamp)?;
        let artifact = ProofArtifact::from_bytes(detached.to_bytes()?);

        tracing::debug!(fingerprint = %fingerprint, len = artifact.len(), "Proof created");
        Ok(artifact)
    }

    /// Check whether a proof has been anchored. Never modifies the artifact.
    pub async fn query_status(&self, artifact: &ProofArtifact) -> ProofStatus {
        let attestations = match artifact.parse().and_then(|d| d.attestations()) {
            Ok(found) => found,
            Err(e) => {
                return ProofStatus::Indeterminate {
                    reason: e.to_string(),
                }
            }
        };

        if let Some((chain, height)) = lowest_anchor(&attestations) {
            return self.confirmed(chain, height).await;
        }

        let mut pending = false;
        let mut errors = Vec::new();
        let mut best: Option<(Chain, u64)> = None;

        for (commitment, attestation) in &attestations {
            let Attestation::Pending { uri } = attestation else {
                continue;
            };
            match self.network.upgrade(uri, commitment).await {
                Ok(None) => pending = true,
                Ok(Some(reply)) => {
                    let upgraded = Timestamp::parse(&reply).and_then(|t| t.attestations_for(commitment));
                    match upgraded {
                        Ok(found) => match lowest_anchor(&found) {
                            Some(anchor) if best.map_or(true, |(_, h)| anchor.1 < h) => {
                                best = Some(anchor)
                            }
                            Some(_) => {}
                            None => pending = true,
                        },
                        Err(e) => errors.push(format!("{}: {}", uri, e)),
                    }
                }
                Err(e) => {
                    tracing::debug!(calendar = %uri, error = %e, "Upgrade request failed");
                    errors.push(format!("{}: {}", uri, e));
                }
            }
        }

        if let Some((chain, height)) = best {
            return self.confirmed(chain, height).await;
        }
        if pending {
            return ProofStatus::Pending;
        }
        let reason = if errors.is_empty() {
            "proof has no pending or anchored attestations".to_string()
        } else {
            errors.join("; ")
        };
        ProofStatus::Indeterminate { reason }
    }

    async fn confirmed(&self, chain: Chain, block_height: u64) -> ProofStatus {
        let block_time = match self.network.block_time(chain, block_height).await {
            Ok(time) => time,
            Err(e) => {
                tracing::warn!(chain = %chain, height = block_height, error = %e, "Block time lookup failed");
                None
            }
        };
        ProofStatus::Confirmed {
            chain,
            block_height,
            block_time,
        }
    }

    /// Upload the artifact next to the transferred file (`POST <target>?ots`)
    pub async fn attach(
        &self,
        transport: &Transport,
        target: &Url,
        artifact: &ProofArtifact,
    ) -> Result<()> {
        let url = with_query(target, "ots");
        let status = transport.post(&url, artifact.to_bytes()).await?;
        if !status.is_success() {
            return Err(Error::proof(format!("proof attachment rejected: {}", status)));
        }
        tracing::debug!(target = %target, "Proof attached");
        Ok(())
    }
}

fn lowest_anchor(attestations: &[(Vec<u8>, Attestation)]) -> Option<(Chain, u64)> {
    attestations
        .iter()
        .filter_map(|(_, attestation)| match attestation {
            Attestation::Bitcoin { height } => Some((Chain::Bitcoin, *height)),
            Attestation::Litecoin { height } => Some((Chain::Litecoin, *height)),
            _ => None,
        })
        .min_by_key(|(_, height)| *height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_bytes;

    fn reply(uri: &str) -> Vec<u8> {
        Timestamp {
            attestations: vec![Attestation::Pending {
                uri: uri.to_string(),
            }],
            ops: vec![],
        }
        .to_bytes()
        .unwrap()
    }

    struct Fixed(Vec<Vec<u8>>);

    #[async_trait::async_trait]
    impl ProofNetwork for Fixed {
        async fn stamp(&self, _digest: &[u8]) -> Result<Vec<Vec<u8>>> {
            Ok(self.0.clone())
        }

        async fn upgrade(&self, _calendar: &str, _commitment: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_create_proof_merges_replies() {
        let agent = ProofAgent::new(Arc::new(Fixed(vec![
            reply("https://a.example"),
            b"garbage".to_vec(),
            reply("https://b.example"),
        ])));
        let fingerprint = hash_bytes(b"hello", HashAlgorithm::Sha256);

        let artifact = agent.create_proof(&fingerprint).await.unwrap();
        let detached = artifact.parse().unwrap();
        assert_eq!(detached.digest, fingerprint.digest());
        assert_eq!(detached.timestamp.attestations.len(), 2);
        assert_eq!(agent.query_status(&artifact).await, ProofStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_proof_rejects_blake3() {
        let agent = ProofAgent::new(Arc::new(Fixed(vec![reply("https://a.example")])));
        let fingerprint = hash_bytes(b"hello", HashAlgorithm::Blake3);
        let err = agent.create_proof(&fingerprint).await.unwrap_err();
        assert!(matches!(err, Error::Proof { .. }));
    }

    #[tokio::test]
    async fn test_create_proof_all_replies_malformed() {
        let agent = ProofAgent::new(Arc::new(Fixed(vec![vec![0xff]])));
        let fingerprint = hash_bytes(b"hello", HashAlgorithm::Sha256);
        assert!(agent.create_proof(&fingerprint).await.is_err());
    }

    #[tokio::test]
    async fn test_query_garbage_is_indeterminate() {
        let agent = ProofAgent::new(Arc::new(Fixed(vec![])));
        let status = agent
            .query_status(&ProofArtifact::from_bytes(&b"nope"[..]))
            .await;
        assert!(matches!(status, ProofStatus::Indeterminate { .. }));
    }

    #[test]
    fn test_proof_state_transitions() {
        let mut state = ProofState::default();
        assert_eq!(state.phase, ProofPhase::None);
        assert!(!state.has_artifact());

        state.creating();
        state.created(ProofArtifact::from_bytes(vec![1, 2, 3]));
        assert_eq!(state.phase, ProofPhase::PendingConfirmation);
        assert!(state.created_at.is_some());
        assert!(state.has_artifact());

        state.confirmed();
        assert_eq!(state.phase, ProofPhase::Confirmed);

        let mut failed = ProofState::default();
        failed.creating();
        failed.failed("calendar down");
        failed.confirmed();
        assert_eq!(failed.phase, ProofPhase::Failed);
        assert_eq!(failed.error.as_deref(), Some("calendar down"));
    }

    #[test]
    fn test_status_display() {
        let status = ProofStatus::Confirmed {
            chain: Chain::Bitcoin,
            block_height: 358_391,
            block_time: None,
        };
        assert_eq!(status.to_string(), "confirmed in bitcoin block 358391");
    }
}
