//! Core domain types for upstamp

use crate::proof::{AttachState, ProofPhase};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_UPLOAD_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local upload ordinal, assigned at construction and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UploadId(u64);

impl UploadId {
    /// Allocate the next id
    pub fn next() -> Self {
        Self(NEXT_UPLOAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of a single upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Fingerprinted (and stamped), waiting for admission
    Pending,

    /// Computing the content fingerprint
    Hashing,

    /// Requesting a timestamp proof for the fingerprint
    Stamping,

    /// Bytes are being transferred
    Uploading,

    /// Transfer finished successfully
    Complete,

    /// Hashing or transfer failed
    Failed,
}

impl UploadStatus {
    /// `Complete` and `Failed` are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Hashing, Stamping)
                | (Hashing, Pending)
                | (Hashing, Failed)
                | (Stamping, Pending)
                | (Pending, Uploading)
                | (Uploading, Complete)
                | (Uploading, Failed)
                | (Failed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Hashing => "hashing",
            UploadStatus::Stamping => "stamping",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Complete => "complete",
            UploadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest used for content fingerprints
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("sha256"),
            HashAlgorithm::Blake3 => f.write_str("blake3"),
        }
    }
}

/// Content fingerprint of a byte source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub algorithm: HashAlgorithm,
    #[serde(with = "hex_digest")]
    digest: Vec<u8>,
}

impl Fingerprint {
    pub fn new(algorithm: HashAlgorithm, digest: Vec<u8>) -> Self {
        Self { algorithm, digest }
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(digest: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Display-only progress values, recomputed on every transfer tick
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TransferProgress {
    /// Bytes acknowledged by the current attempt
    pub bytes_sent: u64,

    /// Resume offset plus `bytes_sent`
    pub bytes_acknowledged: u64,

    /// Size of the whole source
    pub total_bytes: u64,

    /// Bytes per second since the previous tick (undefined on the first tick)
    pub throughput: Option<f64>,

    /// Estimated time until the transfer finishes
    pub remaining: Option<Duration>,
}

impl TransferProgress {
    /// Whole-file completion in percent
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_acknowledged as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Notification published on the uploader's event bus
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// The entity moved between lifecycle states
    StatusChanged {
        id: UploadId,
        from: UploadStatus,
        to: UploadStatus,
    },

    /// Hashing advanced to `fraction` of the source
    Hashing { id: UploadId, fraction: f64 },

    /// Transfer progress tick
    Progress {
        id: UploadId,
        progress: TransferProgress,
    },

    /// Proof phase or attachment outcome changed
    ProofChanged {
        id: UploadId,
        phase: ProofPhase,
        attachment: AttachState,
    },
}

impl UploadEvent {
    pub fn id(&self) -> UploadId {
        match self {
            UploadEvent::StatusChanged { id, .. }
            | UploadEvent::Hashing { id, .. }
            | UploadEvent::Progress { id, .. }
            | UploadEvent::ProofChanged { id, .. } => *id,
        }
    }
}

/// Join a directory path and a leaf file name into a logical display name
pub fn logical_name(dir: &str, file_name: &str) -> String {
    let segments: Vec<&str> = dir
        .split('/')
        .chain(file_name.split('/'))
        .filter(|s| !s.is_empty())
        .collect();
    segments.join("/")
}
