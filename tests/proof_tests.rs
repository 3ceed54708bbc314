//! Proof creation and confirmation against scripted calendars

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use upstamp::error::{Error, Result};
use upstamp::hasher::hash_bytes;
use upstamp::proof::ots::{Attestation, Op, Timestamp};
use upstamp::proof::{Chain, ProofAgent, ProofArtifact, ProofNetwork, ProofStatus};
use upstamp::HashAlgorithm;

/// How a scripted calendar answers an upgrade request
#[derive(Clone)]
enum Upgrade {
    NotYet,
    Anchored(Chain, u64),
    Down,
}

struct Scripted {
    calendars: Vec<String>,
    upgrades: HashMap<String, Upgrade>,
    upgrade_calls: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(script: &[(&str, Upgrade)]) -> Self {
        Scripted {
            calendars: script.iter().map(|(uri, _)| uri.to_string()).collect(),
            upgrades: script
                .iter()
                .map(|(uri, upgrade)| (uri.to_string(), upgrade.clone()))
                .collect(),
            upgrade_calls: Mutex::new(Vec::new()),
        }
    }
}

fn leaf(attestation: Attestation) -> Timestamp {
    Timestamp {
        attestations: vec![attestation],
        ops: vec![],
    }
}

#[async_trait]
impl ProofNetwork for Scripted {
    async fn stamp(&self, _digest: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.calendars
            .iter()
            .map(|uri| {
                // Each calendar commits through its own nonce
                Timestamp {
                    attestations: vec![],
                    ops: vec![(
                        Op::Append(uri.as_bytes().to_vec()),
                        Timestamp {
                            attestations: vec![],
                            ops: vec![(
                                Op::Sha256,
                                leaf(Attestation::Pending { uri: uri.clone() }),
                            )],
                        },
                    )],
                }
                .to_bytes()
            })
            .collect()
    }

    async fn upgrade(&self, calendar: &str, _commitment: &[u8]) -> Result<Option<Vec<u8>>> {
        self.upgrade_calls.lock().unwrap().push(calendar.to_string());
        match self.upgrades.get(calendar).cloned().unwrap_or(Upgrade::NotYet) {
            Upgrade::NotYet => Ok(None),
            Upgrade::Down => Err(Error::network(format!("{} unreachable", calendar))),
            Upgrade::Anchored(chain, height) => {
                let attestation = match chain {
                    Chain::Bitcoin => Attestation::Bitcoin { height },
                    Chain::Litecoin => Attestation::Litecoin { height },
                };
                // Anchor sits one operation below the commitment
                let reply = Timestamp {
                    attestations: vec![],
                    ops: vec![(Op::Prepend(b"block".to_vec()), leaf(attestation))],
                };
                Ok(Some(reply.to_bytes()?))
            }
        }
    }

    async fn block_time(&self, _chain: Chain, height: u64) -> Result<Option<DateTime<Utc>>> {
        Ok(DateTime::from_timestamp(1_400_000_000 + height as i64, 0))
    }
}

async fn stamp(network: Arc<Scripted>) -> (ProofAgent, ProofArtifact) {
    let agent = ProofAgent::new(network);
    let fingerprint = hash_bytes(b"the quarterly report", HashAlgorithm::Sha256);
    let artifact = agent.create_proof(&fingerprint).await.unwrap();
    (agent, artifact)
}

#[tokio::test]
async fn test_artifact_records_every_calendar() {
    let network = Arc::new(Scripted::new(&[
        ("https://a.example", Upgrade::NotYet),
        ("https://b.example", Upgrade::NotYet),
    ]));
    let (_, artifact) = stamp(network).await;

    let detached = artifact.parse().unwrap();
    let mut uris: Vec<String> = detached
        .attestations()
        .unwrap()
        .into_iter()
        .filter_map(|(_, a)| match a {
            Attestation::Pending { uri } => Some(uri),
            _ => None,
        })
        .collect();
    uris.sort();
    assert_eq!(uris, vec!["https://a.example", "https://b.example"]);

    // Serialization is stable
    let again = upstamp::proof::ots::DetachedTimestamp::from_bytes(artifact.as_bytes())
        .unwrap()
        .to_bytes()
        .unwrap();
    assert_eq!(again, artifact.as_bytes());
}

#[tokio::test]
async fn test_pending_until_any_calendar_upgrades() {
    let network = Arc::new(Scripted::new(&[
        ("https://a.example", Upgrade::NotYet),
        ("https://b.example", Upgrade::Down),
    ]));
    let (agent, artifact) = stamp(network.clone()).await;

    assert_eq!(agent.query_status(&artifact).await, ProofStatus::Pending);
    assert_eq!(network.upgrade_calls.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_lowest_anchor_wins() {
    let network = Arc::new(Scripted::new(&[
        ("https://a.example", Upgrade::Anchored(Chain::Bitcoin, 800_010)),
        ("https://b.example", Upgrade::Down),
        ("https://c.example", Upgrade::Anchored(Chain::Bitcoin, 800_002)),
    ]));
    let (agent, artifact) = stamp(network).await;
    let before = artifact.as_bytes().to_vec();

    let status = agent.query_status(&artifact).await;
    assert_eq!(
        status,
        ProofStatus::Confirmed {
            chain: Chain::Bitcoin,
            block_height: 800_002,
            block_time: DateTime::from_timestamp(1_400_800_002, 0),
        }
    );

    // Querying never rewrites the artifact
    assert_eq!(artifact.as_bytes(), &before[..]);
}

#[tokio::test]
async fn test_all_calendars_down_is_indeterminate() {
    let network = Arc::new(Scripted::new(&[
        ("https://a.example", Upgrade::Down),
        ("https://b.example", Upgrade::Down),
    ]));
    let (agent, artifact) = stamp(network).await;

    match agent.query_status(&artifact).await {
        ProofStatus::Indeterminate { reason } => {
            assert!(reason.contains("https://a.example"));
            assert!(reason.contains("https://b.example"));
            assert!(reason.contains("; "));
        }
        other => panic!("expected indeterminate, got {:?}", other),
    }
}
