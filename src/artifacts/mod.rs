// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Artifact store
//!
//! Write-once handoff slots carrying outputs between actions. Every slot has
//! exactly one producer and is keyed by run id + slot name. Readers block
//! until the slot is `Ready` and fail with `NotProduced` once the slot can
//! never become ready (producer failed, or the run was torn down).
//!
//! Payloads live in an [`ArtifactBackend`]; the store itself only tracks the
//! lifecycle of each slot.

mod filesystem;
mod hash;
mod memory;

pub use filesystem::FilesystemBackend;
pub use hash::{hash_string, short_hash, ContentHasher};
pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::errors::{DeployflowError, DeployflowResult};

/// Address of an artifact: run identity plus slot name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub run_id: String,
    pub slot: String,
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.run_id, self.slot)
    }
}

/// Content of an artifact: named files plus string metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    /// Files keyed by their path inside the artifact
    pub files: BTreeMap<String, Vec<u8>>,
    /// Free-form metadata (e.g. `source_version`)
    pub metadata: BTreeMap<String, String>,
}

impl ArtifactPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get a file's content
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Get a metadata value
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Get a file as UTF-8 text, failing with `ArtifactFileMissing`
    pub fn require_text(&self, slot: &str, path: &str) -> DeployflowResult<String> {
        let bytes = self
            .file(path)
            .ok_or_else(|| DeployflowError::ArtifactFileMissing {
                slot: slot.to_string(),
                path: path.to_string(),
            })?;

        String::from_utf8(bytes.to_vec()).map_err(|e| DeployflowError::StateError {
            message: format!("File '{}' in artifact '{}' is not UTF-8: {}", path, slot, e),
        })
    }

    /// BLAKE3 hash over files and metadata
    pub fn content_hash(&self) -> String {
        let mut hasher = ContentHasher::new();
        hasher.hash_payload(self);
        hasher.finalize()
    }
}

/// Lifecycle of an artifact slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum ArtifactState {
    /// Known to the run, producer not started
    Declared,
    /// Producer running
    Writing,
    /// Payload stored and readable
    Ready,
    /// Producer failed; written data must not be used
    Invalid(String),
    /// Run torn down before the producer completed
    Abandoned(String),
}

impl ArtifactState {
    /// Whether the slot will never change state again
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Declared | Self::Writing)
    }
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Declared => write!(f, "declared"),
            Self::Writing => write!(f, "writing"),
            Self::Ready => write!(f, "ready"),
            Self::Invalid(reason) => write!(f, "invalid ({})", reason),
            Self::Abandoned(reason) => write!(f, "abandoned ({})", reason),
        }
    }
}

/// Public view of a slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub slot: String,
    pub producer: String,
    pub consumers: Vec<String>,
    pub state: ArtifactState,
    /// Content hash, once written
    pub hash: Option<String>,
    /// Backend location, once written
    pub location: Option<String>,
    /// Payload has been garbage-collected
    pub released: bool,
}

/// Durable storage for artifact payloads
#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    /// Store a payload, returning its location
    async fn write(&self, artifact: &ArtifactRef, payload: &ArtifactPayload)
        -> DeployflowResult<String>;

    /// Load a payload
    async fn read(&self, artifact: &ArtifactRef) -> DeployflowResult<ArtifactPayload>;

    /// Delete a payload (no-op if absent)
    async fn remove(&self, artifact: &ArtifactRef) -> DeployflowResult<()>;

    /// Delete every payload of a run
    async fn remove_run(&self, run_id: &str) -> DeployflowResult<()>;
}

struct Slot {
    producer: String,
    consumers: Vec<String>,
    consumed: HashSet<String>,
    tx: watch::Sender<ArtifactState>,
    claimed: bool,
    hash: Option<String>,
    location: Option<String>,
    released: bool,
}

impl Slot {
    fn state(&self) -> ArtifactState {
        self.tx.borrow().clone()
    }
}

/// Artifact slots of one pipeline run
pub struct ArtifactStore {
    run_id: String,
    backend: Arc<dyn ArtifactBackend>,
    retain: bool,
    slots: RwLock<HashMap<String, Slot>>,
}

impl ArtifactStore {
    /// Create a store for a run
    pub fn new(run_id: impl Into<String>, backend: Arc<dyn ArtifactBackend>) -> Self {
        Self {
            run_id: run_id.into(),
            backend,
            retain: false,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Keep payloads after their last consumer ran and after teardown
    pub fn with_retention(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Reference to a slot of this run
    pub fn artifact_ref(&self, slot: &str) -> ArtifactRef {
        ArtifactRef {
            run_id: self.run_id.clone(),
            slot: slot.to_string(),
        }
    }

    /// Declare a slot with its producer and consumers
    pub async fn declare(&self, slot: &str, producer: &str, consumers: Vec<String>) {
        let (tx, _) = watch::channel(ArtifactState::Declared);
        let mut slots = self.slots.write().await;
        slots.insert(
            slot.to_string(),
            Slot {
                producer: producer.to_string(),
                consumers,
                consumed: HashSet::new(),
                tx,
                claimed: false,
                hash: None,
                location: None,
                released: false,
            },
        );
        debug!(slot, producer, "Artifact declared");
    }

    /// Mark a slot as being written (its producer started)
    pub async fn open(&self, slot: &str) -> DeployflowResult<()> {
        let slots = self.slots.read().await;
        let entry = Self::lookup(&slots, slot)?;

        entry.tx.send_if_modified(|state| {
            if *state == ArtifactState::Declared {
                *state = ArtifactState::Writing;
                true
            } else {
                false
            }
        });
        debug!(slot, "Artifact opened");
        Ok(())
    }

    /// Write a slot's payload. Each slot is written at most once per run.
    pub async fn put(&self, slot: &str, payload: ArtifactPayload) -> DeployflowResult<ArtifactRef> {
        {
            let mut slots = self.slots.write().await;
            let entry = Self::lookup_mut(&mut slots, slot)?;

            match entry.state() {
                ArtifactState::Abandoned(reason) => {
                    return Err(DeployflowError::NotProduced {
                        slot: slot.to_string(),
                        reason,
                    })
                }
                ArtifactState::Ready | ArtifactState::Invalid(_) => {
                    return Err(DeployflowError::ArtifactAlreadyWritten {
                        slot: slot.to_string(),
                    })
                }
                ArtifactState::Declared | ArtifactState::Writing => {}
            }
            if entry.claimed {
                return Err(DeployflowError::ArtifactAlreadyWritten {
                    slot: slot.to_string(),
                });
            }
            entry.claimed = true;
            entry.tx.send_replace(ArtifactState::Writing);
        }

        let artifact = self.artifact_ref(slot);
        let hash = payload.content_hash();
        let written = self.backend.write(&artifact, &payload).await;

        let mut slots = self.slots.write().await;
        let entry = Self::lookup_mut(&mut slots, slot)?;

        match written {
            Ok(location) => {
                if let ArtifactState::Abandoned(reason) = entry.state() {
                    return Err(DeployflowError::NotProduced {
                        slot: slot.to_string(),
                        reason,
                    });
                }
                debug!(slot, %hash, %location, "Artifact ready");
                entry.hash = Some(hash);
                entry.location = Some(location);
                entry.tx.send_replace(ArtifactState::Ready);
                Ok(artifact)
            }
            Err(e) => {
                entry
                    .tx
                    .send_replace(ArtifactState::Invalid(format!("write failed: {}", e)));
                Err(e)
            }
        }
    }

    /// Read a slot's payload, waiting until it is ready
    pub async fn get(&self, artifact: &ArtifactRef) -> DeployflowResult<ArtifactPayload> {
        if artifact.run_id != self.run_id {
            return Err(DeployflowError::NotProduced {
                slot: artifact.slot.clone(),
                reason: format!("artifact belongs to run '{}'", artifact.run_id),
            });
        }

        let mut rx = {
            let slots = self.slots.read().await;
            Self::lookup(&slots, &artifact.slot)?.tx.subscribe()
        };

        let settled = rx
            .wait_for(ArtifactState::is_settled)
            .await
            .map(|state| state.clone())
            .map_err(|_| DeployflowError::NotProduced {
                slot: artifact.slot.clone(),
                reason: "artifact store was dropped".into(),
            })?;

        match settled {
            ArtifactState::Ready => {
                let released = {
                    let slots = self.slots.read().await;
                    Self::lookup(&slots, &artifact.slot)?.released
                };
                if released {
                    return Err(DeployflowError::NotProduced {
                        slot: artifact.slot.clone(),
                        reason: "payload was released after its last consumer".into(),
                    });
                }
                self.backend.read(artifact).await
            }
            ArtifactState::Invalid(reason) | ArtifactState::Abandoned(reason) => {
                Err(DeployflowError::NotProduced {
                    slot: artifact.slot.clone(),
                    reason,
                })
            }
            pending => Err(DeployflowError::StateError {
                message: format!("artifact '{}' woke while {}", artifact.slot, pending),
            }),
        }
    }

    /// Read a slot of this run by name
    pub async fn get_slot(&self, slot: &str) -> DeployflowResult<ArtifactPayload> {
        self.get(&self.artifact_ref(slot)).await
    }

    /// Whether the slot holds a readable payload
    pub async fn is_ready(&self, slot: &str) -> bool {
        let slots = self.slots.read().await;
        slots
            .get(slot)
            .map(|s| s.state() == ArtifactState::Ready && !s.released)
            .unwrap_or(false)
    }

    /// Current state of a slot
    pub async fn state(&self, slot: &str) -> Option<ArtifactState> {
        let slots = self.slots.read().await;
        slots.get(slot).map(Slot::state)
    }

    /// Snapshot of a slot
    pub async fn info(&self, slot: &str) -> Option<ArtifactInfo> {
        let slots = self.slots.read().await;
        slots.get(slot).map(|s| Self::to_info(slot, s))
    }

    /// Snapshot of every slot, sorted by name
    pub async fn list(&self) -> Vec<ArtifactInfo> {
        let slots = self.slots.read().await;
        let mut infos: Vec<ArtifactInfo> = slots
            .iter()
            .map(|(name, s)| Self::to_info(name, s))
            .collect();
        infos.sort_by(|a, b| a.slot.cmp(&b.slot));
        infos
    }

    /// Mark a slot as unusable after its producer failed
    pub async fn invalidate(&self, slot: &str, reason: &str) -> DeployflowResult<()> {
        let was_written = {
            let slots = self.slots.read().await;
            let entry = Self::lookup(&slots, slot)?;
            if matches!(entry.state(), ArtifactState::Abandoned(_)) {
                return Ok(());
            }
            entry
                .tx
                .send_replace(ArtifactState::Invalid(reason.to_string()));
            entry.location.is_some()
        };

        debug!(slot, reason, "Artifact invalidated");
        if was_written {
            self.backend.remove(&self.artifact_ref(slot)).await?;
        }
        Ok(())
    }

    /// Record that a consumer finished with a slot. After the last declared
    /// consumer the payload is released unless retention is on.
    pub async fn mark_consumed(&self, slot: &str, consumer: &str) -> DeployflowResult<()> {
        let release = {
            let mut slots = self.slots.write().await;
            let entry = Self::lookup_mut(&mut slots, slot)?;
            entry.consumed.insert(consumer.to_string());

            let all_done = entry.consumers.iter().all(|c| entry.consumed.contains(c));
            let release = all_done
                && !self.retain
                && !entry.released
                && entry.state() == ArtifactState::Ready;
            if release {
                entry.released = true;
            }
            release
        };

        if release {
            debug!(slot, "Releasing artifact after last consumer");
            self.backend.remove(&self.artifact_ref(slot)).await?;
        }
        Ok(())
    }

    /// Abandon every slot that was not produced, waking blocked readers
    pub async fn abandon_all(&self, reason: &str) {
        let slots = self.slots.read().await;
        for (name, entry) in slots.iter() {
            let changed = entry.tx.send_if_modified(|state| {
                if state.is_settled() {
                    false
                } else {
                    *state = ArtifactState::Abandoned(reason.to_string());
                    true
                }
            });
            if changed {
                debug!(slot = %name, reason, "Artifact abandoned");
            }
        }
    }

    /// Tear the run down: abandon pending slots and, without retention,
    /// delete every payload of the run.
    pub async fn teardown(&self, reason: &str) -> DeployflowResult<()> {
        self.abandon_all(reason).await;

        if !self.retain {
            self.backend.remove_run(&self.run_id).await?;
            let mut slots = self.slots.write().await;
            for entry in slots.values_mut() {
                if entry.state() == ArtifactState::Ready {
                    entry.released = true;
                }
            }
        }
        Ok(())
    }

    fn lookup<'a>(slots: &'a HashMap<String, Slot>, slot: &str) -> DeployflowResult<&'a Slot> {
        slots.get(slot).ok_or_else(|| DeployflowError::NotProduced {
            slot: slot.to_string(),
            reason: "slot is not declared in this run".into(),
        })
    }

    fn lookup_mut<'a>(
        slots: &'a mut HashMap<String, Slot>,
        slot: &str,
    ) -> DeployflowResult<&'a mut Slot> {
        slots.get_mut(slot).ok_or_else(|| DeployflowError::NotProduced {
            slot: slot.to_string(),
            reason: "slot is not declared in this run".into(),
        })
    }

    fn to_info(name: &str, slot: &Slot) -> ArtifactInfo {
        ArtifactInfo {
            slot: name.to_string(),
            producer: slot.producer.clone(),
            consumers: slot.consumers.clone(),
            state: slot.state(),
            hash: slot.hash.clone(),
            location: slot.location.clone(),
            released: slot.released,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, task};

    fn store() -> ArtifactStore {
        ArtifactStore::new("run-1", Arc::new(MemoryBackend::new()))
    }

    fn payload() -> ArtifactPayload {
        ArtifactPayload::new()
            .with_file("imagedefinitions.json", b"[]".to_vec())
            .with_metadata("source_version", "abc")
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = store();
        store
            .declare("out", "build", vec!["deploy".into()])
            .await;
        store.open("out").await.unwrap();

        let artifact = store.put("out", payload()).await.unwrap();
        assert!(store.is_ready("out").await);

        let read = store.get(&artifact).await.unwrap();
        assert_eq!(read, payload());

        let info = store.info("out").await.unwrap();
        assert_eq!(info.hash, Some(payload().content_hash()));
    }

    #[tokio::test]
    async fn test_second_put_rejected() {
        let store = store();
        store.declare("out", "build", vec![]).await;
        store.put("out", payload()).await.unwrap();

        let result = store
            .put("out", ArtifactPayload::new().with_file("x", b"y".to_vec()))
            .await;
        assert!(matches!(
            result,
            Err(DeployflowError::ArtifactAlreadyWritten { .. })
        ));
        assert_eq!(store.get_slot("out").await.unwrap(), payload());
    }

    #[tokio::test]
    async fn test_get_blocks_until_put() {
        let store = Arc::new(store());
        store.declare("out", "build", vec![]).await;

        let reader = Arc::clone(&store);
        let mut waiting = task::spawn(async move { reader.get_slot("out").await });
        assert_pending!(waiting.poll());

        store.put("out", payload()).await.unwrap();
        assert!(waiting.is_woken());
        let read = waiting.await.unwrap();
        assert_eq!(read.metadata("source_version"), Some("abc"));
    }

    #[tokio::test]
    async fn test_abandon_wakes_readers() {
        let store = Arc::new(store());
        store.declare("out", "build", vec![]).await;

        let reader = Arc::clone(&store);
        let handle = tokio::spawn(async move { reader.get_slot("out").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.abandon_all("run cancelled").await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(DeployflowError::NotProduced { .. })));

        let late = store.put("out", payload()).await;
        assert!(matches!(late, Err(DeployflowError::NotProduced { .. })));
    }

    #[tokio::test]
    async fn test_invalidate_written_output() {
        let store = store();
        store.declare("out", "build", vec![]).await;
        store.put("out", payload()).await.unwrap();

        store.invalidate("out", "producer failed").await.unwrap();
        assert!(!store.is_ready("out").await);
        assert!(matches!(
            store.get_slot("out").await,
            Err(DeployflowError::NotProduced { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_after_last_consumer() {
        let store = store();
        store
            .declare("out", "build", vec!["a".into(), "b".into()])
            .await;
        store.put("out", payload()).await.unwrap();

        store.mark_consumed("out", "a").await.unwrap();
        assert!(store.is_ready("out").await);

        store.mark_consumed("out", "b").await.unwrap();
        assert!(!store.is_ready("out").await);
        assert!(store.info("out").await.unwrap().released);
    }

    #[tokio::test]
    async fn test_retention_keeps_payload() {
        let store = store().with_retention(true);
        store.declare("out", "build", vec!["a".into()]).await;
        store.put("out", payload()).await.unwrap();

        store.mark_consumed("out", "a").await.unwrap();
        store.teardown("run finished").await.unwrap();
        assert!(store.is_ready("out").await);
    }

    #[tokio::test]
    async fn test_foreign_run_rejected() {
        let store = store();
        store.declare("out", "build", vec![]).await;
        store.put("out", payload()).await.unwrap();

        let foreign = ArtifactRef {
            run_id: "run-2".into(),
            slot: "out".into(),
        };
        assert!(matches!(
            store.get(&foreign).await,
            Err(DeployflowError::NotProduced { .. })
        ));
    }
}
