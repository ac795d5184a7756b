// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! In-memory artifact backend, used when persistence is off and in tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{ArtifactBackend, ArtifactPayload, ArtifactRef};
use crate::errors::{DeployflowError, DeployflowResult};

/// Payloads kept in process memory
#[derive(Default)]
pub struct MemoryBackend {
    payloads: Mutex<HashMap<ArtifactRef, ArtifactPayload>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payloads
    pub fn len(&self) -> usize {
        self.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> DeployflowResult<std::sync::MutexGuard<'_, HashMap<ArtifactRef, ArtifactPayload>>> {
        self.payloads.lock().map_err(|_| DeployflowError::StateError {
            message: "artifact memory backend lock poisoned".into(),
        })
    }
}

#[async_trait]
impl ArtifactBackend for MemoryBackend {
    async fn write(
        &self,
        artifact: &ArtifactRef,
        payload: &ArtifactPayload,
    ) -> DeployflowResult<String> {
        self.lock()?.insert(artifact.clone(), payload.clone());
        Ok(format!("memory://{}", artifact))
    }

    async fn read(&self, artifact: &ArtifactRef) -> DeployflowResult<ArtifactPayload> {
        self.lock()?
            .get(artifact)
            .cloned()
            .ok_or_else(|| DeployflowError::NotProduced {
                slot: artifact.slot.clone(),
                reason: "payload is not stored".into(),
            })
    }

    async fn remove(&self, artifact: &ArtifactRef) -> DeployflowResult<()> {
        self.lock()?.remove(artifact);
        Ok(())
    }

    async fn remove_run(&self, run_id: &str) -> DeployflowResult<()> {
        self.lock()?.retain(|artifact, _| artifact.run_id != run_id);
        Ok(())
    }
}
