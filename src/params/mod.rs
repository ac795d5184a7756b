// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Deferred parameter registry
//!
//! Lets a later action read a value that only exists after an earlier action
//! ran (the canonical case being the image tag a build produces). Each
//! parameter is declared with its exporting action, written at most once per
//! run, and read through [`ParameterRegistry::resolve`], which waits until
//! the value is exported or the value can no longer arrive.
//!
//! Every parameter owns one `watch` channel, so readers see either "not yet
//! available" or the final value, never anything in between.

use std::collections::{BTreeMap, HashMap};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

use crate::errors::{DeployflowError, DeployflowResult};
use crate::pipeline::Pipeline;

/// State of one deferred parameter within a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterState {
    /// Declared, not yet exported
    Pending,
    /// Exported; final for the rest of the run
    Exported(String),
    /// Can never be exported (exporter failed, run cancelled or finished)
    Abandoned(String),
}

impl ParameterState {
    fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A declared parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterHandle {
    name: String,
    exporter: String,
}

impl ParameterHandle {
    /// Registry name (`<action>.<variable>`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The only action allowed to export this parameter
    pub fn exporter(&self) -> &str {
        &self.exporter
    }
}

struct Entry {
    exporter: String,
    tx: watch::Sender<ParameterState>,
}

/// Run-scoped registry of deferred parameters
pub struct ParameterRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ParameterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with every parameter the pipeline declares
    pub fn for_pipeline(pipeline: &Pipeline) -> DeployflowResult<Self> {
        let mut entries = HashMap::new();
        for (name, exporter) in pipeline.declared_parameters() {
            if entries.contains_key(&name) {
                return Err(DeployflowError::InvalidPipeline {
                    reason: format!("Parameter '{}' is declared twice", name),
                    help: None,
                });
            }
            let (tx, _) = watch::channel(ParameterState::Pending);
            entries.insert(name, Entry { exporter, tx });
        }

        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Declare a parameter and its exporting action
    pub async fn declare(&self, name: &str, exporter: &str) -> DeployflowResult<ParameterHandle> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(name) {
            if existing.exporter != exporter {
                return Err(DeployflowError::InvalidPipeline {
                    reason: format!(
                        "Parameter '{}' is already exported by '{}'",
                        name, existing.exporter
                    ),
                    help: None,
                });
            }
        } else {
            let (tx, _) = watch::channel(ParameterState::Pending);
            entries.insert(
                name.to_string(),
                Entry {
                    exporter: exporter.to_string(),
                    tx,
                },
            );
            debug!(parameter = name, exporter, "Parameter declared");
        }

        Ok(ParameterHandle {
            name: name.to_string(),
            exporter: exporter.to_string(),
        })
    }

    /// Export a value. Fails with `DuplicateExport` on a second export,
    /// leaving the first value in place.
    pub async fn export(&self, action: &str, name: &str, value: &str) -> DeployflowResult<()> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| DeployflowError::UndeclaredParameter {
                name: name.to_string(),
            })?;

        if entry.exporter != action {
            return Err(DeployflowError::ExportNotOwned {
                name: name.to_string(),
                action: action.to_string(),
                owner: entry.exporter.clone(),
            });
        }

        let mut rejected = None;
        entry.tx.send_if_modified(|state| match state {
            ParameterState::Pending => {
                *state = ParameterState::Exported(value.to_string());
                true
            }
            ParameterState::Exported(_) => {
                rejected = Some(DeployflowError::DuplicateExport {
                    name: name.to_string(),
                });
                false
            }
            ParameterState::Abandoned(reason) => {
                rejected = Some(DeployflowError::NeverExported {
                    name: name.to_string(),
                    reason: reason.clone(),
                });
                false
            }
        });

        match rejected {
            Some(err) => Err(err),
            None => {
                debug!(parameter = name, action, "Parameter exported");
                Ok(())
            }
        }
    }

    /// Wait for a parameter's value
    pub async fn resolve(&self, name: &str) -> DeployflowResult<String> {
        let mut rx = {
            let entries = self.entries.read().await;
            entries
                .get(name)
                .ok_or_else(|| DeployflowError::UndeclaredParameter {
                    name: name.to_string(),
                })?
                .tx
                .subscribe()
        };

        let settled = rx
            .wait_for(ParameterState::is_settled)
            .await
            .map(|state| state.clone())
            .map_err(|_| DeployflowError::NeverExported {
                name: name.to_string(),
                reason: "registry was dropped".into(),
            })?;

        match settled {
            ParameterState::Exported(value) => Ok(value),
            ParameterState::Abandoned(reason) => Err(DeployflowError::NeverExported {
                name: name.to_string(),
                reason,
            }),
            ParameterState::Pending => Err(DeployflowError::StateError {
                message: format!("parameter '{}' woke while pending", name),
            }),
        }
    }

    /// Current value without waiting
    pub async fn try_get(&self, name: &str) -> Option<String> {
        let entries = self.entries.read().await;
        let entry = entries.get(name)?;
        let state = entry.tx.borrow();
        match &*state {
            ParameterState::Exported(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Current state of a parameter
    pub async fn state(&self, name: &str) -> Option<ParameterState> {
        let entries = self.entries.read().await;
        entries.get(name).map(|e| e.tx.borrow().clone())
    }

    /// The exporting action of a parameter
    pub async fn exporter_of(&self, name: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries.get(name).map(|e| e.exporter.clone())
    }

    /// Every exported value of the run
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter_map(|(name, entry)| match &*entry.tx.borrow() {
                ParameterState::Exported(value) => Some((name.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Abandon the unexported parameters of the given actions
    pub async fn abandon_exports_of(&self, actions: &[String], reason: &str) {
        let entries = self.entries.read().await;
        for (name, entry) in entries.iter() {
            if actions.contains(&entry.exporter) && Self::abandon(entry, reason) {
                warn!(parameter = %name, reason, "Parameter will never be exported");
            }
        }
    }

    /// Abandon every parameter still pending; the run is over
    pub async fn close(&self, reason: &str) {
        let entries = self.entries.read().await;
        for (name, entry) in entries.iter() {
            if Self::abandon(entry, reason) {
                debug!(parameter = %name, reason, "Parameter closed without export");
            }
        }
    }

    fn abandon(entry: &Entry, reason: &str) -> bool {
        entry.tx.send_if_modified(|state| {
            if state.is_settled() {
                false
            } else {
                *state = ParameterState::Abandoned(reason.to_string());
                true
            }
        })
    }
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
