//! The store boundary between the scheduler and wherever multicloud stacks
//! are defined.
//!
//! The reconciliation core only ever needs [`StackStore::list`]; CRUD,
//! schema, and the backing database are all someone else's concern. The two
//! implementations here exist to make `spreaderd` runnable end to end and to
//! back the workspace's scenario tests, not as the production answer to
//! stack persistence.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use spread_proto::MulticloudStack;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait StackStore: Send + Sync {
    /// Returns every currently registered stack. Ordering is stable but
    /// otherwise unspecified; the core does not depend on a particular
    /// cross-tick ordering.
    async fn list(&self) -> Result<Vec<MulticloudStack>, StoreError>;
}

// ─── In-memory reference store ────────────────────────────────────────────────

/// Stacks held entirely in memory, keyed by stack name. Useful for tests and
/// for operators who manage stacks out of band and just want `spreaderd` to
/// reconcile a fixed set.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    stacks: RwLock<HashMap<String, MulticloudStack>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack(self, stack: MulticloudStack) -> Self {
        self.stacks.write().insert(stack.stack_name.clone(), stack);
        self
    }

    pub fn upsert(&self, stack: MulticloudStack) {
        self.stacks.write().insert(stack.stack_name.clone(), stack);
    }

    pub fn remove(&self, stack_name: &str) {
        self.stacks.write().remove(stack_name);
    }
}

#[async_trait]
impl StackStore for InMemoryStore {
    async fn list(&self) -> Result<Vec<MulticloudStack>, StoreError> {
        Ok(self.stacks.read().values().cloned().collect())
    }
}

// ─── JSON-file-backed reference store ─────────────────────────────────────────

/// Stacks persisted as a single pretty-printed JSON array on disk, reloaded
/// on every `list` call so an operator editing the file by hand is picked up
/// on the next tick.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, stacks: &[MulticloudStack]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(stacks)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[async_trait]
impl StackStore for JsonFileStore {
    async fn list(&self) -> Result<Vec<MulticloudStack>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(stacks) => Ok(stacks),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "corrupt stack file, treating as empty");
                    Ok(Vec::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no stack file, starting empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn path_for(dir: &Path) -> PathBuf {
    dir.join("stacks.json")
}
