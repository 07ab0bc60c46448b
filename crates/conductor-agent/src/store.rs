//! Conversation snapshots on disk.

use std::path::{Path, PathBuf};

use conductor_core::{Conversation, Result};
use tracing::debug;

/// Writes the whole conversation as a JSON array of turns. Last write wins.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    path: PathBuf,
}

impl ConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the snapshot with `conversation`.
    ///
    /// The file is written next to its final location and renamed into
    /// place, so readers never see a half-written snapshot.
    pub async fn save(&self, conversation: &Conversation) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(conversation)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), turns = conversation.len(), "Saved conversation");
        Ok(())
    }

    /// Read the last snapshot, if there is one.
    pub async fn load(&self) -> Result<Option<Conversation>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
