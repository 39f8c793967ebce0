//! Persistent fact store (C9): an append-only durable log of FBFT facts
//! sufficient to resume a replica deterministically.
//!
//! Grounded on spec §4.9 directly; the append-only JSON-lines style follows
//! the teacher's `serde_json`+`tokio::fs` use in `lib.rs`'s
//! `generate_keys`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::errors::StoreError;
use crate::messages::{Message, Request};

/// One durable fact: a request synthesised locally, a message sent or
/// received, or a bookkeeping update (view, checkpoint, last reply time).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Fact {
    Request(Request),
    Sent(Message),
    Received(Message),
    ViewAdvanced { v: u64 },
    CheckpointAdvanced { h: u64 },
    LastReplyTime { t: u32 },
}

/// An append-only log at `<datadir>/fbft.log`. Every fact is appended as
/// one JSON line; replay on startup reconstructs replica state.
pub struct FactStore {
    path: PathBuf,
}

impl FactStore {
    /// Opens the store at `datadir`, truncating any existing log first if
    /// `reset` is set (§4.9 "Reset flag clears the store").
    pub async fn open(datadir: &Path, reset: bool) -> Result<Self, StoreError> {
        let path = datadir.join("fbft.log");
        if reset && path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(FactStore { path })
    }

    pub async fn append(&self, fact: &Fact) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(fact)?;
        line.push('\n');
        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Replays every fact in the log, in append order.
    pub async fn replay(&self) -> Result<Vec<Fact>, StoreError> {
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut facts = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            facts.push(serde_json::from_str(&line)?);
        }
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn facts_replay_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path(), false).await.unwrap();
        store.append(&Fact::ViewAdvanced { v: 1 }).await.unwrap();
        store.append(&Fact::CheckpointAdvanced { h: 2 }).await.unwrap();

        let facts = store.replay().await.unwrap();
        assert_eq!(facts.len(), 2);
        assert!(matches!(facts[0], Fact::ViewAdvanced { v: 1 }));
        assert!(matches!(facts[1], Fact::CheckpointAdvanced { h: 2 }));
    }

    #[tokio::test]
    async fn reset_clears_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FactStore::open(dir.path(), false).await.unwrap();
            store.append(&Fact::ViewAdvanced { v: 1 }).await.unwrap();
        }
        let store = FactStore::open(dir.path(), true).await.unwrap();
        assert!(store.replay().await.unwrap().is_empty());
    }
}
