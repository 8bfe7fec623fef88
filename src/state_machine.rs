//! Key-value store driven by the apply channel.
//!
//! Commands (state-changing operations that go through Raft):
//! - `SET key value` - set a key to a value (the value may contain spaces)
//! - `DELETE key` - remove a key
//!
//! Reads go straight to `get()` and bypass the log.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| RaftError::InvalidArgument("command is not valid UTF-8".to_string()))?;
        let parts: Vec<&str> = text.trim().splitn(3, ' ').collect();

        match parts.as_slice() {
            ["SET", key, value] if !key.is_empty() => Ok(Self::Set {
                key: key.to_string(),
                value: value.to_string(),
            }),
            ["DELETE", key] if !key.is_empty() => Ok(Self::Delete {
                key: key.to_string(),
            }),
            _ => Err(RaftError::InvalidArgument(format!(
                "unknown command: {}",
                text
            ))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Set { key, value } => format!("SET {} {}", key, value).into_bytes(),
            Self::Delete { key } => format!("DELETE {}", key).into_bytes(),
        }
    }
}

/// In-memory key-value state machine
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KvStore {
    data: BTreeMap<String, String>,
    last_applied: u64,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Index of the last log entry reflected in the store.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Apply the committed entry at `index`. Entries at or below
    /// `last_applied` are ignored; malformed commands consume their index
    /// without changing the data.
    pub fn apply(&mut self, index: u64, command: &[u8]) {
        if index <= self.last_applied {
            return;
        }
        self.last_applied = index;

        match KvCommand::parse(command) {
            Ok(KvCommand::Set { key, value }) => {
                self.data.insert(key, value);
            }
            Ok(KvCommand::Delete { key }) => {
                self.data.remove(&key);
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping malformed command");
            }
        }
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Replace the whole store with a snapshot taken through `index`.
    pub fn restore(&mut self, index: u64, data: &[u8]) -> Result<()> {
        let mut restored: KvStore = serde_json::from_slice(data)?;
        restored.last_applied = index;
        *self = restored;
        Ok(())
    }
}
