//! In-memory key-value storage and command dispatch.
//!
//! `Storage` itself is not synchronized. The event-loop runtime owns one
//! directly; the threaded runtime shares one behind a mutex and holds the
//! lock for exactly one command at a time.

use crate::protocol::Status;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Storage shared between connection workers.
pub type SharedStorage = Arc<Mutex<Storage>>;

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: Bytes },
    Set { key: Bytes, value: Bytes },
    Del { key: Bytes },
    /// Unknown name or wrong arity.
    Unknown,
}

impl Command {
    /// Interpret a field sequence `[name, args...]`.
    pub fn from_fields(mut fields: Vec<Bytes>) -> Self {
        if fields.is_empty() {
            return Command::Unknown;
        }
        let name = fields.remove(0);
        let mut args = fields.into_iter();
        match (&name[..], args.len()) {
            (b"get", 1) => Command::Get {
                key: args.next().unwrap_or_default(),
            },
            (b"del", 1) => Command::Del {
                key: args.next().unwrap_or_default(),
            },
            (b"set", 2) => Command::Set {
                key: args.next().unwrap_or_default(),
                value: args.next().unwrap_or_default(),
            },
            _ => Command::Unknown,
        }
    }
}

/// Outcome of a command, ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub payload: Bytes,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            payload: Bytes::new(),
        }
    }

    pub fn value(payload: Bytes) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    pub fn invalid() -> Self {
        Self {
            status: Status::Invalid,
            payload: Bytes::new(),
        }
    }
}

/// Byte-string to byte-string map.
#[derive(Debug, Default)]
pub struct Storage {
    data: HashMap<Bytes, Bytes>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a fresh store for sharing across threads.
    pub fn shared() -> SharedStorage {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    /// Insert or overwrite a value.
    pub fn set(&mut self, key: Bytes, value: Bytes) {
        self.data.insert(key, value);
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Apply a command and produce its reply.
    pub fn execute(&mut self, command: Command) -> Reply {
        match command {
            Command::Get { key } => match self.get(&key) {
                Some(value) => {
                    trace!(key = ?key, len = value.len(), "get hit");
                    Reply::value(value)
                }
                None => {
                    trace!(key = ?key, "get miss");
                    Reply::invalid()
                }
            },
            Command::Set { key, value } => {
                trace!(key = ?key, len = value.len(), "set");
                self.set(key, value);
                Reply::ok()
            }
            Command::Del { key } => {
                let removed = self.delete(&key);
                trace!(key = ?key, removed, "del");
                Reply::ok()
            }
            Command::Unknown => Reply::invalid(),
        }
    }
}

/// Lock shared storage, recovering the guard if another worker panicked
/// while holding it.
pub fn lock(storage: &SharedStorage) -> MutexGuard<'_, Storage> {
    storage.lock().unwrap_or_else(PoisonError::into_inner)
}
