//! In-memory adapter: fixed users with fixed message lists.
//!
//! Useful as a demo backend and as the test suite's workhorse. Because
//! it knows the plaintext passwords, it can expose them as APOP shared
//! secrets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use super::{Adapter, AdapterError, AdapterResult, Mailbox, MessageEntry};
use crate::proto::codec;

#[derive(Default)]
struct State {
    users: HashMap<String, UserBox>,
    /// `(user, committed uids)` per commit, newest last.
    commit_log: Vec<(String, Vec<String>)>,
}

struct UserBox {
    password: String,
    messages: Vec<StoredMessage>,
    next_seq: u64,
}

#[derive(Clone)]
struct StoredMessage {
    uid: String,
    body: Vec<u8>,
}

/// A shared in-memory message store.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    state: Arc<Mutex<State>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user with a password and initial messages. Message
    /// text may use any line endings; it is stored CRLF-canonical so
    /// reported sizes match what goes over the wire.
    pub fn add_user(&self, username: &str, password: &str, messages: &[&str]) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let user = state.users.entry(username.to_string()).or_insert(UserBox {
            password: password.to_string(),
            messages: Vec::new(),
            next_seq: 0,
        });
        for text in messages {
            let body = codec::canonicalize(text.as_bytes());
            let uid = message_uid(username, user.next_seq, &body);
            user.next_seq += 1;
            user.messages.push(StoredMessage { uid, body });
        }
    }

    /// Commits recorded so far, for inspection by tests.
    pub fn commit_log(&self) -> Vec<(String, Vec<String>)> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .commit_log
            .clone()
    }

    /// Number of messages currently stored for a user.
    pub fn message_count(&self, username: &str) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .users
            .get(username)
            .map(|u| u.messages.len())
            .unwrap_or(0)
    }
}

/// Stable across sessions: derived from the owner, the insertion
/// sequence number, and the content.
fn message_uid(username: &str, seq: u64, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(body);
    let digest = hasher.finalize();
    let mut uid = String::with_capacity(32);
    for byte in &digest[..16] {
        uid.push_str(&format!("{:02x}", byte));
    }
    uid
}

impl Adapter for MemoryAdapter {
    fn authenticate(&self, username: &str, password: &str) -> AdapterResult<Option<String>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.users.get(username) {
            Some(user) if user.password == password => Ok(Some(username.to_string())),
            _ => Ok(None),
        }
    }

    fn offers_apop(&self) -> bool {
        true
    }

    fn apop_secret(&self, username: &str) -> AdapterResult<Option<String>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.users.get(username).map(|u| u.password.clone()))
    }

    fn open_mailbox(&self, identity: &str, _read_only: bool) -> AdapterResult<Box<dyn Mailbox>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let user = state
            .users
            .get(identity)
            .ok_or_else(|| AdapterError::Permanent(format!("no mailbox for {identity}")))?;
        Ok(Box::new(MemoryMailbox {
            state: self.state.clone(),
            user: identity.to_string(),
            snapshot: user.messages.clone(),
        }))
    }
}

struct MemoryMailbox {
    state: Arc<Mutex<State>>,
    user: String,
    snapshot: Vec<StoredMessage>,
}

impl MemoryMailbox {
    fn message(&self, index: usize) -> AdapterResult<&StoredMessage> {
        self.snapshot
            .get(index)
            .ok_or_else(|| AdapterError::Permanent(format!("message index {index} out of range")))
    }
}

impl Mailbox for MemoryMailbox {
    fn list_messages(&self) -> AdapterResult<Vec<MessageEntry>> {
        Ok(self
            .snapshot
            .iter()
            .map(|m| MessageEntry {
                uid: m.uid.clone(),
                size: m.body.len() as u64,
            })
            .collect())
    }

    fn fetch_message(&self, index: usize) -> AdapterResult<Vec<u8>> {
        Ok(self.message(index)?.body.clone())
    }

    fn commit_deletions(&mut self, indices: &[usize]) -> AdapterResult<()> {
        let mut uids = Vec::with_capacity(indices.len());
        for &index in indices {
            uids.push(self.message(index)?.uid.clone());
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(user) = state.users.get_mut(&self.user) {
            user.messages.retain(|m| !uids.contains(&m.uid));
        }
        state.commit_log.push((self.user.clone(), uids));
        Ok(())
    }
}
