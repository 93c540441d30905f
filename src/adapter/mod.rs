//! The adapter contract: how the protocol engine obtains mailboxes.
//!
//! An adapter authenticates users and hands out mailbox snapshots; the
//! engine knows nothing about where the messages live. Adapters must be
//! safe for concurrent use from many session tasks, or be wrapped with
//! [`serialized`] so every call funnels through one mutex.

mod directory;
mod memory;

pub use directory::DirectoryAdapter;
pub use memory::MemoryAdapter;

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Failures an adapter can report. Transient failures map to
/// `[SYS/TEMP]` on the wire, permanent ones to `[SYS/PERM]`.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("backend unavailable: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Permanent(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// One message as the adapter lists it: a stable unique id and its size
/// in octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub uid: String,
    pub size: u64,
}

/// Back-end message source.
pub trait Adapter: Send + Sync {
    /// Verifies credentials; `Ok(None)` means they were wrong.
    fn authenticate(&self, username: &str, password: &str) -> AdapterResult<Option<String>>;

    /// Whether this backend can expose APOP shared secrets at all. When
    /// false (the default), the greeting carries no timestamp token and
    /// APOP is left out of the capability list.
    fn offers_apop(&self) -> bool {
        false
    }

    /// The user's APOP shared secret, if this backend can expose one.
    fn apop_secret(&self, _username: &str) -> AdapterResult<Option<String>> {
        Ok(None)
    }

    /// Whether read-only sessions make sense for this backend.
    fn read_only_supported(&self) -> bool {
        true
    }

    /// Opens a mailbox snapshot for an authenticated identity. Must be
    /// idempotent for read-only openings: several concurrent read-only
    /// sessions may each hold their own snapshot.
    fn open_mailbox(&self, identity: &str, read_only: bool) -> AdapterResult<Box<dyn Mailbox>>;
}

/// An open mailbox snapshot. Message indices are 0-based positions into
/// the sequence returned by [`Mailbox::list_messages`] and stay valid for
/// the lifetime of the snapshot.
pub trait Mailbox: Send {
    /// Lists all messages. The order is the adapter's choice but must
    /// not change within this snapshot.
    fn list_messages(&self) -> AdapterResult<Vec<MessageEntry>>;

    /// The full RFC 5322 message bytes. Called at most once per RETR.
    fn fetch_message(&self, index: usize) -> AdapterResult<Vec<u8>>;

    /// Headers, the blank separator, and the first `lines` body lines.
    fn fetch_top(&self, index: usize, lines: usize) -> AdapterResult<Vec<u8>> {
        let body = self.fetch_message(index)?;
        Ok(crate::proto::codec::message_top(&body, lines))
    }

    /// Permanently removes the given messages. Only invoked when a
    /// session reaches UPDATE through QUIT.
    fn commit_deletions(&mut self, indices: &[usize]) -> AdapterResult<()>;

    /// Releases resources without committing anything.
    fn abandon(&mut self) {}
}

/// Wraps an adapter so that all adapter and mailbox calls are serialized
/// behind a single mutex, for backends that are not internally
/// concurrent (`serialize_adapter_calls` in the configuration).
pub fn serialized(inner: Arc<dyn Adapter>) -> Arc<dyn Adapter> {
    Arc::new(SerializedAdapter {
        inner,
        gate: Arc::new(Mutex::new(())),
    })
}

struct SerializedAdapter {
    inner: Arc<dyn Adapter>,
    gate: Arc<Mutex<()>>,
}

impl SerializedAdapter {
    fn locked<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }
}

impl Adapter for SerializedAdapter {
    fn authenticate(&self, username: &str, password: &str) -> AdapterResult<Option<String>> {
        self.locked(|| self.inner.authenticate(username, password))
    }

    fn offers_apop(&self) -> bool {
        self.locked(|| self.inner.offers_apop())
    }

    fn apop_secret(&self, username: &str) -> AdapterResult<Option<String>> {
        self.locked(|| self.inner.apop_secret(username))
    }

    fn read_only_supported(&self) -> bool {
        self.locked(|| self.inner.read_only_supported())
    }

    fn open_mailbox(&self, identity: &str, read_only: bool) -> AdapterResult<Box<dyn Mailbox>> {
        let mailbox = self.locked(|| self.inner.open_mailbox(identity, read_only))?;
        Ok(Box::new(SerializedMailbox {
            inner: mailbox,
            gate: self.gate.clone(),
        }))
    }
}

struct SerializedMailbox {
    inner: Box<dyn Mailbox>,
    gate: Arc<Mutex<()>>,
}

impl SerializedMailbox {
    fn locked<T>(&self, f: impl FnOnce(&dyn Mailbox) -> T) -> T {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        f(self.inner.as_ref())
    }
}

impl Mailbox for SerializedMailbox {
    fn list_messages(&self) -> AdapterResult<Vec<MessageEntry>> {
        self.locked(|m| m.list_messages())
    }

    fn fetch_message(&self, index: usize) -> AdapterResult<Vec<u8>> {
        self.locked(|m| m.fetch_message(index))
    }

    fn fetch_top(&self, index: usize, lines: usize) -> AdapterResult<Vec<u8>> {
        self.locked(|m| m.fetch_top(index, lines))
    }

    fn commit_deletions(&mut self, indices: &[usize]) -> AdapterResult<()> {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.commit_deletions(indices)
    }

    fn abandon(&mut self) {
        let _guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.abandon();
    }
}
