//! Per-user mailbox locking.
//!
//! POP3 grants one session exclusive access to a maildrop; the read-only
//! extension relaxes this to any number of non-deleting sessions. At any
//! moment a user has either one exclusive holder and no readers, or no
//! exclusive holder and any number of readers.
//!
//! Acquisition returns an RAII guard; dropping it releases the slot, so
//! every exit path of a session task, panics included, releases the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// How a session wants to hold the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    ReadOnly,
}

/// The mailbox is held in a conflicting mode by another session.
#[derive(Debug, PartialEq, Eq)]
pub struct LockBusy;

#[derive(Default)]
struct LockEntry {
    exclusive: Option<u64>,
    readers: HashSet<u64>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.readers.is_empty()
    }
}

/// Process-wide lock registry, keyed by user identity. Constructed once
/// at server start and shared by reference; every operation is one short
/// critical section.
#[derive(Clone, Default)]
pub struct MailboxLocks {
    inner: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl MailboxLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(
        &self,
        user: &str,
        mode: LockMode,
        session_id: u64,
    ) -> Result<LockGuard, LockBusy> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(user.to_string()).or_default();

        match mode {
            LockMode::Exclusive => {
                if !entry.is_free() {
                    return Err(LockBusy);
                }
                entry.exclusive = Some(session_id);
            }
            LockMode::ReadOnly => {
                if entry.exclusive.is_some() {
                    return Err(LockBusy);
                }
                entry.readers.insert(session_id);
            }
        }

        Ok(LockGuard {
            locks: self.clone(),
            user: user.to_string(),
            session_id,
        })
    }

    fn release(&self, user: &str, session_id: u64) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(user) {
            if entry.exclusive == Some(session_id) {
                entry.exclusive = None;
            }
            entry.readers.remove(&session_id);
            if entry.is_free() {
                map.remove(user);
            }
        }
    }

    #[cfg(test)]
    fn holder_count(&self, user: &str) -> (bool, usize) {
        let map = self.inner.lock().unwrap();
        map.get(user)
            .map(|e| (e.exclusive.is_some(), e.readers.len()))
            .unwrap_or((false, 0))
    }
}

/// Held for as long as a session owns its maildrop slot.
pub struct LockGuard {
    locks: MailboxLocks,
    user: String,
    session_id: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.user, self.session_id);
    }
}
