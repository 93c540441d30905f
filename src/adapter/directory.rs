//! Directory-backed multi-user adapter.
//!
//! Layout: one subdirectory per user under the configured root, holding
//! `.eml` files. The file stem doubles as the message's unique id, so
//! ids stay stable across sessions; committing a deletion removes the
//! file. Credentials are argon2id hashes from the configuration's users
//! table.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use super::{Adapter, AdapterError, AdapterResult, Mailbox, MessageEntry};
use crate::config::verify_password;
use crate::proto::codec;

pub struct DirectoryAdapter {
    root: PathBuf,
    /// username -> argon2id password hash
    users: HashMap<String, String>,
}

impl DirectoryAdapter {
    pub fn new(root: PathBuf, users: HashMap<String, String>) -> Self {
        Self { root, users }
    }
}

fn backend_error(err: &io::Error) -> AdapterError {
    AdapterError::Transient(format!("filesystem: {err}"))
}

impl Adapter for DirectoryAdapter {
    fn authenticate(&self, username: &str, password: &str) -> AdapterResult<Option<String>> {
        match self.users.get(username) {
            Some(hash) if verify_password(password, hash) => Ok(Some(username.to_string())),
            Some(_) => Ok(None),
            None => {
                // Burn a verification on unknown users too, so response
                // timing does not reveal which names exist.
                verify_password(password, crate::config::DUMMY_PASSWORD_HASH);
                Ok(None)
            }
        }
    }

    // Only hashes are stored, so there is no shared secret to offer and
    // APOP stays unadvertised.

    fn open_mailbox(&self, identity: &str, _read_only: bool) -> AdapterResult<Box<dyn Mailbox>> {
        let dir = self.root.join(identity);
        let mut files: Vec<(String, PathBuf, u64)> = Vec::new();

        match fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| backend_error(&e))?;
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("eml") {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    // Sizes count the CRLF-canonical octets retrieval
                    // will actually send, not the on-disk length: files
                    // stored with bare-LF endings grow one octet per
                    // line on the wire (RFC 1939 section 11).
                    let raw = fs::read(&path).map_err(|e| backend_error(&e))?;
                    let size = codec::canonicalize(&raw).len() as u64;
                    files.push((stem.to_string(), path, size));
                }
            }
            // A user without a mail directory simply has an empty maildrop.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(backend_error(&e)),
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Box::new(DirectoryMailbox { files }))
    }
}

struct DirectoryMailbox {
    files: Vec<(String, PathBuf, u64)>,
}

impl DirectoryMailbox {
    fn file(&self, index: usize) -> AdapterResult<&(String, PathBuf, u64)> {
        self.files
            .get(index)
            .ok_or_else(|| AdapterError::Permanent(format!("message index {index} out of range")))
    }
}

impl Mailbox for DirectoryMailbox {
    fn list_messages(&self) -> AdapterResult<Vec<MessageEntry>> {
        Ok(self
            .files
            .iter()
            .map(|(uid, _, size)| MessageEntry {
                uid: uid.clone(),
                size: *size,
            })
            .collect())
    }

    fn fetch_message(&self, index: usize) -> AdapterResult<Vec<u8>> {
        let (_, path, _) = self.file(index)?;
        let raw = fs::read(path).map_err(|e| backend_error(&e))?;
        Ok(codec::canonicalize(&raw))
    }

    fn commit_deletions(&mut self, indices: &[usize]) -> AdapterResult<()> {
        let mut failed = Vec::new();
        for &index in indices {
            let (uid, path, _) = self.file(index)?;
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    failed.push(format!("{uid}: {e}"));
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(AdapterError::Permanent(format!(
                "could not delete: {}",
                failed.join(", ")
            )))
        }
    }
}
