//! Server configuration, loaded from a TOML file.
//!
//! Every option is typed and validated up front; the server refuses to
//! start on a contradiction (a TLS listener without TLS material, an
//! idle timeout below the RFC 1939 minimum, and so on).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::adapter::{self, Adapter, DirectoryAdapter, MemoryAdapter};
use crate::error::ServerError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listeners: Vec<ListenerConfig>,

    /// Required when any listener uses TLS (implicit or STLS).
    pub tls: Option<TlsSettings>,

    /// Gates the `XPRO` command and the `X-POP3SF-READ-ONLY` capability.
    #[serde(default = "default_true")]
    pub allow_read_only_mode: bool,

    /// When false, `USER`/`PASS`/`AUTH` are refused on connections that
    /// have not negotiated TLS.
    #[serde(default)]
    pub allow_plaintext_auth_without_tls: bool,

    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Delay applied to the nth consecutive failed authentication from
    /// one address, in seconds; the last entry caps all later failures.
    #[serde(default = "default_delay_curve")]
    pub auth_delay_curve: Vec<u64>,

    /// How long a throttle record outlives its last failure.
    #[serde(default = "default_throttle_cooldown")]
    pub throttle_cooldown_seconds: u64,

    /// How long draining sessions get before they are forced closed.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Disconnect after this many invalid commands in one session.
    #[serde(default)]
    pub max_invalid_commands: Option<u32>,

    /// Disconnect after this many failed credential checks in one
    /// session.
    #[serde(default = "default_max_failed_auth")]
    pub max_failed_auth_per_session: Option<u32>,

    /// Funnel all adapter calls through one mutex, for backends that are
    /// not internally concurrent.
    #[serde(default)]
    pub serialize_adapter_calls: bool,

    /// Used in the APOP greeting token.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    pub adapter: AdapterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tls: TlsMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Cleartext, no upgrade offered.
    #[default]
    None,
    /// TLS handshake immediately on accept.
    Implicit,
    /// Cleartext with the STLS upgrade available.
    Stls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
    /// Minimum protocol version, `"1.2"` or `"1.3"`.
    #[serde(default = "default_min_tls_version")]
    pub min_version: String,
}

/// Which backend serves the mailboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AdapterConfig {
    Memory {
        #[serde(default)]
        users: HashMap<String, MemoryUserConfig>,
    },
    Directory {
        root: PathBuf,
        #[serde(default)]
        users: HashMap<String, DirectoryUserConfig>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUserConfig {
    pub password: String,
    #[serde(default)]
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryUserConfig {
    /// Argon2id hash, as printed by `pop3sf --hash-password`.
    pub password_hash: String,
}

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> usize {
    25
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_delay_curve() -> Vec<u64> {
    vec![0, 1, 2, 4, 8, 16, 30]
}

fn default_throttle_cooldown() -> u64 {
    900
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_max_failed_auth() -> Option<u32> {
    Some(3)
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_min_tls_version() -> String {
    "1.2".to_string()
}

impl ServerConfig {
    /// Loads and validates a configuration file.
    pub async fn load(path: &Path) -> Result<Self, ServerError> {
        let content = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.listeners.is_empty() {
            return Err(ServerError::Config("no listeners configured".into()));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ServerError::Config(
                "max_concurrent_sessions must be at least 1".into(),
            ));
        }
        if self.idle_timeout_seconds < 30 {
            return Err(ServerError::Config(
                "idle_timeout_seconds must be at least 30".into(),
            ));
        }
        let wants_tls = self.listeners.iter().any(|l| l.tls != TlsMode::None);
        if wants_tls && self.tls.is_none() {
            return Err(ServerError::Config(
                "a listener requests TLS but no [tls] section is configured".into(),
            ));
        }
        if let Some(tls) = &self.tls {
            if !matches!(tls.min_version.as_str(), "1.2" | "1.3") {
                return Err(ServerError::Config(format!(
                    "unsupported tls.min_version {:?} (use \"1.2\" or \"1.3\")",
                    tls.min_version
                )));
            }
        }
        Ok(())
    }

    /// Instantiates the configured adapter, applying the serialization
    /// wrapper when requested.
    pub fn build_adapter(&self) -> Arc<dyn Adapter> {
        let inner: Arc<dyn Adapter> = match &self.adapter {
            AdapterConfig::Memory { users } => {
                let memory = MemoryAdapter::new();
                for (name, user) in users {
                    let messages: Vec<&str> = user.messages.iter().map(String::as_str).collect();
                    memory.add_user(name, &user.password, &messages);
                }
                Arc::new(memory)
            }
            AdapterConfig::Directory { root, users } => {
                let users = users
                    .iter()
                    .map(|(name, u)| (name.clone(), u.password_hash.clone()))
                    .collect();
                Arc::new(DirectoryAdapter::new(root.clone(), users))
            }
        };

        if self.serialize_adapter_calls {
            adapter::serialized(inner)
        } else {
            inner
        }
    }

    /// A starter configuration, printed by `pop3sf --sample-config`.
    pub fn sample() -> String {
        let mut users = HashMap::new();
        users.insert(
            "user@example.com".to_string(),
            DirectoryUserConfig {
                password_hash: "$argon2id$v=19$m=19456,t=2,p=1$EXAMPLE$HASH".to_string(),
            },
        );
        let sample = Self {
            listeners: vec![
                ListenerConfig {
                    address: "0.0.0.0".into(),
                    port: 110,
                    tls: TlsMode::Stls,
                },
                ListenerConfig {
                    address: "0.0.0.0".into(),
                    port: 995,
                    tls: TlsMode::Implicit,
                },
            ],
            tls: Some(TlsSettings {
                certificate_path: "certificate.crt".into(),
                key_path: "private_key.key".into(),
                min_version: default_min_tls_version(),
            }),
            allow_read_only_mode: true,
            allow_plaintext_auth_without_tls: false,
            max_concurrent_sessions: default_max_sessions(),
            idle_timeout_seconds: default_idle_timeout(),
            auth_delay_curve: default_delay_curve(),
            throttle_cooldown_seconds: default_throttle_cooldown(),
            shutdown_grace_seconds: default_shutdown_grace(),
            max_invalid_commands: None,
            max_failed_auth_per_session: default_max_failed_auth(),
            serialize_adapter_calls: false,
            hostname: "mail.example.com".into(),
            adapter: AdapterConfig::Directory {
                root: "mailboxes".into(),
                users,
            },
        };
        toml::to_string_pretty(&sample).expect("sample config serializes")
    }
}

/// Verification target for unknown users, so lookup misses cost the same
/// as hash mismatches. A well-formed Argon2id record (default parameters,
/// placeholder salt and digest) that no password can match.
pub const DUMMY_PASSWORD_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHR2YWx1ZQ$QUJDREVGR0hJSktMTU5PUFFSU1RVVldYWVphYmNkZWY";

/// Hashes a password with Argon2id for storage in the configuration.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verifies a password against an Argon2id hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
