//! POP3SF: a POP3 server framework.
//!
//! Exposes arbitrary back-end message stores as standard POP3 mailboxes
//! (RFC 1939) with the CAPA/response-code extensions (RFC 2449, RFC
//! 3206), UTF8 support (RFC 6856), implicit TLS and STLS listeners, and
//! a non-standard read-only access mode (`XPRO` /
//! `X-POP3SF-READ-ONLY`) that lets several sessions share one maildrop
//! as long as none of them deletes anything.
//!
//! The protocol engine is generic over an [`Adapter`], which supplies
//! authentication and mailbox snapshots; two adapters ship in-tree, an
//! in-memory one and a directory-backed one.

pub mod adapter;
pub mod config;
pub mod error;
pub mod proto;
pub mod server;
pub mod tls;

pub use adapter::{Adapter, AdapterError, Mailbox, MessageEntry};
pub use config::ServerConfig;
pub use error::ServerError;
pub use server::{Pop3Server, ServerHandle};
