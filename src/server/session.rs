//! The per-connection POP3 state machine.
//!
//! A session moves GREETING -> AUTHORIZATION -> TRANSACTION -> UPDATE.
//! Handlers never touch the socket: each command line produces a
//! [`Reply`] and the connection driver does the writing, so the whole
//! machine is exercisable without any I/O.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest, Md5};
use tracing::{debug, error};

use super::locks::{LockGuard, LockMode};
use super::Engine;
use crate::adapter::{AdapterError, Mailbox, MessageEntry};
use crate::proto::command::{parse_command, Command, ParseError};
use crate::proto::response::{Reply, ResponseCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Authorization,
    Transaction,
}

/// The ordered message view a session operates on, fixed at login.
/// Numbering is dense, starts at 1, and never changes mid-session;
/// deleted entries keep their numbers but drop out of listings, totals,
/// and retrieval.
pub(crate) struct MessageView {
    entries: Vec<ViewEntry>,
}

struct ViewEntry {
    uid: String,
    size: u64,
    deleted: bool,
}

impl MessageView {
    fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Validates what the adapter listed: unique ids of 1..=70 printable
    /// non-whitespace ASCII characters (RFC 1939 section 7).
    fn new(listed: Vec<MessageEntry>) -> Result<Self, String> {
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        for entry in &listed {
            if entry.uid.is_empty() || entry.uid.len() > 70 {
                return Err(format!("unique id {:?} has invalid length", entry.uid));
            }
            if !entry.uid.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
                return Err(format!("unique id {:?} contains invalid characters", entry.uid));
            }
            if !seen.insert(entry.uid.clone()) {
                return Err(format!("duplicate unique id {:?}", entry.uid));
            }
        }
        Ok(Self {
            entries: listed
                .into_iter()
                .map(|e| ViewEntry {
                    uid: e.uid,
                    size: e.size,
                    deleted: false,
                })
                .collect(),
        })
    }

    /// Count and total octets over non-deleted messages.
    fn stat(&self) -> (usize, u64) {
        self.entries
            .iter()
            .filter(|e| !e.deleted)
            .fold((0, 0), |(n, total), e| (n + 1, total + e.size))
    }

    /// Resolves a 1-based message number to an index, refusing deleted
    /// and out-of-range numbers.
    fn checked(&self, msgnum: u32) -> Option<(usize, &ViewEntry)> {
        let index = (msgnum as usize).checked_sub(1)?;
        let entry = self.entries.get(index)?;
        if entry.deleted {
            None
        } else {
            Some((index, entry))
        }
    }

    /// Non-deleted entries with their message numbers.
    fn iter_live(&self) -> impl Iterator<Item = (u32, &ViewEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .map(|(i, e)| (i as u32 + 1, e))
    }

    fn mark_deleted(&mut self, index: usize) {
        self.entries[index].deleted = true;
    }

    fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.deleted = false;
        }
    }

    fn deleted_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.deleted)
            .map(|(i, _)| i)
            .collect()
    }
}

/// SASL exchange awaiting the client's continuation line.
enum SaslInProgress {
    Plain,
}

pub(crate) struct Session {
    engine: Arc<Engine>,
    session_id: u64,
    remote_ip: IpAddr,
    state: State,
    tls_active: bool,
    stls_available: bool,
    utf8: bool,
    read_only_requested: bool,
    read_only: bool,
    pending_user: Option<String>,
    user: Option<String>,
    apop_banner: Option<String>,
    sasl: Option<SaslInProgress>,
    mailbox: Option<Box<dyn Mailbox>>,
    view: MessageView,
    committed: bool,
    lock: Option<LockGuard>,
    invalid_commands: u32,
    failed_auths: u32,
}

impl Session {
    pub fn new(
        engine: Arc<Engine>,
        session_id: u64,
        remote_ip: IpAddr,
        tls_active: bool,
        stls_available: bool,
    ) -> Self {
        let apop_banner = if engine.adapter.offers_apop() {
            Some(apop_banner(session_id, &engine.config.hostname))
        } else {
            None
        };
        Self {
            engine,
            session_id,
            remote_ip,
            state: State::Authorization,
            tls_active,
            stls_available,
            utf8: false,
            read_only_requested: false,
            read_only: false,
            pending_user: None,
            user: None,
            apop_banner,
            sasl: None,
            mailbox: None,
            view: MessageView::empty(),
            committed: false,
            lock: None,
            invalid_commands: 0,
            failed_auths: 0,
        }
    }

    /// The banner line, with the APOP timestamp token when the adapter
    /// can support APOP.
    pub fn greeting(&self) -> String {
        match &self.apop_banner {
            Some(token) => format!("+OK POP3SF ready {token}\r\n"),
            None => "+OK POP3SF ready\r\n".to_string(),
        }
    }

    /// Called by the driver once an STLS handshake has completed. Any
    /// knowledge gained over cleartext is discarded (RFC 2595).
    pub fn tls_established(&mut self) {
        self.tls_active = true;
        self.stls_available = false;
        self.pending_user = None;
    }

    /// Handles one command line (terminator already stripped).
    pub async fn handle_line(&mut self, raw: &[u8]) -> Reply {
        if self.sasl.is_some() {
            return self.sasl_continuation(raw).await;
        }

        let Ok(line) = std::str::from_utf8(raw) else {
            return self.invalid(Reply::err("syntax: invalid UTF-8"));
        };

        let command = match parse_command(line, self.utf8) {
            Ok(command) => command,
            Err(ParseError::NonAscii) => {
                return self.invalid(Reply::err_code(
                    ResponseCode::Utf8,
                    ParseError::NonAscii.message(),
                ));
            }
            Err(e) => return self.invalid(Reply::err(e.message())),
        };

        debug!(verb = command.verb(), "command");

        match self.state {
            State::Authorization => self.dispatch_authorization(command).await,
            State::Transaction => self.dispatch_transaction(command).await,
        }
    }

    async fn dispatch_authorization(&mut self, command: Command) -> Reply {
        match command {
            Command::Capa => self.cmd_capa(),
            Command::Stls => self.cmd_stls(),
            Command::Utf8 => {
                self.utf8 = true;
                Reply::ok("UTF8 enabled for this session")
            }
            Command::Lang(tag) => cmd_lang(tag),
            Command::Xpro => self.cmd_xpro(),
            Command::User(name) => self.cmd_user(name),
            Command::Pass(password) => self.cmd_pass(password).await,
            Command::Apop { user, digest } => self.cmd_apop(user, digest).await,
            Command::Auth { mechanism, initial } => self.cmd_auth(mechanism, initial).await,
            Command::Quit => Reply::ok("POP3SF signing off (no user was logged in)").with_close(),
            _ => self.invalid(Reply::err("command not valid in this state")),
        }
    }

    async fn dispatch_transaction(&mut self, command: Command) -> Reply {
        match command {
            Command::Capa => self.cmd_capa(),
            Command::Lang(tag) => cmd_lang(tag),
            Command::Stat => {
                let (count, octets) = self.view.stat();
                Reply::ok(format!("{count} {octets}"))
            }
            Command::List(msgnum) => self.cmd_list(msgnum),
            Command::Uidl(msgnum) => self.cmd_uidl(msgnum),
            Command::Retr(msgnum) => self.cmd_retr(msgnum),
            Command::Top { msg, lines } => self.cmd_top(msg, lines),
            Command::Dele(msgnum) => self.cmd_dele(msgnum),
            Command::Noop => Reply::ok("nothing happened"),
            Command::Rset => self.cmd_rset(),
            Command::Quit => self.cmd_quit_update(),
            _ => self.invalid(Reply::err("command not valid in this state")),
        }
    }

    /// Tracks invalid and wrong-state commands; past the configured cap
    /// the session is disconnected.
    fn invalid(&mut self, reply: Reply) -> Reply {
        self.invalid_commands += 1;
        if let Some(max) = self.engine.config.max_invalid_commands {
            if self.invalid_commands > max {
                return Reply::err("too many invalid commands").with_close();
            }
        }
        reply
    }

    fn plaintext_auth_allowed(&self) -> bool {
        self.tls_active || self.engine.config.allow_plaintext_auth_without_tls
    }

    fn read_only_available(&self) -> bool {
        self.engine.config.allow_read_only_mode && self.engine.adapter.read_only_supported()
    }

    fn cmd_capa(&self) -> Reply {
        let mut caps: Vec<String> = [
            "TOP",
            "UIDL",
            "RESP-CODES",
            "AUTH-RESP-CODE",
            "PIPELINING",
            "LANG",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        caps.push(
            if self.state == State::Authorization {
                "UTF8 USER"
            } else {
                "UTF8"
            }
            .to_string(),
        );

        if self.plaintext_auth_allowed() {
            caps.push("USER".to_string());
            caps.push("SASL PLAIN".to_string());
        }
        if self.apop_banner.is_some() {
            caps.push("APOP".to_string());
        }
        if self.state == State::Authorization && self.stls_available && !self.tls_active {
            caps.push("STLS".to_string());
        }
        if self.read_only_available() {
            caps.push("X-POP3SF-READ-ONLY".to_string());
        }
        caps.push("IMPLEMENTATION POP3SF".to_string());

        Reply::ok_multiline("capability list follows", caps.join("\r\n").into_bytes())
    }

    fn cmd_stls(&mut self) -> Reply {
        if self.tls_active {
            return self.invalid(Reply::err("TLS is already active"));
        }
        if !self.stls_available {
            return self.invalid(Reply::err("STLS is not available on this listener"));
        }
        Reply::ok("begin TLS negotiation").with_start_tls()
    }

    fn cmd_xpro(&mut self) -> Reply {
        if !self.read_only_available() {
            return Reply::err_code(
                ResponseCode::ReadOnly,
                "read-only mailbox access mode is not allowed",
            );
        }
        self.read_only_requested = true;
        Reply::ok("mailbox access mode switched to read-only")
    }

    fn cmd_user(&mut self, name: String) -> Reply {
        if !self.plaintext_auth_allowed() {
            return Reply::err_code(ResponseCode::SysPerm, "plaintext authentication requires TLS");
        }
        self.pending_user = Some(name);
        Reply::ok("username accepted, send PASS")
    }

    async fn cmd_pass(&mut self, password: String) -> Reply {
        if !self.plaintext_auth_allowed() {
            return Reply::err_code(ResponseCode::SysPerm, "plaintext authentication requires TLS");
        }
        let Some(user) = self.pending_user.clone() else {
            return Reply::err_code(ResponseCode::Auth, "no username: send USER first");
        };
        if password.is_empty() {
            return Reply::err_code(ResponseCode::Auth, "empty password");
        }
        self.login(user, &password).await
    }

    async fn cmd_apop(&mut self, user: String, digest: String) -> Reply {
        if self.apop_banner.is_none() {
            return self.invalid(Reply::err("APOP is not offered"));
        }
        self.engine.throttle.acquire(self.remote_ip).await;

        let secret = match self.engine.adapter.apop_secret(&user) {
            Ok(secret) => secret,
            Err(e) => return self.adapter_reply(&e),
        };
        let matches = match secret {
            Some(secret) => {
                let banner = self.apop_banner.as_deref().unwrap_or_default();
                apop_digest(banner, &secret) == digest.to_ascii_lowercase()
            }
            None => false,
        };
        if matches {
            self.finish_login(user)
        } else {
            self.auth_failed()
        }
    }

    async fn cmd_auth(&mut self, mechanism: String, initial: Option<String>) -> Reply {
        if !self.plaintext_auth_allowed() {
            return Reply::err_code(ResponseCode::SysPerm, "plaintext authentication requires TLS");
        }
        if mechanism != "PLAIN" {
            return self.invalid(Reply::err("unsupported authentication mechanism"));
        }
        match initial.as_deref() {
            None | Some("=") => {
                self.sasl = Some(SaslInProgress::Plain);
                Reply::sasl_continue("")
            }
            Some(response) => self.sasl_plain(response.to_string()).await,
        }
    }

    async fn sasl_continuation(&mut self, raw: &[u8]) -> Reply {
        let Some(SaslInProgress::Plain) = self.sasl.take() else {
            return Reply::internal_error();
        };
        let Ok(line) = std::str::from_utf8(raw) else {
            return Reply::err_code(ResponseCode::Auth, "invalid AUTH response");
        };
        let line = line.trim();
        if line == "*" {
            return Reply::err_code(ResponseCode::Auth, "authentication aborted");
        }
        self.sasl_plain(line.to_string()).await
    }

    /// Decodes `[authzid] NUL authcid NUL password` and logs in.
    async fn sasl_plain(&mut self, response: String) -> Reply {
        let Ok(decoded) = BASE64.decode(response.as_bytes()) else {
            return Reply::err_code(ResponseCode::Auth, "invalid AUTH response");
        };
        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        let (user, password) = match parts.as_slice() {
            [_authzid, authcid, password] => (authcid, password),
            [authcid, password] => (authcid, password),
            _ => return Reply::err_code(ResponseCode::Auth, "invalid AUTH response"),
        };
        let (Ok(user), Ok(password)) = (
            std::str::from_utf8(user).map(str::to_string),
            std::str::from_utf8(password).map(str::to_string),
        ) else {
            return Reply::err_code(ResponseCode::Auth, "invalid AUTH response");
        };
        if !self.utf8 && !(user.is_ascii() && password.is_ascii()) {
            return Reply::err_code(ResponseCode::Utf8, "credentials require UTF8 mode");
        }
        self.login(user, &password).await
    }

    /// The throttled credential check shared by PASS and AUTH.
    async fn login(&mut self, user: String, password: &str) -> Reply {
        self.engine.throttle.acquire(self.remote_ip).await;
        match self.engine.adapter.authenticate(&user, password) {
            Ok(Some(identity)) => self.finish_login(identity),
            Ok(None) => self.auth_failed(),
            Err(e) => self.adapter_reply(&e),
        }
    }

    fn auth_failed(&mut self) -> Reply {
        self.engine.throttle.record_failure(self.remote_ip);
        self.failed_auths += 1;
        if let Some(max) = self.engine.config.max_failed_auth_per_session {
            if self.failed_auths > max {
                return Reply::err_code(ResponseCode::Auth, "too many failed authentication attempts")
                    .with_close();
            }
        }
        Reply::err_code(ResponseCode::Auth, "authentication failed")
    }

    /// Credentials were good: take the mailbox lock, open the snapshot,
    /// and enter TRANSACTION. A lock conflict does not advance the
    /// throttle.
    fn finish_login(&mut self, identity: String) -> Reply {
        self.engine.throttle.record_success(self.remote_ip);

        let read_only = self.read_only_requested;
        let mode = if read_only {
            LockMode::ReadOnly
        } else {
            LockMode::Exclusive
        };
        let Ok(guard) = self.engine.locks.acquire(&identity, mode, self.session_id) else {
            return Reply::err_code(ResponseCode::InUse, "mailbox is locked by another session");
        };

        let mut mailbox = match self.engine.adapter.open_mailbox(&identity, read_only) {
            Ok(mailbox) => mailbox,
            Err(e) => {
                drop(guard);
                return self.adapter_reply(&e);
            }
        };
        let listed = match mailbox.list_messages() {
            Ok(listed) => listed,
            Err(e) => {
                mailbox.abandon();
                drop(guard);
                return self.adapter_reply(&e);
            }
        };
        let view = match MessageView::new(listed) {
            Ok(view) => view,
            Err(reason) => {
                error!(user = %identity, %reason, "adapter produced an invalid listing");
                mailbox.abandon();
                drop(guard);
                return Reply::err_code(ResponseCode::SysPerm, "backend error");
            }
        };

        let (count, octets) = view.stat();
        self.lock = Some(guard);
        self.mailbox = Some(mailbox);
        self.view = view;
        self.read_only = read_only;
        self.user = Some(identity.clone());
        self.pending_user = None;
        self.state = State::Transaction;
        debug!(user = %identity, read_only, "logged in");

        let suffix = if read_only { " (read-only)" } else { "" };
        Reply::ok(format!("{count} messages ({octets} octets){suffix}"))
    }

    fn cmd_list(&mut self, msgnum: Option<u32>) -> Reply {
        match msgnum {
            Some(n) => match self.view.checked(n) {
                Some((_, entry)) => Reply::ok(format!("{n} {}", entry.size)),
                None => Reply::no_such_message(),
            },
            None => {
                let listing = self
                    .view
                    .iter_live()
                    .map(|(n, e)| format!("{n} {}", e.size))
                    .collect::<Vec<_>>()
                    .join("\r\n");
                Reply::ok_multiline("scan listing follows", listing.into_bytes())
            }
        }
    }

    fn cmd_uidl(&mut self, msgnum: Option<u32>) -> Reply {
        match msgnum {
            Some(n) => match self.view.checked(n) {
                Some((_, entry)) => Reply::ok(format!("{n} {}", entry.uid)),
                None => Reply::no_such_message(),
            },
            None => {
                let listing = self
                    .view
                    .iter_live()
                    .map(|(n, e)| format!("{n} {}", e.uid))
                    .collect::<Vec<_>>()
                    .join("\r\n");
                Reply::ok_multiline("unique-id listing follows", listing.into_bytes())
            }
        }
    }

    fn cmd_retr(&mut self, msgnum: u32) -> Reply {
        let Some((index, entry)) = self.view.checked(msgnum) else {
            return Reply::no_such_message();
        };
        let octets = entry.size;
        let Some(mailbox) = self.mailbox.as_ref() else {
            return Reply::internal_error().with_close();
        };
        let body = match mailbox.fetch_message(index) {
            Ok(body) => body,
            Err(e) => return self.adapter_reply(&e),
        };
        if !self.utf8 && !body.is_ascii() {
            return Reply::err_code(ResponseCode::Utf8, "message requires UTF8 mode");
        }
        Reply::ok_multiline(format!("{octets} octets"), body)
    }

    fn cmd_top(&mut self, msgnum: u32, lines: u32) -> Reply {
        let Some((index, _)) = self.view.checked(msgnum) else {
            return Reply::no_such_message();
        };
        let Some(mailbox) = self.mailbox.as_ref() else {
            return Reply::internal_error().with_close();
        };
        let top = match mailbox.fetch_top(index, lines as usize) {
            Ok(top) => top,
            Err(e) => return self.adapter_reply(&e),
        };
        if !self.utf8 && !top.is_ascii() {
            return Reply::err_code(ResponseCode::Utf8, "message requires UTF8 mode");
        }
        let reply = Reply::ok_multiline("top of message follows", top);
        if lines == 0 {
            reply.with_forced_final_crlf()
        } else {
            reply
        }
    }

    fn cmd_dele(&mut self, msgnum: u32) -> Reply {
        if self.read_only {
            return Reply::read_only_refused();
        }
        let Some((index, _)) = self.view.checked(msgnum) else {
            return Reply::no_such_message();
        };
        self.view.mark_deleted(index);
        Reply::ok(format!("message {msgnum} marked as deleted"))
    }

    fn cmd_rset(&mut self) -> Reply {
        if self.read_only {
            // The extension refuses RSET outright, even though it would
            // be a no-op in a session that cannot DELE.
            return Reply::read_only_refused();
        }
        self.view.reset();
        let (count, _) = self.view.stat();
        Reply::ok(format!("maildrop has {count} messages"))
    }

    /// QUIT from TRANSACTION: the UPDATE state. The connection closes
    /// whatever the commit outcome; on failure the client must treat the
    /// session as if it never happened.
    fn cmd_quit_update(&mut self) -> Reply {
        if self.read_only {
            self.committed = false;
            return Reply::ok("POP3SF signing off (read-only)").with_close();
        }
        let indices = self.view.deleted_indices();
        let Some(mailbox) = self.mailbox.as_mut() else {
            return Reply::internal_error().with_close();
        };
        match mailbox.commit_deletions(&indices) {
            Ok(()) => {
                self.committed = true;
                Reply::ok("POP3SF signing off").with_close()
            }
            Err(e) => {
                error!(error = %e, "deletion commit failed");
                adapter_error_reply(&e).with_close()
            }
        }
    }

    fn adapter_reply(&self, err: &AdapterError) -> Reply {
        error!(error = %err, "adapter operation failed");
        adapter_error_reply(err)
    }

    /// Resource teardown, on every termination path. The mailbox handle
    /// is released before the lock record.
    pub fn teardown(&mut self) {
        if let Some(mut mailbox) = self.mailbox.take() {
            if !self.committed {
                mailbox.abandon();
            }
            if let Some(user) = &self.user {
                debug!(user = %user, committed = self.committed, "mailbox released");
            }
        }
        self.lock.take();
    }
}

fn adapter_error_reply(err: &AdapterError) -> Reply {
    match err {
        AdapterError::Transient(_) => Reply::err_code(ResponseCode::SysTemp, "backend unavailable"),
        AdapterError::Permanent(_) => Reply::err_code(ResponseCode::SysPerm, "backend error"),
    }
}

fn cmd_lang(tag: Option<String>) -> Reply {
    match tag.as_deref() {
        None => Reply::ok_multiline("language listing follows", b"en English".to_vec()),
        Some("en") | Some("*") => Reply::ok("responses will be in English"),
        Some(_) => Reply::err("invalid language tag"),
    }
}

fn apop_banner(session_id: u64, hostname: &str) -> String {
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("<{}.{session_id}.{clock}@{hostname}>", std::process::id())
}

/// APOP digest: lowercase hex MD5 of the greeting token followed by the
/// shared secret (RFC 1939 section 7).
pub(crate) fn apop_digest(banner: &str, secret: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(banner.as_bytes());
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
