//! Response rendering: `+OK`/`-ERR` status lines with RFC 2449 extended
//! response codes, and the `Reply` value the session hands back to the
//! connection driver.

use std::fmt;

/// Extended response codes (RFC 2449, RFC 3206, RFC 6856, plus the
/// read-only extension's own code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Auth,
    InUse,
    LoginDelay,
    SysPerm,
    SysTemp,
    Utf8,
    ReadOnly,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::Auth => "AUTH",
            Self::InUse => "IN-USE",
            Self::LoginDelay => "LOGIN-DELAY",
            Self::SysPerm => "SYS/PERM",
            Self::SysTemp => "SYS/TEMP",
            Self::Utf8 => "UTF8",
            Self::ReadOnly => "X-POP3SF-READ-ONLY",
        };
        f.write_str(token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Err,
    /// SASL continuation request (`+ <challenge>`).
    Continue,
}

/// A multi-line payload plus the flag controlling the trailing CRLF
/// before the terminator (TOP with zero body lines needs it forced).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multiline {
    pub payload: Vec<u8>,
    pub force_final_crlf: bool,
}

/// What the session wants sent to the client, and what should happen to
/// the connection afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    status: Status,
    code: Option<ResponseCode>,
    text: String,
    pub body: Option<Multiline>,
    pub close: bool,
    pub start_tls: bool,
}

impl Reply {
    fn new(status: Status, code: Option<ResponseCode>, text: impl Into<String>) -> Self {
        Self {
            status,
            code,
            text: text.into(),
            body: None,
            close: false,
            start_tls: false,
        }
    }

    pub fn ok(text: impl Into<String>) -> Self {
        Self::new(Status::Ok, None, text)
    }

    pub fn ok_multiline(text: impl Into<String>, payload: Vec<u8>) -> Self {
        let mut reply = Self::ok(text);
        reply.body = Some(Multiline {
            payload,
            force_final_crlf: false,
        });
        reply
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self::new(Status::Err, None, text)
    }

    pub fn err_code(code: ResponseCode, text: impl Into<String>) -> Self {
        Self::new(Status::Err, Some(code), text)
    }

    /// SASL continuation: `+ <base64 challenge>`.
    pub fn sasl_continue(challenge: impl Into<String>) -> Self {
        Self::new(Status::Continue, None, challenge)
    }

    pub fn read_only_refused() -> Self {
        Self::err_code(ResponseCode::ReadOnly, "mailbox access mode is read-only")
    }

    pub fn internal_error() -> Self {
        Self::err_code(ResponseCode::SysTemp, "internal error")
    }

    pub fn no_such_message() -> Self {
        Self::err("no such message")
    }

    pub fn with_close(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn with_start_tls(mut self) -> Self {
        self.start_tls = true;
        self
    }

    pub fn with_forced_final_crlf(mut self) -> Self {
        if let Some(body) = &mut self.body {
            body.force_final_crlf = true;
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status != Status::Err
    }

    /// Renders the status line, CRLF included.
    pub fn status_line(&self) -> String {
        if self.status == Status::Continue {
            // RFC 5034: "+ " then the BASE64 challenge (possibly empty).
            return format!("+ {}\r\n", self.text);
        }
        let mut line = String::with_capacity(self.text.len() + 16);
        match self.status {
            Status::Ok => line.push_str("+OK"),
            Status::Err => line.push_str("-ERR"),
            Status::Continue => unreachable!(),
        }
        if let Some(code) = self.code {
            line.push_str(&format!(" [{}]", code));
        }
        if !self.text.is_empty() {
            line.push(' ');
            line.push_str(&self.text);
        }
        line.push_str("\r\n");
        line
    }
}
