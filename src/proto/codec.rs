//! Line framing and multi-line payload encoding for POP3.
//!
//! Command lines are CRLF-terminated and capped at 255 octets including
//! the terminator (RFC 2449). Multi-line payloads are byte-stuffed: any
//! payload line starting with `.` gets an extra `.` prepended, and the
//! whole payload is terminated by a lone `.` line.

use std::io;

use tokio::io::AsyncBufReadExt;

/// Maximum length of a command line in octets, CRLF included.
pub const MAX_COMMAND_LINE: usize = 255;

/// Terminator of a multi-line response.
pub const MULTILINE_TERMINATOR: &[u8] = b".\r\n";

/// Outcome of reading one command line off the wire.
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// A complete line, terminator stripped.
    Line(Vec<u8>),
    /// The peer closed the connection.
    Eof,
    /// No terminator within the allowed line length.
    TooLong,
}

/// Reads a single command line, enforcing the length cap.
///
/// Accepts a bare LF terminator as well as CRLF (lenient receive, strict
/// send). The cap counts every octet up to and including the terminator,
/// so a line of 253 octets plus CRLF is the longest acceptable command.
pub async fn read_command_line<R>(reader: &mut R) -> io::Result<LineOutcome>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line: Vec<u8> = Vec::with_capacity(64);

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(LineOutcome::Eof);
        }

        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            if line.len() + pos + 1 > MAX_COMMAND_LINE {
                return Ok(LineOutcome::TooLong);
            }
            line.extend_from_slice(&buf[..pos]);
            reader.consume(pos + 1);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(LineOutcome::Line(line));
        }

        let chunk = buf.len();
        if line.len() + chunk >= MAX_COMMAND_LINE {
            // Even an immediate LF would push the line past the cap.
            return Ok(LineOutcome::TooLong);
        }
        line.extend_from_slice(buf);
        reader.consume(chunk);
    }
}

/// Splits message text into lines on CRLF, lone CR, or lone LF, keeping
/// empty lines. The split never discards content, so rejoining with CRLF
/// canonicalizes the line endings (RFC 1939 section 11).
pub fn split_message_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\r' => {
                lines.push(&data[start..i]);
                i += if data.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
                start = i;
            }
            b'\n' => {
                lines.push(&data[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    lines.push(&data[start..]);
    lines
}

/// Rejoins message text with CRLF line endings, without otherwise
/// altering it.
pub fn canonicalize(body: &[u8]) -> Vec<u8> {
    let lines = split_message_lines(body);
    let mut out = Vec::with_capacity(body.len() + 8);
    for (i, line) in lines.iter().enumerate() {
        out.extend_from_slice(line);
        if i + 1 < lines.len() {
            out.extend_from_slice(b"\r\n");
        }
    }
    out
}

/// Canonicalizes and byte-stuffs a multi-line payload.
///
/// The output always ends with CRLF so the terminator can follow on its
/// own line. `force_final_crlf` appends one more CRLF even when the
/// payload already ends with a line break; TOP with zero body lines needs
/// this so the blank header/body separator survives.
pub fn stuff(body: &[u8], force_final_crlf: bool) -> Vec<u8> {
    if body.is_empty() {
        // An empty payload contributes no lines at all; the terminator
        // follows the status line directly.
        return if force_final_crlf {
            b"\r\n".to_vec()
        } else {
            Vec::new()
        };
    }
    let lines = split_message_lines(body);
    let mut out = Vec::with_capacity(body.len() + 16);

    for (i, line) in lines.iter().enumerate() {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        if i + 1 < lines.len() {
            out.extend_from_slice(b"\r\n");
        }
    }

    if force_final_crlf || !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Reverses [`stuff`]: strips one leading `.` from every dot-stuffed line.
pub fn unstuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let lines = split_message_lines(data);
    for (i, line) in lines.iter().enumerate() {
        let line = if line.first() == Some(&b'.') {
            &line[1..]
        } else {
            line
        };
        out.extend_from_slice(line);
        if i + 1 < lines.len() {
            out.extend_from_slice(b"\r\n");
        }
    }
    out
}

/// Extracts the headers, the blank separator line, and the first `n` body
/// lines of a message, joined with CRLF (the TOP command's payload).
pub fn message_top(body: &[u8], n: usize) -> Vec<u8> {
    let lines = split_message_lines(body);
    let mut wanted: Vec<&[u8]> = Vec::new();
    let mut it = lines.into_iter();

    // Headers run until the first blank line.
    for line in it.by_ref() {
        if line.is_empty() {
            wanted.push(line);
            break;
        }
        wanted.push(line);
    }

    wanted.extend(it.take(n));

    let mut out = Vec::new();
    for (i, line) in wanted.iter().enumerate() {
        out.extend_from_slice(line);
        if i + 1 < wanted.len() {
            out.extend_from_slice(b"\r\n");
        }
    }
    out
}
