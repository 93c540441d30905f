//! Drives one accepted connection: all socket I/O for a session.
//!
//! The session state machine computes replies; this module reads lines,
//! writes replies, enforces the idle timer, performs STLS handshakes,
//! and honors the draining flag at every command boundary.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use super::session::Session;
use super::Engine;
use crate::config::TlsMode;
use crate::proto::codec::{self, read_command_line, LineOutcome, MULTILINE_TERMINATOR};
use crate::proto::response::Reply;
use crate::tls::SessionStream;

const SHUTDOWN_NOTICE: &[u8] = b"-ERR [SYS/TEMP] server shutting down\r\n";

pub(crate) async fn serve(
    engine: Arc<Engine>,
    stream: TcpStream,
    peer: SocketAddr,
    tls_mode: TlsMode,
    mut draining: watch::Receiver<bool>,
    session_id: u64,
) {
    debug!(%peer, session_id, "client connected");

    let stream = match tls_mode {
        TlsMode::Implicit => {
            let Some(acceptor) = engine.acceptor.clone() else {
                return;
            };
            match acceptor.accept(stream).await {
                Ok(tls) => SessionStream::Tls(Box::new(tls)),
                Err(e) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            }
        }
        _ => SessionStream::Plain(stream),
    };

    let stls_available = tls_mode == TlsMode::Stls && engine.acceptor.is_some();
    let mut session = Session::new(
        engine.clone(),
        session_id,
        peer.ip(),
        stream.is_tls(),
        stls_available,
    );
    let idle = Duration::from_secs(engine.config.idle_timeout_seconds);
    let mut reader = BufReader::new(stream);

    if let Err(e) = write_flush(&mut reader, session.greeting().as_bytes()).await {
        debug!(%peer, error = %e, "failed to send greeting");
        session.teardown();
        return;
    }

    loop {
        if *draining.borrow() {
            let _ = write_flush(&mut reader, SHUTDOWN_NOTICE).await;
            break;
        }

        let read = tokio::select! {
            _ = draining.changed() => {
                let _ = write_flush(&mut reader, SHUTDOWN_NOTICE).await;
                break;
            }
            read = tokio::time::timeout(idle, read_command_line(&mut reader)) => read,
        };

        // Idle timeout and dead connections close without a reply.
        let line = match read {
            Err(_elapsed) => {
                debug!(%peer, "idle timeout");
                break;
            }
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "read error");
                break;
            }
            Ok(Ok(LineOutcome::Eof)) => break,
            Ok(Ok(LineOutcome::TooLong)) => {
                let _ = write_flush(&mut reader, b"-ERR line too long\r\n").await;
                break;
            }
            Ok(Ok(LineOutcome::Line(line))) => line,
        };

        let reply = session.handle_line(&line).await;
        if let Err(e) = write_reply(&mut reader, &reply).await {
            debug!(%peer, error = %e, "write error");
            break;
        }

        if reply.start_tls {
            // Dropping the buffered reader throws away any bytes the
            // client pipelined ahead of the handshake (RFC 2595).
            let Some(acceptor) = engine.acceptor.clone() else {
                break;
            };
            let tcp = match reader.into_inner() {
                SessionStream::Plain(tcp) => tcp,
                // The session refuses STLS over TLS before we get here.
                SessionStream::Tls(_) => break,
            };
            match acceptor.accept(tcp).await {
                Ok(tls) => {
                    session.tls_established();
                    reader = BufReader::new(SessionStream::Tls(Box::new(tls)));
                    debug!(%peer, "STLS negotiated");
                }
                Err(e) => {
                    debug!(%peer, error = %e, "STLS handshake failed");
                    break;
                }
            }
        }

        if reply.close {
            break;
        }
    }

    session.teardown();
    debug!(%peer, session_id, "client disconnected");
}

async fn write_reply<W>(writer: &mut W, reply: &Reply) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = reply.status_line().into_bytes();
    if let Some(body) = &reply.body {
        out.extend_from_slice(&codec::stuff(&body.payload, body.force_final_crlf));
        out.extend_from_slice(MULTILINE_TERMINATOR);
    }
    write_flush(writer, &out).await
}

async fn write_flush<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await
}
