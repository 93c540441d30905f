//! The server: listeners, accept loops, shared registries, and the
//! shutdown coordinator.

mod connection;
pub mod locks;
mod session;
pub mod throttle;

pub use locks::{LockBusy, LockGuard, LockMode, MailboxLocks};
pub use throttle::AuthThrottle;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::adapter::Adapter;
use crate::config::{ServerConfig, TlsMode};
use crate::error::ServerError;
use crate::tls::{self, SessionStream};

/// Session id counter, process-wide.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything the session tasks share: configuration, the adapter, and
/// the cross-connection registries. Built once at bind time.
pub(crate) struct Engine {
    pub(crate) config: ServerConfig,
    pub(crate) adapter: Arc<dyn Adapter>,
    pub(crate) locks: MailboxLocks,
    pub(crate) throttle: AuthThrottle,
    pub(crate) acceptor: Option<TlsAcceptor>,
}

/// Triggers a graceful shutdown from outside the server's run loop.
#[derive(Clone)]
pub struct ServerHandle {
    drain: watch::Sender<bool>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.drain.send(true);
    }
}

type SessionTasks = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// A bound POP3 server, ready to run.
pub struct Pop3Server {
    engine: Arc<Engine>,
    listeners: Vec<(TcpListener, TlsMode)>,
    local_addrs: Vec<SocketAddr>,
    drain: watch::Sender<bool>,
}

impl Pop3Server {
    /// Validates the configuration, loads TLS material, and binds every
    /// configured endpoint. TLS problems fail here, before any client
    /// can connect.
    pub async fn bind(config: ServerConfig, adapter: Arc<dyn Adapter>) -> Result<Self, ServerError> {
        config.validate()?;

        let wants_tls = config.listeners.iter().any(|l| l.tls != TlsMode::None);
        let acceptor = match (&config.tls, wants_tls) {
            (Some(settings), true) => Some(TlsAcceptor::from(Arc::new(tls::load_server_config(
                settings,
            )?))),
            _ => None,
        };

        let mut listeners = Vec::with_capacity(config.listeners.len());
        let mut local_addrs = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            let listener =
                TcpListener::bind((listener_config.address.as_str(), listener_config.port)).await?;
            let addr = listener.local_addr()?;
            info!(%addr, tls = ?listener_config.tls, "listening");
            if listener_config.tls == TlsMode::None {
                warn!(%addr, "listener is not secured with TLS; credentials would cross the network in the clear");
            }
            listeners.push((listener, listener_config.tls));
            local_addrs.push(addr);
        }

        let throttle = AuthThrottle::new(
            &config.auth_delay_curve,
            Duration::from_secs(config.throttle_cooldown_seconds),
        );
        let engine = Arc::new(Engine {
            config,
            adapter,
            locks: MailboxLocks::new(),
            throttle,
            acceptor,
        });
        let (drain, _) = watch::channel(false);

        Ok(Self {
            engine,
            listeners,
            local_addrs,
            drain,
        })
    }

    /// The bound addresses, in listener order. Useful with port 0.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            drain: self.drain.clone(),
        }
    }

    /// Accepts connections until [`ServerHandle::shutdown`] fires, then
    /// drains: no new connections, active sessions get told at their
    /// next command boundary, and the grace deadline forces out
    /// whatever remains.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self {
            engine,
            listeners,
            local_addrs: _,
            drain,
        } = self;

        info!("POP3SF started");

        let sessions: SessionTasks = Arc::new(Mutex::new(Vec::new()));
        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for (listener, tls_mode) in listeners {
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                tls_mode,
                engine.clone(),
                sessions.clone(),
                drain.subscribe(),
            )));
        }

        let mut drain_rx = drain.subscribe();
        while !*drain_rx.borrow() {
            if drain_rx.changed().await.is_err() {
                break;
            }
        }
        info!("shutting down: draining active sessions");

        for task in accept_tasks {
            let _ = task.await;
        }

        let deadline = Instant::now() + Duration::from_secs(engine.config.shutdown_grace_seconds);
        loop {
            {
                let mut tasks = sessions.lock().unwrap_or_else(|e| e.into_inner());
                tasks.retain(|t| !t.is_finished());
                if tasks.is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(
                        remaining = tasks.len(),
                        "shutdown deadline reached, forcing sessions closed"
                    );
                    for task in tasks.iter() {
                        task.abort();
                    }
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls_mode: TlsMode,
    engine: Arc<Engine>,
    sessions: SessionTasks,
    mut drain: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = drain.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
                let mut tasks = sessions.lock().unwrap_or_else(|e| e.into_inner());
                tasks.retain(|t| !t.is_finished());
                if tasks.len() >= engine.config.max_concurrent_sessions {
                    warn!(%peer, "refusing connection: session limit reached");
                    tokio::spawn(refuse_connection(engine.clone(), stream, tls_mode));
                    continue;
                }
                tasks.push(tokio::spawn(connection::serve(
                    engine.clone(),
                    stream,
                    peer,
                    tls_mode,
                    drain.clone(),
                    session_id,
                )));
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}

/// Over-capacity connections are still accepted, greeted with the
/// RFC 3206 temporary-failure code, and closed.
async fn refuse_connection(engine: Arc<Engine>, stream: TcpStream, tls_mode: TlsMode) {
    let mut stream = match tls_mode {
        TlsMode::Implicit => {
            let Some(acceptor) = engine.acceptor.clone() else {
                return;
            };
            match acceptor.accept(stream).await {
                Ok(tls) => SessionStream::Tls(Box::new(tls)),
                Err(_) => return,
            }
        }
        _ => SessionStream::Plain(stream),
    };
    let _ = stream
        .write_all(b"-ERR [SYS/TEMP] too many connections\r\n")
        .await;
    let _ = stream.shutdown().await;
}
