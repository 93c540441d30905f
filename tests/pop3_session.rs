//! End-to-end transcripts against a real server on loopback sockets.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pop3sf::adapter::MemoryAdapter;
use pop3sf::config::ServerConfig;
use pop3sf::{Pop3Server, ServerHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const MSG_ONE: &str = "Subject: one\r\n\r\nfirst message\r\n";
const MSG_TWO: &str = "Subject: two\r\n\r\nsecond\r\n";

fn base_config() -> ServerConfig {
    toml::from_str(
        r#"
        allow_plaintext_auth_without_tls = true

        [[listeners]]
        address = "127.0.0.1"
        port = 0

        [adapter]
        kind = "memory"
        "#,
    )
    .unwrap()
}

struct TestServer {
    addrs: Vec<SocketAddr>,
    handle: ServerHandle,
    adapter: MemoryAdapter,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(mutate: impl FnOnce(&mut ServerConfig)) -> Self {
        let adapter = MemoryAdapter::new();
        adapter.add_user("alice", "pw", &[MSG_ONE, MSG_TWO]);

        let mut config = base_config();
        mutate(&mut config);

        let server = Pop3Server::bind(config, Arc::new(adapter.clone()))
            .await
            .unwrap();
        let addrs = server.local_addrs().to_vec();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            server.run().await.unwrap();
        });

        Self {
            addrs,
            handle,
            adapter,
            task,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.addrs[0]
    }

    async fn stop(self) {
        self.handle.shutdown();
        tokio::time::timeout(Duration::from_secs(30), self.task)
            .await
            .expect("server did not stop in time")
            .unwrap();
    }
}

struct TestClient<S> {
    reader: BufReader<S>,
}

impl TestClient<TcpStream> {
    /// Connects and consumes the greeting.
    async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = TestClient {
            reader: BufReader::new(stream),
        };
        let greeting = client.read_line().await;
        (client, greeting)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> TestClient<S> {
    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }

    async fn send_raw(&mut self, data: &[u8]) {
        self.reader.get_mut().write_all(data).await.unwrap();
        self.reader.get_mut().flush().await.unwrap();
    }

    /// Sends one command and returns the status line.
    async fn cmd(&mut self, line: &str) -> String {
        self.send_raw(format!("{line}\r\n").as_bytes()).await;
        self.read_line().await
    }

    /// Reads a dot-stuffed multi-line payload (after an `+OK` status
    /// line), returning the unstuffed lines.
    async fn read_multiline(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let line = line.trim_end_matches("\r\n");
            if line == "." {
                return lines;
            }
            let line = line.strip_prefix('.').map(str::to_string).unwrap_or_else(|| line.to_string());
            lines.push(line);
        }
    }
}

#[tokio::test]
async fn happy_path_retrieve_delete_commit() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, greeting) = TestClient::connect(server.addr()).await;
    assert!(greeting.starts_with("+OK POP3SF ready"), "{greeting}");

    assert!(client.cmd("USER alice").await.starts_with("+OK"));
    assert!(client.cmd("PASS pw").await.starts_with("+OK"));

    let stat = client.cmd("STAT").await;
    let expected_total = MSG_ONE.len() + MSG_TWO.len();
    assert_eq!(stat, format!("+OK 2 {expected_total}\r\n"));

    assert!(client.cmd("RETR 1").await.starts_with("+OK"));
    let body = client.read_multiline().await.join("\r\n") + "\r\n";
    assert_eq!(body, MSG_ONE);

    assert!(client.cmd("DELE 1").await.starts_with("+OK"));
    assert!(client.cmd("QUIT").await.starts_with("+OK"));

    // Give the session task a moment to tear down, then check the
    // adapter saw exactly one committed deletion.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let log = server.adapter.commit_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, "alice");
    assert_eq!(log[0].1.len(), 1);
    assert_eq!(server.adapter.message_count("alice"), 1);

    server.stop().await;
}

#[tokio::test]
async fn read_only_session_refuses_deletion() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, _) = TestClient::connect(server.addr()).await;

    assert!(client.cmd("XPRO").await.starts_with("+OK"));
    assert!(client.cmd("USER alice").await.starts_with("+OK"));
    assert!(client.cmd("PASS pw").await.starts_with("+OK"));

    let dele = client.cmd("DELE 1").await;
    assert!(dele.starts_with("-ERR [X-POP3SF-READ-ONLY]"), "{dele}");
    let rset = client.cmd("RSET").await;
    assert!(rset.starts_with("-ERR [X-POP3SF-READ-ONLY]"), "{rset}");
    assert!(client.cmd("QUIT").await.starts_with("+OK"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.adapter.commit_log().is_empty());
    assert_eq!(server.adapter.message_count("alice"), 2);

    server.stop().await;
}

#[tokio::test]
async fn exclusive_lock_contention_across_connections() {
    let server = TestServer::start(|_| {}).await;

    let (mut a, _) = TestClient::connect(server.addr()).await;
    a.cmd("USER alice").await;
    assert!(a.cmd("PASS pw").await.starts_with("+OK"));

    let (mut b, _) = TestClient::connect(server.addr()).await;
    b.cmd("USER alice").await;
    let reply = b.cmd("PASS pw").await;
    assert!(reply.starts_with("-ERR [IN-USE]"), "{reply}");

    // A hangs up without QUIT; the lock must still come free.
    drop(a);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(b.cmd("PASS pw").await.starts_with("+OK"));

    server.stop().await;
}

#[tokio::test]
async fn concurrent_read_only_sessions() {
    let server = TestServer::start(|_| {}).await;

    let (mut b, _) = TestClient::connect(server.addr()).await;
    b.cmd("XPRO").await;
    b.cmd("USER alice").await;
    assert!(b.cmd("PASS pw").await.starts_with("+OK"));

    let (mut c, _) = TestClient::connect(server.addr()).await;
    c.cmd("XPRO").await;
    c.cmd("USER alice").await;
    assert!(c.cmd("PASS pw").await.starts_with("+OK"));

    for client in [&mut b, &mut c] {
        assert!(client.cmd("RETR 1").await.starts_with("+OK"));
        let body = client.read_multiline().await.join("\r\n") + "\r\n";
        assert_eq!(body, MSG_ONE);
    }

    server.stop().await;
}

#[tokio::test]
async fn stls_upgrade_full_transcript() {
    let (cert_path, key_path, root_store) = self_signed_material("stls");
    let server = TestServer::start(|config| {
        config.listeners[0].tls = pop3sf::config::TlsMode::Stls;
        config.tls = Some(pop3sf::config::TlsSettings {
            certificate_path: cert_path.clone(),
            key_path: key_path.clone(),
            min_version: "1.2".into(),
        });
    })
    .await;

    let (mut client, _) = TestClient::connect(server.addr()).await;

    assert!(client.cmd("CAPA").await.starts_with("+OK"));
    let caps = client.read_multiline().await;
    assert!(caps.iter().any(|c| c == "STLS"), "{caps:?}");

    assert!(client.cmd("STLS").await.starts_with("+OK"));

    // Handshake on the raw stream; the server discarded its buffers.
    let tcp = client.reader.into_inner();
    let connector = tls_connector(root_store);
    let name = rustls::pki_types::ServerName::try_from("localhost".to_string()).unwrap();
    let tls = connector.connect(name, tcp).await.unwrap();
    let mut client = TestClient {
        reader: BufReader::new(tls),
    };

    assert!(client.cmd("CAPA").await.starts_with("+OK"));
    let caps = client.read_multiline().await;
    assert!(!caps.iter().any(|c| c == "STLS"), "{caps:?}");

    assert!(client.cmd("USER alice").await.starts_with("+OK"));
    assert!(client.cmd("PASS pw").await.starts_with("+OK"));
    assert!(client.cmd("STAT").await.starts_with("+OK 2 "));
    assert!(client.cmd("QUIT").await.starts_with("+OK"));

    server.stop().await;
    cleanup_material(&cert_path, &key_path);
}

#[tokio::test]
async fn implicit_tls_listener() {
    let (cert_path, key_path, root_store) = self_signed_material("implicit");
    let server = TestServer::start(|config| {
        config.listeners[0].tls = pop3sf::config::TlsMode::Implicit;
        config.tls = Some(pop3sf::config::TlsSettings {
            certificate_path: cert_path.clone(),
            key_path: key_path.clone(),
            min_version: "1.3".into(),
        });
    })
    .await;

    let tcp = TcpStream::connect(server.addr()).await.unwrap();
    let connector = tls_connector(root_store);
    let name = rustls::pki_types::ServerName::try_from("localhost".to_string()).unwrap();
    let tls = connector.connect(name, tcp).await.unwrap();
    let mut client = TestClient {
        reader: BufReader::new(tls),
    };

    let greeting = client.read_line().await;
    assert!(greeting.starts_with("+OK POP3SF ready"), "{greeting}");
    assert!(client.cmd("USER alice").await.starts_with("+OK"));
    assert!(client.cmd("PASS pw").await.starts_with("+OK"));
    assert!(client.cmd("QUIT").await.starts_with("+OK"));

    server.stop().await;
    cleanup_material(&cert_path, &key_path);
}

#[tokio::test]
async fn throttled_auth_delays_credential_checks_not_the_socket() {
    let server = TestServer::start(|config| {
        config.auth_delay_curve = vec![0, 1];
    })
    .await;
    let (mut client, _) = TestClient::connect(server.addr()).await;

    client.cmd("USER alice").await;
    assert!(client.cmd("PASS bad1").await.starts_with("-ERR [AUTH]"));
    assert!(client.cmd("PASS bad2").await.starts_with("-ERR [AUTH]"));

    // The second failure put this address one second out; the third
    // credential check must absorb that wait.
    let before = Instant::now();
    assert!(client.cmd("PASS bad3").await.starts_with("-ERR [AUTH]"));
    assert!(before.elapsed() >= Duration::from_millis(900));

    // QUIT is not a credential check and is honored immediately.
    let before = Instant::now();
    assert!(client.cmd("QUIT").await.starts_with("+OK"));
    assert!(before.elapsed() < Duration::from_millis(500));

    server.stop().await;
}

#[tokio::test]
async fn pipelined_commands_answered_in_order() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, _) = TestClient::connect(server.addr()).await;

    client
        .send_raw(b"USER alice\r\nPASS pw\r\nSTAT\r\nNOOP\r\n")
        .await;
    assert!(client.read_line().await.starts_with("+OK"));
    assert!(client.read_line().await.starts_with("+OK"));
    assert!(client.read_line().await.starts_with("+OK 2 "));
    assert!(client.read_line().await.starts_with("+OK"));

    server.stop().await;
}

#[tokio::test]
async fn command_line_length_boundaries() {
    let server = TestServer::start(|_| {}).await;

    // 253 octets plus CRLF: accepted (and unknown).
    let (mut client, _) = TestClient::connect(server.addr()).await;
    let reply = client.cmd(&"A".repeat(253)).await;
    assert!(reply.starts_with("-ERR syntax"), "{reply}");
    // The session is still usable.
    assert!(client.cmd("NOOP").await.starts_with("-ERR"));

    // One octet more: rejected and the connection closes.
    let (mut client, _) = TestClient::connect(server.addr()).await;
    let reply = client.cmd(&"A".repeat(254)).await;
    assert_eq!(reply, "-ERR line too long\r\n");
    let mut rest = Vec::new();
    client.reader.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn top_zero_returns_headers_and_separator_only() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, _) = TestClient::connect(server.addr()).await;
    client.cmd("USER alice").await;
    client.cmd("PASS pw").await;

    assert!(client.cmd("TOP 1 0").await.starts_with("+OK"));
    let lines = client.read_multiline().await;
    assert_eq!(lines, vec!["Subject: one".to_string(), String::new()]);

    assert!(client.cmd("TOP 1 1").await.starts_with("+OK"));
    let lines = client.read_multiline().await;
    assert_eq!(
        lines,
        vec![
            "Subject: one".to_string(),
            String::new(),
            "first message".to_string()
        ]
    );

    server.stop().await;
}

#[tokio::test]
async fn dot_stuffing_survives_the_wire() {
    let server = TestServer::start(|_| {}).await;
    server.adapter.add_user(
        "dot",
        "pw",
        &["Subject: dots\r\n\r\n.leading dot\r\n..two dots\r\nplain\r\n"],
    );

    let (mut client, _) = TestClient::connect(server.addr()).await;
    client.cmd("USER dot").await;
    client.cmd("PASS pw").await;
    assert!(client.cmd("RETR 1").await.starts_with("+OK"));
    let lines = client.read_multiline().await;
    assert_eq!(
        lines,
        vec![
            "Subject: dots".to_string(),
            String::new(),
            ".leading dot".to_string(),
            "..two dots".to_string(),
            "plain".to_string(),
        ]
    );

    server.stop().await;
}

#[tokio::test]
async fn empty_maildrop_listing() {
    let server = TestServer::start(|_| {}).await;
    server.adapter.add_user("empty", "pw", &[]);

    let (mut client, _) = TestClient::connect(server.addr()).await;
    client.cmd("USER empty").await;
    client.cmd("PASS pw").await;
    assert_eq!(client.cmd("STAT").await, "+OK 0 0\r\n");
    assert!(client.cmd("LIST").await.starts_with("+OK"));
    assert!(client.read_multiline().await.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn uidl_listing_is_stable_across_sessions() {
    let server = TestServer::start(|_| {}).await;

    let mut first = Vec::new();
    for _ in 0..2 {
        let (mut client, _) = TestClient::connect(server.addr()).await;
        client.cmd("XPRO").await;
        client.cmd("USER alice").await;
        client.cmd("PASS pw").await;
        assert!(client.cmd("UIDL").await.starts_with("+OK"));
        let listing = client.read_multiline().await;
        assert_eq!(listing.len(), 2);
        if first.is_empty() {
            first = listing;
        } else {
            assert_eq!(first, listing);
        }
        client.cmd("QUIT").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    server.stop().await;
}

#[tokio::test]
async fn over_capacity_connection_is_refused() {
    let server = TestServer::start(|config| {
        config.max_concurrent_sessions = 1;
    })
    .await;

    let (mut a, _) = TestClient::connect(server.addr()).await;
    assert!(a.cmd("NOOP").await.starts_with("-ERR")); // keeps A alive

    let stream = TcpStream::connect(server.addr()).await.unwrap();
    let mut b = TestClient {
        reader: BufReader::new(stream),
    };
    let reply = b.read_line().await;
    assert_eq!(reply, "-ERR [SYS/TEMP] too many connections\r\n");

    server.stop().await;
}

#[tokio::test]
async fn shutdown_notifies_idle_sessions_and_stops() {
    let server = TestServer::start(|_| {}).await;
    let (mut client, _) = TestClient::connect(server.addr()).await;
    client.cmd("USER alice").await;
    client.cmd("PASS pw").await;
    client.cmd("DELE 1").await;

    let adapter = server.adapter.clone();
    let addr = server.addr();
    server.stop().await;

    // The idle session is told the server is going away, and its marks
    // were never committed.
    let line = client.read_line().await;
    assert_eq!(line, "-ERR [SYS/TEMP] server shutting down\r\n");
    assert!(adapter.commit_log().is_empty());
    assert_eq!(adapter.message_count("alice"), 2);

    // Nobody is listening any more.
    assert!(TcpStream::connect(addr).await.is_err());
}

// -- TLS helpers -----------------------------------------------------------

fn self_signed_material(tag: &str) -> (PathBuf, PathBuf, rustls::RootCertStore) {
    // Several tests may race to install; only the first one wins.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir();
    let cert_path = dir.join(format!("pop3sf-test-{}-{tag}.crt", std::process::id()));
    let key_path = dir.join(format!("pop3sf-test-{}-{tag}.key", std::process::id()));
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.cert.der().clone()).unwrap();
    (cert_path, key_path, roots)
}

fn tls_connector(roots: rustls::RootCertStore) -> tokio_rustls::TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

fn cleanup_material(cert_path: &PathBuf, key_path: &PathBuf) {
    let _ = std::fs::remove_file(cert_path);
    let _ = std::fs::remove_file(key_path);
}
