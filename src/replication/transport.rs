//! QUIC replication server/client.
//!
//! TLS uses the node's own certificate. The server presents it but does
//! not require a client certificate; the client skips verifying the
//! peer's certificate entirely (cluster membership is authenticated by
//! the bearer token in the request header, not the TLS handshake).

use crate::error::{Error, Result};
use crate::replication::protocol::{
    clamp_status_limit, Action, DatasetEntry, EventEntry, Request, Response, SnapshotEntry,
    ALPN, MAX_HEADER_BYTES, PROTOCOL_VERSION,
};
use crate::zfs::ZfsGateway;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);
const SERVER_IDLE_TIMEOUT: Duration = Duration::from_secs(4 * 24 * 60 * 60);
const PROGRESS_BYTES_INTERVAL: u64 = 10 * 1024 * 1024;
const PROGRESS_TIME_INTERVAL: Duration = Duration::from_secs(30);

pub struct TlsPaths {
    pub cert_pem: std::path::PathBuf,
    pub key_pem: std::path::PathBuf,
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Transport(format!("failed to parse certificate PEM: {e}")))
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Transport(format!("failed to parse private key PEM: {e}")))?
        .ok_or_else(|| Error::Transport(format!("no private key found in {}", path.display())))
}

pub fn build_server_config(paths: &TlsPaths) -> Result<ServerConfig> {
    let certs = load_certs(&paths.cert_pem)?;
    let key = load_key(&paths.key_pem)?;

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Transport(format!("invalid server TLS config: {e}")))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| Error::Transport(format!("failed to build QUIC server crypto: {e}")))?;
    let mut server_config = ServerConfig::with_crypto(Arc::new(quic_crypto));
    let transport = Arc::get_mut(&mut server_config.transport).unwrap();
    transport.max_idle_timeout(Some(
        SERVER_IDLE_TIMEOUT
            .try_into()
            .map_err(|_| Error::Transport("idle timeout out of range".into()))?,
    ));
    Ok(server_config)
}

pub fn build_client_config(paths: &TlsPaths) -> Result<ClientConfig> {
    let certs = load_certs(&paths.cert_pem)?;
    let key = load_key(&paths.key_pem)?;

    let mut tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::Transport(format!("invalid client TLS config: {e}")))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| Error::Transport(format!("failed to build QUIC client crypto: {e}")))?;
    let mut client_config = ClientConfig::new(Arc::new(quic_crypto));
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        CLIENT_IDLE_TIMEOUT
            .try_into()
            .map_err(|_| Error::Transport("idle timeout out of range".into()))?,
    ));
    client_config.transport_config(Arc::new(transport));
    Ok(client_config)
}

/// Deliberately accepts any server certificate; the cluster token in the
/// request header is the real authentication boundary.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Validates a cluster-scoped bearer token. The actual verifier (JWT or
/// otherwise) is injected; this module only knows it returns bool.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> bool;
}

pub async fn read_header(recv: &mut RecvStream) -> Result<Request> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = recv
            .read(&mut byte)
            .await
            .map_err(|e| Error::Transport(format!("failed reading request header: {e}")))?
            .unwrap_or(0);
        if n == 0 {
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::Transport("request header exceeds 64 KiB".into()));
        }
    }
    let request: Request = serde_json::from_slice(&buf)?;
    if request.version != PROTOCOL_VERSION {
        return Err(Error::ProtocolVersion {
            expected: PROTOCOL_VERSION,
            got: request.version,
        });
    }
    Ok(request)
}

pub async fn write_response(send: &mut SendStream, response: &Response) -> Result<()> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    send.write_all(&line)
        .await
        .map_err(|e| Error::Transport(format!("failed writing response: {e}")))
}

/// Serves one accepted QUIC connection: every bidirectional stream is
/// one request.
pub async fn serve_connection(
    connection: Connection,
    zfs: Arc<ZfsGateway>,
    verifier: Arc<dyn TokenVerifier>,
    events: Arc<tokio::sync::Mutex<Vec<EventEntry>>>,
) -> Result<()> {
    loop {
        let stream = connection.accept_bi().await;
        let (mut send, mut recv) = match stream {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_)) => break,
            Err(e) => return Err(Error::Transport(format!("connection error: {e}"))),
        };
        let zfs = zfs.clone();
        let verifier = verifier.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(&mut send, &mut recv, &zfs, &verifier, &events).await {
                eprintln!("repl: stream handler failed: {e}");
                let _ = write_response(&mut send, &Response::err(e.to_string())).await;
            }
        });
    }
    Ok(())
}

async fn handle_stream(
    send: &mut SendStream,
    recv: &mut RecvStream,
    zfs: &ZfsGateway,
    verifier: &dyn TokenVerifier,
    events: &tokio::sync::Mutex<Vec<EventEntry>>,
) -> Result<()> {
    let request = read_header(recv).await?;
    if request.token.is_empty() || !verifier.verify(&request.token) {
        return Err(Error::AuthFailed("invalid or missing cluster token".into()));
    }

    match request.action {
        Action::Snapshots => {
            let dataset = request
                .dataset
                .ok_or_else(|| Error::Validation("snapshots requires dataset".into()))?;
            let snaps = zfs.list_snapshots(&dataset)?;
            let entries = snaps
                .into_iter()
                .map(|s| SnapshotEntry {
                    name: s.name,
                    guid: s.guid,
                    createtxg: s.createtxg,
                })
                .collect();
            write_response(
                send,
                &Response {
                    ok: true,
                    snapshots: Some(entries),
                    ..Default::default()
                },
            )
            .await
        }
        Action::Datasets => {
            let prefix = request.prefix.unwrap_or_default();
            let rows = zfs.list_datasets(&prefix)?;
            let entries = rows
                .into_iter()
                .map(|d| DatasetEntry {
                    name: d.name,
                    guid: d.guid,
                    kind: d.kind,
                    creation: d.creation,
                    used: d.used,
                    refer: d.refer,
                    avail: d.avail,
                    mountpoint: d.mountpoint,
                })
                .collect();
            write_response(
                send,
                &Response {
                    ok: true,
                    datasets: Some(entries),
                    ..Default::default()
                },
            )
            .await
        }
        Action::Status => {
            let limit = clamp_status_limit(request.limit);
            let guard = events.lock().await;
            let tail: Vec<EventEntry> = guard.iter().rev().take(limit).cloned().collect();
            write_response(
                send,
                &Response {
                    ok: true,
                    events: Some(tail),
                    ..Default::default()
                },
            )
            .await
        }
        Action::Receive => {
            let dataset = request
                .dataset
                .ok_or_else(|| Error::Validation("receive requires dataset".into()))?;
            zfs.ensure_parent(&dataset)?;
            zfs.clear_resume_token(&dataset)?;
            let child = zfs.spawn_receive(&dataset, request.force)?;
            receive_stream_into_child(recv, child).await?;
            write_response(send, &Response::ok()).await
        }
        Action::Send => {
            let dataset = request
                .dataset
                .ok_or_else(|| Error::Validation("send requires dataset".into()))?;
            let snaps = zfs.list_snapshots(&dataset)?;
            let target = resolve_target(&snaps, request.target_snapshot.as_deref())?;
            if let Some(base) = &request.base_snapshot {
                if base == &target {
                    return Err(Error::Validation("target equals base".into()));
                }
            }
            write_response(
                send,
                &Response {
                    ok: true,
                    target_snapshot: Some(target.clone()),
                    ..Default::default()
                },
            )
            .await?;
            let child = zfs.spawn_send(
                &dataset,
                request.base_snapshot.as_deref(),
                &target,
                request.with_intermediates,
            )?;
            send_child_stdout(child, send).await
        }
    }
}

fn resolve_target(snaps: &[crate::zfs::SnapshotInfo], requested: Option<&str>) -> Result<String> {
    if let Some(name) = requested {
        return Ok(name.to_string());
    }
    snaps
        .last()
        .map(|s| s.name.clone())
        .ok_or_else(|| Error::SnapshotNotFound("no snapshots present".into()))
}

/// Pumps bytes from the QUIC recv stream into `zfs recv`'s stdin. The
/// child's stdin is blocking, so the actual writes happen on a dedicated
/// blocking task fed through a channel while this task drives the async
/// QUIC reads.
async fn receive_stream_into_child(recv: &mut RecvStream, mut child: std::process::Child) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Transport("zfs recv missing stdin".into()))?;
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(4);
    let writer = tokio::task::spawn_blocking(move || -> Result<()> {
        while let Some(chunk) = rx.blocking_recv() {
            stdin
                .write_all(&chunk)
                .map_err(|e| Error::Transport(format!("zfs recv stdin write failed: {e}")))?;
        }
        Ok(())
    });

    let mut progress = ProgressObserver::new("receive");
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match recv
            .read(&mut buf)
            .await
            .map_err(|e| Error::Transport(format!("failed reading request body: {e}")))?
        {
            None => break,
            Some(n) => {
                progress.advance(n as u64);
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
    drop(tx);
    writer
        .await
        .map_err(|e| Error::Transport(format!("receive writer task panicked: {e}")))??;

    let status = child
        .wait()
        .map_err(|e| Error::Transport(format!("zfs recv wait failed: {e}")))?;
    if !status.success() {
        return Err(Error::Transport("zfs recv exited with failure".into()));
    }
    Ok(())
}

/// Pumps `zfs send`'s stdout into the QUIC send stream. The child's
/// stdout is blocking, so reads happen on a dedicated blocking task fed
/// through a channel while this task drives the async QUIC writes.
async fn send_child_stdout(mut child: std::process::Child, send: &mut SendStream) -> Result<()> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Transport("zfs send missing stdout".into()))?;
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(4);
    let reader = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = stdout
                .read(&mut buf)
                .map_err(|e| Error::Transport(format!("zfs send stdout read failed: {e}")))?;
            if n == 0 {
                break;
            }
            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                break;
            }
        }
        Ok(())
    });

    let mut progress = ProgressObserver::new("send");
    while let Some(chunk) = rx.recv().await {
        progress.advance(chunk.len() as u64);
        send.write_all(&chunk)
            .await
            .map_err(|e| Error::Transport(format!("failed writing send stream: {e}")))?;
    }
    send.finish()
        .map_err(|e| Error::Transport(format!("failed to finish send stream: {e}")))?;
    reader
        .await
        .map_err(|e| Error::Transport(format!("send reader task panicked: {e}")))??;

    let status = child
        .wait()
        .map_err(|e| Error::Transport(format!("zfs send wait failed: {e}")))?;
    if !status.success() {
        return Err(Error::Transport("zfs send exited with failure".into()));
    }
    Ok(())
}

/// Logs cumulative bytes transferred every 10 MiB or 30 s, whichever
/// comes first.
pub struct ProgressObserver {
    label: String,
    total: u64,
    last_logged: u64,
    last_logged_at: Instant,
}

impl ProgressObserver {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            total: 0,
            last_logged: 0,
            last_logged_at: Instant::now(),
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.total += bytes;
        let elapsed_due = self.last_logged_at.elapsed() >= PROGRESS_TIME_INTERVAL;
        let bytes_due = self.total - self.last_logged >= PROGRESS_BYTES_INTERVAL;
        if elapsed_due || bytes_due {
            println!("repl: {} — {} bytes transferred", self.label, self.total);
            self.last_logged = self.total;
            self.last_logged_at = Instant::now();
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// A target may be a literal `<host>:<port>` or a bare node identifier
/// resolved through the consensus layer's peer directory.
pub trait PeerDirectory: Send + Sync {
    fn resolve(&self, node_identifier: &str) -> Option<SocketAddr>;
}

pub fn resolve_peer(target: &str, directory: &dyn PeerDirectory) -> Result<SocketAddr> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    directory
        .resolve(target)
        .ok_or_else(|| Error::UnknownPeer(target.to_string()))
}

pub async fn connect(
    endpoint: &Endpoint,
    addr: SocketAddr,
    server_name: &str,
) -> Result<Connection> {
    endpoint
        .connect(addr, server_name)
        .map_err(|e| Error::Transport(format!("failed to start QUIC connect: {e}")))?
        .await
        .map_err(|e| Error::Transport(format!("QUIC handshake failed: {e}")))
}

async fn write_header(send: &mut SendStream, request: &Request) -> Result<()> {
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    send.write_all(&line)
        .await
        .map_err(|e| Error::Transport(format!("failed writing request header: {e}")))
}

async fn read_response_line(recv: &mut RecvStream) -> Result<Response> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = recv
            .read(&mut byte)
            .await
            .map_err(|e| Error::Transport(format!("failed reading response: {e}")))?
            .unwrap_or(0);
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::Transport("response header exceeds 64 KiB".into()));
        }
    }
    Ok(serde_json::from_slice(&buf)?)
}

/// A request/response round trip with no streaming body, used by
/// `snapshots`, `datasets`, and `status`.
pub async fn simple_request(connection: &Connection, request: &Request) -> Result<Response> {
    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| Error::Transport(format!("failed to open stream: {e}")))?;
    write_header(&mut send, request).await?;
    send.finish()
        .map_err(|e| Error::Transport(format!("failed to finish request stream: {e}")))?;
    read_response_line(&mut recv).await
}

async fn fetch_remote_snapshots(
    connection: &Connection,
    dataset: &str,
    token: &str,
) -> Result<Vec<SnapshotEntry>> {
    let request = Request {
        version: PROTOCOL_VERSION,
        action: Action::Snapshots,
        token: token.to_string(),
        dataset: Some(dataset.to_string()),
        prefix: None,
        limit: None,
        force: false,
        base_snapshot: None,
        target_snapshot: None,
        with_intermediates: false,
    };
    let response = simple_request(connection, &request).await?;
    if !response.ok {
        return Err(Error::Transport(
            response.error.unwrap_or_else(|| "snapshots request failed".into()),
        ));
    }
    Ok(response.snapshots.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub mode: String,
    pub target_snapshot: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    pub mode: String,
    pub target_snapshot: String,
}

/// Backup-job runs pass `fresh_snapshot_name` to always snapshot before
/// diffing; interactive pushes pass `None` to reuse the latest snapshot.
pub async fn replicate_dataset_to_node(
    connection: &Connection,
    zfs: &ZfsGateway,
    source_dataset: &str,
    destination_dataset: &str,
    token: &str,
    fresh_snapshot_name: Option<&str>,
) -> Result<PushOutcome> {
    let target_snapshot = match fresh_snapshot_name {
        Some(name) => {
            zfs.create_snapshot(source_dataset, name)?;
            name.to_string()
        }
        None => zfs
            .list_snapshots(source_dataset)?
            .last()
            .map(|s| s.name.clone())
            .ok_or_else(|| Error::SnapshotNotFound(format!("no snapshots on {source_dataset}")))?,
    };

    let remote_snapshots = fetch_remote_snapshots(connection, destination_dataset, token).await?;
    let local_snapshots = zfs.list_snapshots(source_dataset)?;
    let base = local_snapshots
        .iter()
        .rev()
        .find(|s| remote_snapshots.iter().any(|r| r.guid == s.guid))
        .map(|s| s.name.clone());

    if base.as_deref() == Some(target_snapshot.as_str()) {
        return Ok(PushOutcome {
            mode: "noop".to_string(),
            target_snapshot,
        });
    }

    let request = Request {
        version: PROTOCOL_VERSION,
        action: Action::Receive,
        token: token.to_string(),
        dataset: Some(destination_dataset.to_string()),
        prefix: None,
        limit: None,
        force: false,
        base_snapshot: None,
        target_snapshot: None,
        with_intermediates: false,
    };
    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| Error::Transport(format!("failed to open stream: {e}")))?;
    write_header(&mut send, &request).await?;
    let child = zfs.spawn_send(source_dataset, base.as_deref(), &target_snapshot, false)?;
    send_child_stdout(child, &mut send).await?;
    let response = read_response_line(&mut recv).await?;
    if !response.ok {
        return Err(Error::Transport(
            response.error.unwrap_or_else(|| "receive failed on peer".into()),
        ));
    }

    Ok(PushOutcome {
        mode: if base.is_some() { "incremental" } else { "full" }.to_string(),
        target_snapshot,
    })
}

/// Symmetric to `replicate_dataset_to_node`: pulls the peer's dataset
/// into our local gateway.
pub async fn pull_dataset_from_node(
    connection: &Connection,
    zfs: &ZfsGateway,
    remote_dataset: &str,
    destination_dataset: &str,
    token: &str,
) -> Result<PullOutcome> {
    let remote_snapshots = fetch_remote_snapshots(connection, remote_dataset, token).await?;
    let local_snapshots = zfs.list_snapshots(destination_dataset)?;
    let base = local_snapshots
        .iter()
        .rev()
        .find(|s| remote_snapshots.iter().any(|r| r.guid == s.guid))
        .map(|s| s.name.clone());

    let request = Request {
        version: PROTOCOL_VERSION,
        action: Action::Send,
        token: token.to_string(),
        dataset: Some(remote_dataset.to_string()),
        prefix: None,
        limit: None,
        force: false,
        base_snapshot: base.clone(),
        target_snapshot: None,
        with_intermediates: false,
    };
    let (mut send, mut recv) = connection
        .open_bi()
        .await
        .map_err(|e| Error::Transport(format!("failed to open stream: {e}")))?;
    write_header(&mut send, &request).await?;
    send.finish()
        .map_err(|e| Error::Transport(format!("failed to finish request stream: {e}")))?;

    let ack = read_response_line(&mut recv).await?;
    if !ack.ok {
        return Err(Error::Transport(
            ack.error.unwrap_or_else(|| "send failed on peer".into()),
        ));
    }
    let target_snapshot = ack
        .target_snapshot
        .ok_or_else(|| Error::Transport("peer ack missing targetSnapshot".into()))?;

    zfs.ensure_parent(destination_dataset)?;
    zfs.clear_resume_token(destination_dataset)?;
    let child = zfs.spawn_receive(destination_dataset, false)?;
    receive_stream_into_child(&mut recv, child).await?;

    Ok(PullOutcome {
        mode: if base.is_some() { "incremental" } else { "full" }.to_string(),
        target_snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_observer_logs_past_threshold() {
        let mut p = ProgressObserver::new("test");
        p.advance(5 * 1024 * 1024);
        assert_eq!(p.total(), 5 * 1024 * 1024);
        p.advance(6 * 1024 * 1024);
        assert_eq!(p.total(), 11 * 1024 * 1024);
    }

    #[test]
    fn resolve_peer_accepts_literal_socket_addr() {
        struct EmptyDirectory;
        impl PeerDirectory for EmptyDirectory {
            fn resolve(&self, _node_identifier: &str) -> Option<SocketAddr> {
                None
            }
        }
        let addr = resolve_peer("127.0.0.1:4433", &EmptyDirectory).unwrap();
        assert_eq!(addr.port(), 4433);
    }

    #[test]
    fn resolve_peer_uses_directory_for_bare_identifiers() {
        struct OneNodeDirectory;
        impl PeerDirectory for OneNodeDirectory {
            fn resolve(&self, node_identifier: &str) -> Option<SocketAddr> {
                if node_identifier == "node-b" {
                    Some("10.0.0.2:4433".parse().unwrap())
                } else {
                    None
                }
            }
        }
        let addr = resolve_peer("node-b", &OneNodeDirectory).unwrap();
        assert_eq!(addr.ip().to_string(), "10.0.0.2");

        assert!(resolve_peer("node-z", &OneNodeDirectory).is_err());
    }

    #[test]
    fn resolve_target_defaults_to_latest_by_createtxg() {
        let snaps = vec![
            crate::zfs::SnapshotInfo {
                name: "t1".into(),
                guid: "1".into(),
                createtxg: 1,
            },
            crate::zfs::SnapshotInfo {
                name: "t2".into(),
                guid: "2".into(),
                createtxg: 2,
            },
        ];
        assert_eq!(resolve_target(&snaps, None).unwrap(), "t2");
        assert_eq!(resolve_target(&snaps, Some("t1")).unwrap(), "t1");
    }
}
