//! Channel bridge: owns the backend connection for one relay session and
//! moves bytes between it and the client connection.
//!
//! All four backend variants (tunnel, tunnel+TLS, direct TCP, direct TLS)
//! converge on one duplex byte stream, so a single bidirectional pump serves
//! every transport. The tunnel variants ride the [`SerialTunnel`] adapter;
//! the TLS variants wrap their substrate with a `tokio_rustls` client.
//!
//! No flow control is implemented between the two sides: a slow client
//! buffers unboundedly. Adding backpressure would change observable behavior
//! under slow consumers, so it is a deliberate omission (see DESIGN.md).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::RelayError;
use crate::mps::TunnelPool;
use crate::relay::interceptor::ProtocolInterceptor;
use crate::relay::recorder::SessionRecorder;
use crate::relay::serial::SerialTunnel;
use crate::relay::RelayPurpose;

/// Base management port, plain. TLS is base+1; redirection is base+2.
pub const PORT_MANAGEMENT: u16 = 16992;
/// Management port, TLS.
pub const PORT_MANAGEMENT_TLS: u16 = 16993;

/// Anything the pump can treat as the backend byte stream.
pub trait BackendIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> BackendIo for T {}

/// The backend connection for one session, behind one duplex stream.
pub type BackendStream = Box<dyn BackendIo>;

/// One chunk from the client connection.
pub struct RelayFrame {
    pub data: Vec<u8>,
    /// Whether the client sent this as a binary frame (recorded in the
    /// session log's flag bits).
    pub binary: bool,
}

/// Live per-direction byte counters for one session, shared between the pump
/// and the registry entry (lock-free, loaded by the listing endpoint).
#[derive(Clone, Default)]
pub struct TrafficCounters {
    /// Bytes forwarded client → device, post-interceptor.
    pub to_device: Arc<AtomicU64>,
    /// Bytes forwarded device → client, post-interceptor.
    pub to_client: Arc<AtomicU64>,
}

/// Pick the device port for a session: management or redirection (base+2),
/// plain or TLS (base+1).
pub fn select_port(purpose: RelayPurpose, tls: bool) -> u16 {
    let base = if tls {
        PORT_MANAGEMENT_TLS
    } else {
        PORT_MANAGEMENT
    };
    if purpose.is_redirection() {
        base + 2
    } else {
        base
    }
}

/// Certificate verifier for device management endpoints.
///
/// Management interfaces present self-signed certificates until a trusted
/// identity is provisioned; trust is established out-of-band by the
/// activation engine's hash allow-list, not by chain verification here.
#[derive(Debug)]
struct DeviceCertVerifier;

impl rustls::client::danger::ServerCertVerifier for DeviceCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the TLS client used for both direct-TLS sockets and TLS-over-tunnel.
///
/// `tls1only` restricts the handshake to the oldest protocol version this
/// stack offers, for firmware that rejects newer versions.
fn tls_connector(tls1only: bool) -> TlsConnector {
    let builder = if tls1only {
        rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
    } else {
        rustls::ClientConfig::builder()
    };
    let mut config = builder
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(DeviceCertVerifier));
    TlsConnector::from(Arc::new(config))
}

fn server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>, RelayError> {
    rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| RelayError::Tls(format!("invalid server name: {host}")))
}

/// Open a direct socket to the device, TLS-wrapped when its policy asks.
pub async fn connect_direct(
    host: &str,
    purpose: RelayPurpose,
    tls: bool,
    tls1only: bool,
) -> Result<BackendStream, RelayError> {
    let port = select_port(purpose, tls);
    let tcp = TcpStream::connect((host, port)).await?;
    if tls {
        let stream = tls_connector(tls1only)
            .connect(server_name(host)?, tcp)
            .await
            .map_err(|e| RelayError::Tls(e.to_string()))?;
        debug!(host, port, "Direct TLS backend up");
        Ok(Box::new(stream))
    } else {
        debug!(host, port, "Direct TCP backend up");
        Ok(Box::new(tcp))
    }
}

/// Open a tunnel channel to the device through the manageability server,
/// TLS-wrapped over the [`SerialTunnel`] adapter unless the tunnel
/// advertises the plain management port.
pub async fn connect_tunnel(
    pool: &dyn TunnelPool,
    node_id: &str,
    host: &str,
    purpose: RelayPurpose,
    tls1only: bool,
) -> Result<BackendStream, RelayError> {
    let tls = !pool.plain_management_port(node_id).await;
    let port = select_port(purpose, tls);
    let mut channel = pool.open_channel(node_id, port).await?;
    channel.wait_connected().await?;

    let adapter = SerialTunnel::new(channel.incoming, channel.outgoing);
    if tls {
        // The TLS handshake completes before this returns, so no application
        // payload is forwarded until the channel is fully established.
        let stream = tls_connector(tls1only)
            .connect(server_name(host)?, adapter)
            .await
            .map_err(|e| RelayError::Tls(e.to_string()))?;
        debug!(node = %node_id, port, "Tunnel TLS backend up");
        Ok(Box::new(stream))
    } else {
        debug!(node = %node_id, port, "Tunnel backend up");
        Ok(Box::new(adapter))
    }
}

/// Pump bytes both ways until either side closes or errors, then tear down.
///
/// Per direction, chunks are forwarded in strict arrival order and the
/// interceptor (when present) is applied exactly once per non-empty chunk.
/// An interceptor failure is a relay error: full teardown, no propagation.
/// Returns after teardown; `Ok` for a clean close from either side.
pub async fn run_bridge(
    backend: BackendStream,
    mut client_in: mpsc::UnboundedReceiver<RelayFrame>,
    client_out: mpsc::UnboundedSender<Vec<u8>>,
    mut interceptor: Option<Box<dyn ProtocolInterceptor>>,
    recorder: Option<SessionRecorder>,
    counters: TrafficCounters,
) -> Result<(), RelayError> {
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);
    let mut recorder = recorder;
    let mut buf = vec![0u8; 16 * 1024];

    let result = loop {
        tokio::select! {
            read = backend_rd.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    let mut data = buf[..n].to_vec();
                    if let Some(i) = interceptor.as_mut() {
                        data = match i.process_inbound(&data) {
                            Ok(d) => d,
                            Err(e) => break Err(RelayError::Interceptor(e)),
                        };
                    }
                    if data.is_empty() {
                        continue;
                    }
                    if let Some(r) = recorder.as_ref() {
                        r.record_data(&data, true, false).await;
                    }
                    counters.to_client.fetch_add(data.len() as u64, Ordering::Relaxed);
                    if client_out.send(data).is_err() {
                        break Ok(());
                    }
                }
                Err(e) => break Err(RelayError::Transport(e)),
            },
            frame = client_in.recv() => match frame {
                Some(frame) => {
                    if frame.data.is_empty() {
                        continue;
                    }
                    let mut data = frame.data;
                    if let Some(i) = interceptor.as_mut() {
                        data = match i.process_outbound(&data) {
                            Ok(d) => d,
                            Err(e) => break Err(RelayError::Interceptor(e)),
                        };
                    }
                    if data.is_empty() {
                        continue;
                    }
                    if let Some(r) = recorder.as_ref() {
                        r.record_data(&data, frame.binary, true).await;
                    }
                    if let Err(e) = backend_wr.write_all(&data).await {
                        break Err(RelayError::Transport(e));
                    }
                    counters.to_device.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                None => break Ok(()),
            },
        }
    };

    teardown(&mut backend_wr, &mut recorder).await;
    result
}

/// Release a session's backend and recorder. Safe to invoke repeatedly from
/// any combination of error and close paths; never panics.
pub async fn teardown(
    backend_wr: &mut WriteHalf<BackendStream>,
    recorder: &mut Option<SessionRecorder>,
) {
    let _ = backend_wr.shutdown().await;
    if let Some(r) = recorder.take() {
        r.close().await;
    }
}
