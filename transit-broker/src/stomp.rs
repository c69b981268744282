//! STOMP 1.2 connector over TCP with optional mutual TLS.

use crate::frame::{Command, Frame, Inbound, Outbound, StompCodec};
use crate::{Connector, Message, Session, Subscription, TransportError};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsParams {
    /// PEM client certificate chain
    pub cert: PathBuf,

    /// PEM private key
    pub key: PathBuf,

    /// PEM bundle of trusted CA certificates
    pub ca_cert: PathBuf,

    /// Name to verify the broker certificate against (defaults to the host)
    pub server_name: Option<String>,
}

/// Broker connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub tls: Option<TlsParams>,
    pub login: Option<String>,
    pub passcode: Option<String>,

    /// Heart-beat interval offered to the broker (zero disables)
    pub heartbeat: Duration,

    /// Bound on TCP connect, TLS handshake and CONNECTED wait
    pub connect_timeout: Duration,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 443,
            vhost: "/".to_string(),
            tls: None,
            login: None,
            passcode: None,
            heartbeat: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

trait BrokerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BrokerStream for T {}

type BrokerFramed = Framed<Box<dyn BrokerStream>, StompCodec>;
type FrameSink = SplitSink<BrokerFramed, Outbound>;
type FrameStream = SplitStream<BrokerFramed>;

fn load_tls_config(tls: &TlsParams) -> Result<ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    let ca_certs = CertificateDer::pem_file_iter(&tls.ca_cert)
        .map_err(|e| TransportError::Tls(format!("{}: {e}", tls.ca_cert.display())))?;
    for cert in ca_certs {
        let cert = cert.map_err(|e| TransportError::Tls(format!("bad CA certificate: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("failed to add CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(TransportError::Tls(format!(
            "no CA certificates found in {}",
            tls.ca_cert.display()
        )));
    }

    let chain = CertificateDer::pem_file_iter(&tls.cert)
        .map_err(|e| TransportError::Tls(format!("{}: {e}", tls.cert.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("bad client certificate: {e}")))?;
    if chain.is_empty() {
        return Err(TransportError::Tls(format!(
            "no client certificate found in {}",
            tls.cert.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(&tls.key)
        .map_err(|e| TransportError::Tls(format!("{}: {e}", tls.key.display())))?;

    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| TransportError::Tls(format!("client config error: {e}")))
}

/// Parse a `heart-beat:x,y` header
fn parse_heartbeat(value: Option<&str>) -> (u64, u64) {
    let Some((x, y)) = value.and_then(|v| v.split_once(',')) else {
        return (0, 0);
    };
    (
        x.trim().parse().unwrap_or(0),
        y.trim().parse().unwrap_or(0),
    )
}

/// Negotiated interval: zero on either side disables it
fn negotiate(ours: u64, theirs: u64) -> Option<Duration> {
    if ours == 0 || theirs == 0 {
        None
    } else {
        Some(Duration::from_millis(ours.max(theirs)))
    }
}

/// Opens STOMP sessions
pub struct StompConnector {
    params: ConnectionParams,
    tls: Option<TlsConnector>,
}

impl StompConnector {
    /// Create a connector, loading TLS material up front
    pub fn new(params: ConnectionParams) -> Result<Self, TransportError> {
        let tls = match &params.tls {
            Some(tls) => Some(TlsConnector::from(Arc::new(load_tls_config(tls)?))),
            None => None,
        };
        Ok(Self { params, tls })
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    async fn open_stream(&self) -> Result<Box<dyn BrokerStream>, TransportError> {
        let addr = (self.params.host.as_str(), self.params.port);
        let tcp = timeout(self.params.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout("TCP connect"))??;
        tcp.set_nodelay(true)?;

        let Some(connector) = &self.tls else {
            return Ok(Box::new(tcp));
        };

        let name = self
            .params
            .tls
            .as_ref()
            .and_then(|t| t.server_name.clone())
            .unwrap_or_else(|| self.params.host.clone());
        let server_name = ServerName::try_from(name)
            .map_err(|e| TransportError::Tls(format!("invalid server name: {e}")))?;

        let stream = timeout(
            self.params.connect_timeout,
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| TransportError::Timeout("TLS handshake"))??;

        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Connector for StompConnector {
    type Session = StompSession;

    async fn connect(&self) -> Result<StompSession, TransportError> {
        let stream = self.open_stream().await?;
        let mut framed = Framed::new(stream, StompCodec::default());

        let beat = self.params.heartbeat.as_millis() as u64;
        let mut connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", self.params.vhost.clone())
            .header("heart-beat", format!("{beat},{beat}"));
        if let Some(login) = &self.params.login {
            connect = connect.header("login", login.clone());
        }
        if let Some(passcode) = &self.params.passcode {
            connect = connect.header("passcode", passcode.clone());
        }
        framed.send(Outbound::Frame(connect)).await?;

        let reply = timeout(self.params.connect_timeout, next_frame(&mut framed))
            .await
            .map_err(|_| TransportError::Timeout("CONNECTED"))??;

        match reply.command {
            Command::Connected => {}
            Command::Error => return Err(TransportError::Rejected(error_text(&reply))),
            other => {
                return Err(TransportError::Rejected(format!(
                    "unexpected {} frame during connect",
                    other.as_str()
                )))
            }
        }

        let (server_send, server_recv) = parse_heartbeat(reply.get("heart-beat"));
        let send_every = negotiate(beat, server_recv);
        // Allow one missed beat before declaring the broker gone.
        let read_timeout = negotiate(beat, server_send).map(|d| d * 2);

        info!(
            endpoint = %self.endpoint(),
            server = reply.get("server").unwrap_or("unknown"),
            heartbeat_ms = send_every.map(|d| d.as_millis() as u64).unwrap_or(0),
            "STOMP session established"
        );

        Ok(StompSession::start(framed, send_every, read_timeout))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.params.host, self.params.port)
    }
}

async fn next_frame(framed: &mut BrokerFramed) -> Result<Frame, TransportError> {
    loop {
        match framed.next().await {
            Some(Ok(Inbound::Frame(frame))) => return Ok(frame),
            Some(Ok(Inbound::Heartbeat)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::Closed),
        }
    }
}

fn error_text(frame: &Frame) -> String {
    let message = frame.get("message").unwrap_or("ERROR frame");
    if frame.body.is_empty() {
        message.to_string()
    } else {
        format!("{message}: {}", String::from_utf8_lossy(&frame.body).trim())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// A frame for the writer task, answered once it is flushed
struct WriteRequest {
    frame: Frame,
    close: bool,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// Owns the write half: queued frames go out in order and a heart-beat is
/// written whenever `send_every` passes without other traffic.
async fn write_loop(
    mut sink: FrameSink,
    mut requests: mpsc::Receiver<WriteRequest>,
    send_every: Option<Duration>,
) {
    let mut last_sent = Instant::now();
    loop {
        let beat_at = send_every.map(|d| last_sent + d);
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    return;
                };
                let mut result = sink
                    .send(Outbound::Frame(request.frame))
                    .await
                    .map_err(TransportError::from);
                if result.is_ok() && request.close {
                    result = sink.close().await.map_err(TransportError::from);
                }
                last_sent = Instant::now();
                let stop = result.is_err() || request.close;
                let _ = request.done.send(result);
                if stop {
                    return;
                }
            }
            _ = sleep_until_opt(beat_at) => {
                if let Err(e) = sink.send(Outbound::Heartbeat).await {
                    warn!(error = %e, "Failed to send heart-beat");
                    return;
                }
                last_sent = Instant::now();
            }
        }
    }
}

/// An established STOMP session
///
/// Reads happen in `recv`; writes and heart-beats run on a separate task so
/// a slow consumer does not starve the broker of heart-beats.
pub struct StompSession {
    frames: FrameStream,
    writer: mpsc::Sender<WriteRequest>,
    read_timeout: Option<Duration>,
    last_received: Instant,
}

impl StompSession {
    fn start(
        framed: BrokerFramed,
        send_every: Option<Duration>,
        read_timeout: Option<Duration>,
    ) -> Self {
        let (sink, frames) = framed.split();
        let (writer, requests) = mpsc::channel(32);
        tokio::spawn(write_loop(sink, requests, send_every));
        Self {
            frames,
            writer,
            read_timeout,
            last_received: Instant::now(),
        }
    }

    async fn write(&mut self, frame: Frame, close: bool) -> Result<(), TransportError> {
        let (done, result) = oneshot::channel();
        self.writer
            .send(WriteRequest { frame, close, done })
            .await
            .map_err(|_| TransportError::Closed)?;
        result.await.map_err(|_| TransportError::Closed)?
    }

    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.write(frame, false).await
    }
}

#[async_trait]
impl Session for StompSession {
    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        let mut frame = Frame::new(Command::Subscribe)
            .header("id", subscription.id.clone())
            .header("destination", subscription.destination.clone())
            .header("ack", "client-individual");
        if subscription.durable {
            frame = frame.header("durable", "true").header("auto-delete", "false");
        }
        self.send(frame).await
    }

    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            let dead_at = self.read_timeout.map(|d| self.last_received + d);

            tokio::select! {
                item = self.frames.next() => {
                    self.last_received = Instant::now();
                    let frame = match item {
                        None => return Ok(None),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(Inbound::Heartbeat)) => continue,
                        Some(Ok(Inbound::Frame(frame))) => frame,
                    };
                    match frame.command {
                        Command::Message => return message_from(frame).map(Some),
                        Command::Error => return Err(TransportError::Rejected(error_text(&frame))),
                        other => debug!(command = other.as_str(), "Ignoring frame"),
                    }
                }
                _ = sleep_until_opt(dead_at) => {
                    warn!("No data or heart-beat from broker within the negotiated interval");
                    return Ok(None);
                }
            }
        }
    }

    async fn ack(&mut self, ack_id: &str) -> Result<(), TransportError> {
        self.send(Frame::new(Command::Ack).header("id", ack_id)).await
    }

    async fn nack(&mut self, ack_id: &str) -> Result<(), TransportError> {
        self.send(Frame::new(Command::Nack).header("id", ack_id)).await
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.write(Frame::new(Command::Disconnect), true).await
    }
}

fn message_from(frame: Frame) -> Result<Message, TransportError> {
    let message_id = frame
        .get("message-id")
        .ok_or_else(|| TransportError::Rejected("MESSAGE frame without message-id".into()))?
        .to_string();
    let ack_id = frame.get("ack").unwrap_or(&message_id).to_string();
    Ok(Message {
        message_id,
        ack_id,
        headers: frame.headers,
        body: frame.body,
    })
}
