//! Length-prefixed frames over TCP or a Unix socket

use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use twinlink_protocol::{ClientCodec, ClientFrame, ServerFrame, PROTOCOL_VERSION};
use twinlink_utils::{Result, TwinError};

use super::{Transport, TransportEvent, TransportSession, EVENT_CHANNEL_CAPACITY};
use crate::config::{ClientConfig, Endpoint, ProxyConfig};

/// Upper bound on the proxy's CONNECT response header
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Trait alias for streams that can be used with Framed
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamTrait for T {}

type FramedStream = Framed<Box<dyn StreamTrait>, ClientCodec>;

/// Why the I/O loop stopped
enum LoopExit {
    /// The client asked to disconnect or dropped its sender
    Closed,
    /// The connection broke
    Lost(String),
}

/// Socket transport with handshake and fixed-delay reconnect
#[derive(Debug, Clone, Default)]
pub struct FramedTransport;

impl FramedTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for FramedTransport {
    fn open(self, config: &ClientConfig) -> BoxFuture<'static, Result<TransportSession>> {
        let config = config.clone();
        async move {
            let endpoint = config.parsed_endpoint()?;
            if config.proxy.is_some() && matches!(endpoint, Endpoint::Unix(_)) {
                return Err(TwinError::config("A proxy cannot be used with a unix endpoint"));
            }
            let (framed, session_id) = establish(&endpoint, &config).await?;
            tracing::info!(endpoint = %endpoint, session = %session_id, "Connected to registry");

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

            let task = tokio::spawn(connection_task(
                framed,
                outbound_rx,
                events_tx,
                endpoint,
                config,
            ));

            Ok(TransportSession::new(
                session_id,
                outbound_tx,
                events_rx,
                Some(task),
            ))
        }
        .boxed()
    }
}

/// Connect, tunnel and authenticate, bounded by the connect timeout
async fn establish(endpoint: &Endpoint, config: &ClientConfig) -> Result<(FramedStream, String)> {
    let timeout = config.connect_timeout();
    let attempt = async {
        let stream = connect_stream(endpoint, config.proxy.as_ref()).await?;
        let mut framed = Framed::new(stream, ClientCodec::new());
        let session_id = handshake(&mut framed, config).await?;
        Ok::<_, TwinError>((framed, session_id))
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(TwinError::ConnectionTimeout {
            seconds: timeout.as_secs().max(1),
        }),
    }
}

async fn connect_stream(
    endpoint: &Endpoint,
    proxy: Option<&ProxyConfig>,
) -> Result<Box<dyn StreamTrait>> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let target = format!("{}:{}", host, port);
            let stream = match proxy {
                Some(proxy) => {
                    let proxy_addr = format!("{}:{}", proxy.host, proxy.port);
                    let mut stream = TcpStream::connect(&proxy_addr).await.map_err(|e| {
                        TwinError::connection(format!(
                            "Failed to connect to proxy {}: {}",
                            proxy_addr, e
                        ))
                    })?;
                    tunnel(&mut stream, &target).await?;
                    tracing::debug!(proxy = %proxy_addr, target = %target, "Proxy tunnel established");
                    stream
                }
                None => TcpStream::connect(&target).await.map_err(|e| {
                    TwinError::connection(format!("Failed to connect to {}: {}", target, e))
                })?,
            };
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Endpoint::Unix(path) => Ok(Box::new(connect_unix(path).await?)),
    }
}

async fn connect_unix(path: &Path) -> Result<UnixStream> {
    if !path.exists() {
        return Err(TwinError::connection(format!(
            "Socket not found: {}",
            path.display()
        )));
    }
    UnixStream::connect(path).await.map_err(|e| {
        TwinError::connection(format!("Failed to connect to {}: {}", path.display(), e))
    })
}

/// Open an HTTP CONNECT tunnel to `target` through an already connected proxy
async fn tunnel<S>(stream: &mut S, target: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Read byte by byte so nothing past the header is consumed
    let mut header = Vec::with_capacity(256);
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_PROXY_RESPONSE {
            return Err(TwinError::connection("Proxy response header too large"));
        }
        let byte = stream.read_u8().await.map_err(|e| {
            TwinError::connection(format!("Proxy closed during CONNECT: {}", e))
        })?;
        header.push(byte);
    }

    let text = String::from_utf8_lossy(&header);
    let status_line = text.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1);
    if !status_line.starts_with("HTTP/1.") || status != Some("200") {
        return Err(TwinError::connection(format!(
            "Proxy refused CONNECT to {}: {}",
            target, status_line
        )));
    }
    Ok(())
}

/// Send `Connect` and wait for the registry's verdict
async fn handshake(framed: &mut FramedStream, config: &ClientConfig) -> Result<String> {
    framed
        .send(ClientFrame::Connect {
            client_id: config.client_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            credentials: config.auth.credentials(),
        })
        .await
        .map_err(|e| TwinError::connection(format!("Failed to send handshake: {}", e)))?;

    match framed.next().await {
        Some(Ok(ServerFrame::Connected {
            session_id,
            protocol_version,
        })) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(TwinError::protocol(format!(
                    "Protocol version mismatch: client {}, registry {}",
                    PROTOCOL_VERSION, protocol_version
                )));
            }
            Ok(session_id)
        }
        Some(Ok(ServerFrame::ConnectRejected { code, reason })) => Err(
            TwinError::AuthenticationFailed(format!("{}: {}", code, reason)),
        ),
        Some(Ok(other)) => Err(TwinError::protocol(format!(
            "Unexpected frame during handshake: {:?}",
            other
        ))),
        Some(Err(e)) => Err(TwinError::protocol(e.to_string())),
        None => Err(TwinError::ConnectionClosed),
    }
}

/// Background task that handles the socket I/O and reconnects on loss
async fn connection_task(
    mut framed: FramedStream,
    mut outgoing: mpsc::UnboundedReceiver<ClientFrame>,
    incoming: mpsc::Sender<TransportEvent>,
    endpoint: Endpoint,
    config: ClientConfig,
) {
    loop {
        let reason = match io_loop(&mut framed, &mut outgoing, &incoming).await {
            LoopExit::Closed => return,
            LoopExit::Lost(reason) => reason,
        };

        tracing::warn!(endpoint = %endpoint, reason = %reason, "Connection to registry lost");
        if incoming.send(TransportEvent::Lost(reason)).await.is_err() {
            return;
        }

        match reconnect(&endpoint, &config, &mut outgoing).await {
            Some(restored) => {
                framed = restored;
                if incoming.send(TransportEvent::Restored).await.is_err() {
                    return;
                }
            }
            None => return,
        }
    }
}

async fn io_loop(
    framed: &mut FramedStream,
    outgoing: &mut mpsc::UnboundedReceiver<ClientFrame>,
    incoming: &mpsc::Sender<TransportEvent>,
) -> LoopExit {
    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    let _ = framed.send(ClientFrame::Disconnect).await;
                    return LoopExit::Closed;
                };
                let disconnect = matches!(msg, ClientFrame::Disconnect);
                if let Err(e) = framed.send(msg).await {
                    if disconnect {
                        return LoopExit::Closed;
                    }
                    return LoopExit::Lost(format!("Failed to send frame: {}", e));
                }
                if disconnect {
                    tracing::debug!("Disconnect sent, closing connection");
                    return LoopExit::Closed;
                }
            }

            result = framed.next() => {
                match result {
                    Some(Ok(frame)) => {
                        if incoming.send(TransportEvent::Frame(frame)).await.is_err() {
                            tracing::debug!("Event channel closed, receiver dropped");
                            return LoopExit::Closed;
                        }
                    }
                    Some(Err(e)) => {
                        return LoopExit::Lost(format!("Failed to receive frame: {}", e));
                    }
                    None => {
                        return LoopExit::Lost("Registry closed connection".into());
                    }
                }
            }
        }
    }
}

/// Retry `establish` with a fixed delay; `None` when giving up or closed
async fn reconnect(
    endpoint: &Endpoint,
    config: &ClientConfig,
    outgoing: &mut mpsc::UnboundedReceiver<ClientFrame>,
) -> Option<FramedStream> {
    let policy = &config.reconnect;

    for attempt in 1..=policy.max_attempts {
        if !wait_or_closed(policy.delay(), outgoing).await {
            return None;
        }

        match establish(endpoint, config).await {
            Ok((framed, session_id)) => {
                tracing::info!(attempt, session = %session_id, "Reconnected to registry");
                return Some(framed);
            }
            Err(e) => {
                tracing::warn!(attempt, max_attempts = policy.max_attempts, error = %e, "Reconnect failed");
            }
        }
    }

    tracing::error!(endpoint = %endpoint, "Giving up on registry connection");
    None
}

/// Sleep for `delay`, dropping frames queued meanwhile; false if the client closed
async fn wait_or_closed(delay: Duration, outgoing: &mut mpsc::UnboundedReceiver<ClientFrame>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            msg = outgoing.recv() => match msg {
                None | Some(ClientFrame::Disconnect) => return false,
                Some(frame) => {
                    tracing::warn!(frame = ?frame, "Dropping frame while disconnected");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use tokio::net::{TcpListener, UnixListener};
    use twinlink_protocol::{ErrorCode, ReplyOutcome, ServerCodec, ThingOperation};

    fn config(endpoint: String) -> ClientConfig {
        ClientConfig::new(
            endpoint,
            "framed_client",
            AuthConfig::Credentials {
                username: "user".into(),
                password: "secret".into(),
            },
        )
        .with_connect_timeout(Duration::from_secs(2))
        .with_reconnect(3, Duration::from_millis(20))
    }

    /// Accept one handshake on a server-side stream
    async fn accept_handshake<S>(stream: S) -> Framed<S, ServerCodec>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, ServerCodec::new());
        match framed.next().await {
            Some(Ok(ClientFrame::Connect { client_id, .. })) => {
                assert_eq!(client_id, "framed_client");
            }
            other => panic!("Expected Connect, got {:?}", other),
        }
        framed
            .send(ServerFrame::Connected {
                session_id: uuid::Uuid::new_v4().to_string(),
                protocol_version: PROTOCOL_VERSION,
            })
            .await
            .unwrap();
        framed
    }

    #[tokio::test]
    async fn test_unix_request_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = accept_handshake(stream).await;
            match framed.next().await {
                Some(Ok(ClientFrame::Request { correlation_id, operation })) => {
                    assert_eq!(operation, ThingOperation::Delete { thing_id: "myThing".into() });
                    framed
                        .send(ServerFrame::Reply {
                            correlation_id,
                            outcome: ReplyOutcome::Success(None),
                        })
                        .await
                        .unwrap();
                }
                other => panic!("Expected Request, got {:?}", other),
            }
            assert_eq!(framed.next().await.unwrap().unwrap(), ClientFrame::Disconnect);
        });

        let endpoint = format!("unix://{}", path.display());
        let mut session = FramedTransport::new().open(&config(endpoint)).await.unwrap();
        let mut events = session.take_events().unwrap();

        session
            .send(ClientFrame::Request {
                correlation_id: 5,
                operation: ThingOperation::Delete { thing_id: "myThing".into() },
            })
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Frame(ServerFrame::Reply {
                correlation_id: 5,
                outcome: ReplyOutcome::Success(None),
            }))
        );

        session.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, ServerCodec::new());
            let _ = framed.next().await;
            framed
                .send(ServerFrame::ConnectRejected {
                    code: ErrorCode::AuthenticationFailed,
                    reason: "unknown user".into(),
                })
                .await
                .unwrap();
        });

        let endpoint = format!("unix://{}", path.display());
        let err = FramedTransport::new().open(&config(endpoint)).await.unwrap_err();
        match err {
            TwinError::AuthenticationFailed(msg) => assert!(msg.contains("unknown user")),
            other => panic!("Expected AuthenticationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = format!("unix://{}", dir.path().join("absent.sock").display());
        let err = FramedTransport::new().open(&config(endpoint)).await.unwrap_err();
        assert!(matches!(err, TwinError::Connection(_)));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_refused() {
        let err = FramedTransport::new()
            .open(&config("wss://events.example.com:443/".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TwinError::Config(_)));
    }

    #[tokio::test]
    async fn test_proxy_with_unix_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let config = config(format!("unix://{}", path.display())).with_proxy("cache.example.com", 3128);
        let err = FramedTransport::new().open(&config).await.unwrap_err();
        assert!(matches!(err, TwinError::Config(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let endpoint = format!("unix://{}", path.display());
        let config = config(endpoint).with_connect_timeout(Duration::from_millis(100));
        let err = FramedTransport::new().open(&config).await.unwrap_err();
        assert!(matches!(err, TwinError::ConnectionTimeout { .. }));
    }

    #[tokio::test]
    async fn test_reconnect_after_loss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let framed = accept_handshake(stream).await;
            drop(framed);

            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = accept_handshake(stream).await;
            framed
                .send(ServerFrame::Reply {
                    correlation_id: 1,
                    outcome: ReplyOutcome::Success(None),
                })
                .await
                .unwrap();
            let _ = framed.next().await;
        });

        let endpoint = format!("unix://{}", path.display());
        let mut session = FramedTransport::new().open(&config(endpoint)).await.unwrap();
        let mut events = session.take_events().unwrap();

        assert!(matches!(events.recv().await, Some(TransportEvent::Lost(_))));
        assert_eq!(events.recv().await, Some(TransportEvent::Restored));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Frame(ServerFrame::Reply { correlation_id: 1, .. }))
        ));

        session.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server_path = path.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let framed = accept_handshake(stream).await;
            drop(listener);
            let _ = std::fs::remove_file(&server_path);
            drop(framed);
        });

        let endpoint = format!("unix://{}", path.display());
        let mut session = FramedTransport::new().open(&config(endpoint)).await.unwrap();
        let mut events = session.take_events().unwrap();

        assert!(matches!(events.recv().await, Some(TransportEvent::Lost(_))));
        // Channel closes once the reconnect budget is spent
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_proxy_tunnel() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = proxy.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = proxy.accept().await.unwrap();

            let mut header = Vec::new();
            while !header.ends_with(b"\r\n\r\n") {
                header.push(stream.read_u8().await.unwrap());
            }
            let header = String::from_utf8(header).unwrap();
            assert!(header.starts_with("CONNECT registry.example.com:7400 HTTP/1.1\r\n"));

            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();

            // Act as the registry behind the tunnel
            let mut framed = accept_handshake(stream).await;
            let _ = framed.next().await;
        });

        let config = config("tcp://registry.example.com:7400".into()).with_proxy("127.0.0.1", port);
        let session = FramedTransport::new().open(&config).await.unwrap();
        assert!(!session.session_id().is_empty());

        session.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_proxy_refusal() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = proxy.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = proxy.accept().await.unwrap();
            let mut header = Vec::new();
            while !header.ends_with(b"\r\n\r\n") {
                header.push(stream.read_u8().await.unwrap());
            }
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let config = config("tcp://registry.example.com:7400".into()).with_proxy("127.0.0.1", port);
        let err = FramedTransport::new().open(&config).await.unwrap_err();
        match err {
            TwinError::Connection(msg) => assert!(msg.contains("407")),
            other => panic!("Expected Connection error, got {:?}", other),
        }
    }
}
