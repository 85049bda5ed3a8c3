//! Plain TCP / TLS connector
//!
//! Opens sockets with keep-alive and `TCP_NODELAY`, optionally wrapped in TLS.
//! Revalidation peeks at the socket without consuming anything and re-dials in
//! place when the peer has gone away, so the connection keeps its identity.

use async_trait::async_trait;
use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::backend::{Connection, Connector};
use super::error::BoxError;
use crate::config::{ConnectionInfo, TlsOptions};

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Byte stream to the backend
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl BackendStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl std::fmt::Debug for BackendStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(stream) => f.debug_tuple("Plain").field(stream).finish(),
            Self::Tls(_) => f.write_str("Tls(..)"),
        }
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Everything needed to dial the backend again
struct Dialer {
    info: ConnectionInfo,
    tls: Option<tokio_native_tls::TlsConnector>,
}

impl Dialer {
    /// Returns the stream plus a duplicate of the raw socket used for peeking
    async fn dial(&self) -> Result<(BackendStream, std::net::TcpStream), BoxError> {
        let addr = self.info.address();
        let stream = tokio::time::timeout(self.info.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| format!("connection to {} timed out", addr))??;

        // Configure TCP keep-alive
        let socket = socket2::Socket::from(stream.into_std()?);
        socket.set_nodelay(true)?;
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL);
        socket.set_tcp_keepalive(&keepalive)?;
        let probe: std::net::TcpStream = socket.try_clone()?.into();
        let stream = TcpStream::from_std(socket.into())?;

        let stream = match &self.tls {
            Some(connector) => {
                let tls = tokio::time::timeout(
                    self.info.connect_timeout,
                    connector.connect(&self.info.host, stream),
                )
                .await
                .map_err(|_| format!("TLS handshake with {} timed out", addr))??;
                BackendStream::Tls(Box::new(tls))
            }
            None => BackendStream::Plain(stream),
        };

        debug!(backend = %addr, tls = stream.is_tls(), "Dialed backend");
        Ok((stream, probe))
    }
}

fn build_tls(options: &TlsOptions) -> Result<Option<tokio_native_tls::TlsConnector>, BoxError> {
    if !options.enabled {
        return Ok(None);
    }

    let mut builder = native_tls::TlsConnector::builder();
    if let Some(path) = &options.ca_cert {
        let pem = std::fs::read(path)
            .map_err(|e| format!("failed to read CA certificate {:?}: {}", path, e))?;
        builder.add_root_certificate(native_tls::Certificate::from_pem(&pem)?);
    }
    if options.accept_invalid_certs {
        warn!("INSECURE TLS MODE ENABLED: Certificate verification is disabled!");
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    Ok(Some(tokio_native_tls::TlsConnector::from(builder.build()?)))
}

/// Opens [`TcpConnection`]s
///
/// The TLS connector is built on first use and reused for as long as the
/// [`TlsOptions`] stay the same.
#[derive(Default)]
pub struct TcpConnector {
    next_id: AtomicU64,
    tls: Mutex<Option<(TlsOptions, Option<tokio_native_tls::TlsConnector>)>>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn tls_for(
        &self,
        options: &TlsOptions,
    ) -> Result<Option<tokio_native_tls::TlsConnector>, BoxError> {
        let mut cached = self.tls.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((built_for, connector)) = cached.as_ref() {
            if built_for == options {
                return Ok(connector.clone());
            }
        }

        let connector = build_tls(options)?;
        *cached = Some((options.clone(), connector.clone()));
        Ok(connector)
    }
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Connection = TcpConnection;

    async fn open(&self, info: &ConnectionInfo) -> Result<TcpConnection, BoxError> {
        let dialer = Arc::new(Dialer {
            info: info.clone(),
            tls: self.tls_for(&info.tls)?,
        });
        let (stream, probe) = dialer.dial().await?;

        Ok(TcpConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            stream,
            probe,
            dialer,
            reconnects: 0,
        })
    }
}

/// A TCP (or TLS) session to the backend
pub struct TcpConnection {
    id: u64,
    stream: BackendStream,
    probe: std::net::TcpStream,
    dialer: Arc<Dialer>,
    reconnects: u32,
}

impl TcpConnection {
    /// Stable identifier, kept across re-dials
    pub fn id(&self) -> u64 {
        self.id
    }

    /// How many times the socket was re-dialed by revalidation
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn stream(&mut self) -> &mut BackendStream {
        &mut self.stream
    }

    /// Non-blocking check that the peer has not closed the socket.
    ///
    /// An idle connection must have nothing to read. Pending bytes mean a
    /// desynced session or, for TLS, a `close_notify` alert ahead of the FIN,
    /// so they count as dead on either transport.
    fn is_alive(&self) -> bool {
        let mut buf = [0u8; 1];
        match self.probe.peek(&mut buf) {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn revalidate(&mut self) -> Result<(), BoxError> {
        if self.is_alive() {
            return Ok(());
        }

        debug!(id = self.id, backend = %self.dialer.info.address(), "Connection dead, re-dialing");
        let (stream, probe) = self.dialer.dial().await?;
        self.stream = stream;
        self.probe = probe;
        self.reconnects += 1;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(id = self.id, error = %e, "Error shutting down connection");
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("backend", &self.dialer.info.address())
            .field("tls", &self.stream.is_tls())
            .field("reconnects", &self.reconnects)
            .finish()
    }
}
