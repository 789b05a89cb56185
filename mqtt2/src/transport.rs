//! Transport layer for the broker connection.
//!
//! A [`Transport`] is one duplex byte stream (plain TCP, or TLS with the
//! `tls` feature). After the connection is established it is split into a
//! [`TransportReader`] that yields decoded packets and a [`TransportWriter`]
//! that writes whole frames.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, Packet};

/// A duplex stream to the broker.
pub enum Transport {
    /// Plain TCP stream.
    Tcp(TcpStream),
    /// TLS stream.
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Open a stream to the broker named by `config`.
    ///
    /// Fails with [`Error::Connection`] if the stream cannot be established
    /// within `config.connect_timeout`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let addr = config.addr();
        debug!("Opening stream to {}", addr);

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                Error::Connection(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            })?
            .map_err(Error::Connection)?;

        stream.set_nodelay(true).map_err(Error::Connection)?;

        if config.tls {
            return Self::connect_tls(config, stream).await;
        }
        Ok(Transport::Tcp(stream))
    }

    #[cfg(feature = "tls")]
    async fn connect_tls(config: &ClientConfig, stream: TcpStream) -> Result<Self> {
        let tls = tls::TlsConfig::new();
        let stream = tokio::time::timeout(config.connect_timeout, tls.connect(stream, &config.host))
            .await
            .map_err(|_| {
                Error::Connection(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))
            })?
            .map_err(Error::Connection)?;
        Ok(Transport::Tls(Box::new(stream)))
    }

    #[cfg(not(feature = "tls"))]
    async fn connect_tls(_config: &ClientConfig, _stream: TcpStream) -> Result<Self> {
        Err(Error::InvalidConfig(
            "TLS requested but the tls feature is disabled".into(),
        ))
    }

    /// Split into independent read and write halves.
    pub fn split(self, max_packet_size: usize) -> (TransportReader, TransportWriter) {
        let (reader, writer) = tokio::io::split(self);
        (
            TransportReader {
                inner: reader,
                buf: BytesMut::with_capacity(4096),
                max_packet_size,
            },
            TransportWriter {
                inner: writer,
                buf: BytesMut::new(),
            },
        )
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Read half: turns the byte stream into packets.
pub struct TransportReader {
    inner: ReadHalf<Transport>,
    buf: BytesMut,
    max_packet_size: usize,
}

impl TransportReader {
    /// Read the next packet, buffering partial frames.
    ///
    /// Returns [`Error::ConnectionClosed`] when the broker closes the stream.
    pub async fn next_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = protocol::decode(&mut self.buf, self.max_packet_size)? {
                trace!("Received {:?}", packet.packet_type());
                return Ok(packet);
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

/// Write half: writes one whole frame per call.
pub struct TransportWriter {
    inner: WriteHalf<Transport>,
    buf: BytesMut,
}

impl TransportWriter {
    /// Write an encoded frame and flush it.
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encode and write a packet.
    pub async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        self.buf.clear();
        packet.encode(&mut self.buf)?;
        trace!("Sending {:?} ({} bytes)", packet.packet_type(), self.buf.len());
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut the stream down. Errors are ignored.
    pub async fn close(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            trace!("Shutdown error ignored: {}", e);
        }
    }
}

#[cfg(feature = "tls")]
pub mod tls {
    //! TLS configuration.

    use std::io;
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    /// TLS configuration for client connections.
    #[derive(Clone)]
    pub struct TlsConfig {
        /// The TLS connector.
        pub connector: TlsConnector,
    }

    impl TlsConfig {
        /// Create a TLS config trusting the webpki roots.
        pub fn new() -> Self {
            let root_store = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };

            let config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            Self {
                connector: TlsConnector::from(Arc::new(config)),
            }
        }

        /// Connect to a TLS server.
        pub async fn connect(
            &self,
            stream: TcpStream,
            domain: &str,
        ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
            use tokio_rustls::rustls::pki_types::ServerName;

            let domain = ServerName::try_from(domain.to_string())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid domain name"))?;

            self.connector.connect(domain, stream).await
        }
    }

    impl Default for TlsConfig {
        fn default() -> Self {
            Self::new()
        }
    }
}
