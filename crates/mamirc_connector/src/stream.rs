//! Client-side TCP/TLS stream for outbound IRC connections.

use lazy_static::lazy_static;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;

/// A plain or TLS-wrapped connection to an IRC server. The variants are boxed: the TLS one is far
/// larger than the plain one, and the enum would otherwise carry that weight everywhere.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(Box<TcpStream>),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    /// Connect to `addr`. When `tls_host` is set, a TLS handshake for that server name follows
    /// the TCP connect.
    pub(crate) async fn connect(addr: SocketAddr, tls_host: Option<&str>) -> io::Result<Stream> {
        let tcp = TcpStream::connect(addr).await?;
        match tls_host {
            None => Ok(Stream::Tcp(Box::new(tcp))),
            Some(host) => {
                let name = rustls::ServerName::try_from(host)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
                let tls = TLS_CONNECTOR.connect(name, tcp).await?;
                Ok(Stream::Tls(Box::new(tls)))
            }
        }
    }
}

lazy_static! {
    static ref TLS_CONNECTOR: tokio_rustls::TlsConnector = build_tls_connector();
}

fn build_tls_connector() -> tokio_rustls::TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = roots.add(&rustls::Certificate(cert.0));
            }
        }
        Err(err) => {
            warn!("Could not load native root certificates: {}", err);
        }
    }
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

// The I/O traits just forward every poll to whichever stream is inside.
macro_rules! delegate {
    ($inner:expr, $method:ident ( $($arg:expr),* )) => {
        match $inner {
            Stream::Tcp(stream) => Pin::new(stream.as_mut()).$method($($arg),*),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).$method($($arg),*),
        }
    };
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<io::Result<()>> {
        delegate!(self.get_mut(), poll_read(cx, buf))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        delegate!(self.get_mut(), poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        delegate!(self.get_mut(), poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        delegate!(self.get_mut(), poll_shutdown(cx))
    }
}
