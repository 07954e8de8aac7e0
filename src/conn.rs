//! Stream plumbing shared by the serve loop and the pool.

use std::io;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// Type alias for a boxed client-side stream. Boxing keeps the serve loop
/// monomorphic whether or not the diagnostic tee is wrapped around the
/// socket.
pub type ClientConn = Pin<Box<dyn AsyncReadWrite + Send>>;

/// Enable TCP keep-alive with the given probe period.
///
/// MongoDB's diagnostics FAQ recommends a 2-minute period; the serve loop
/// applies it to every admitted client socket.
pub fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(period))?;
    sock.set_keepalive(true)
}

static TEE_ENABLED: OnceLock<bool> = OnceLock::new();

/// Whether the `PORTERO_TEE=1` diagnostic tee is active. Read once.
pub fn tee_enabled() -> bool {
    *TEE_ENABLED.get_or_init(|| std::env::var("PORTERO_TEE").as_deref() == Ok("1"))
}

/// Wrap `conn` with the byte tee when `PORTERO_TEE=1`, otherwise box it
/// unchanged. The toggle is resolved at construction so the hot path pays
/// a single indirect call either way.
pub fn tee_if<T: AsyncReadWrite + 'static>(context: String, conn: T) -> ClientConn {
    if tee_enabled() {
        Box::pin(TeeConn::new(context, conn))
    } else {
        Box::pin(conn)
    }
}

/// A connection wrapper that prints every transferred byte to stdout with
/// a context tag. Development aid only; throughput suffers when enabled.
pub struct TeeConn<T> {
    context: String,
    inner: T,
}

impl<T> TeeConn<T> {
    pub fn new(context: String, inner: T) -> Self {
        Self { context, inner }
    }
}

fn dump(direction: &str, context: &str, data: &[u8]) {
    println!(
        "{} {}: {} {:?}",
        direction,
        context,
        String::from_utf8_lossy(data),
        data
    );
}

impl<T: AsyncRead + Unpin> AsyncRead for TeeConn<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let filled = buf.filled();
            if filled.len() > before {
                dump("READ", &self.context, &filled[before..]);
            }
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TeeConn<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                dump("WRIT", &self.context, &buf[..*n]);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tee_conn_passes_bytes_through() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut teed = TeeConn::new("test".to_string(), client);

        teed.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.write_all(b"world").await.unwrap();
        teed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_keepalive_on_live_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();

        set_keepalive(&client, Duration::from_secs(120)).unwrap();
    }
}
