//! Socket plumbing for SCI sessions.
//!
//! TCP and TLS connection helpers plus `LineStream`, a buffered
//! line-oriented channel with per-read timeouts. The same stream type
//! carries the SCI server link and the proxied web connections.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use sci_shared::headers::HeaderFolder;
use sci_shared::protocol::{BUFFER_SIZE, CONNECT_TIMEOUT, MAX_LINE};
use sci_shared::{Error, Result};

use crate::trace::TraceLog;

/// TLS connector trusting the bundled webpki roots.
pub fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Complete a client TLS handshake over an established TCP stream.
pub async fn tls_handshake(
    connector: &TlsConnector,
    host: &str,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>> {
    let name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| Error::Connection(format!("Invalid server name '{}': {}", host, e)))?;
    connector
        .connect(name, tcp)
        .await
        .map_err(|e| Error::Connection(format!("TLS handshake with {} failed: {}", host, e)))
}

/// Open a TCP connection within the connect budget.
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Connection(format!(
            "Error connecting to {}:{}: {}",
            host, port, e
        ))),
        Err(_) => Err(Error::Connection(format!(
            "Error connecting to {}:{}: connection timed out",
            host, port
        ))),
    }
}

/// A connection that is either plain TCP or TLS over TCP.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, data),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Buffered line-oriented channel over an async stream.
pub struct LineStream<S> {
    io: BufReader<S>,
    read_timeout: Option<Duration>,
    trace: Option<TraceLog>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            io: BufReader::new(stream),
            read_timeout: None,
            trace: None,
        }
    }

    /// Bound every subsequent read operation.
    pub fn set_read_timeout(&mut self, limit: Duration) {
        self.read_timeout = Some(limit);
    }

    /// Record lines and sends into a shared trace.
    pub fn set_trace(&mut self, trace: TraceLog) {
        self.trace = Some(trace);
    }

    /// Read one CRLF-terminated line. `None` means the stream ended
    /// cleanly at a line boundary.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let line = bounded(self.read_timeout, read_line_raw(&mut self.io)).await?;
        if let Some(line) = &line {
            if let Some(trace) = &self.trace {
                trace.recv(line).await;
            }
            debug!("recv: {}", line);
        }
        Ok(line)
    }

    /// Read a header block up to its blank-line terminator, folding
    /// continuation lines. `None` means the stream ended before the
    /// terminator arrived.
    pub async fn read_headers(&mut self) -> Result<Option<Vec<String>>> {
        let mut folder = HeaderFolder::new();
        loop {
            match self.read_line().await? {
                Some(line) if line.is_empty() => return Ok(Some(folder.finish())),
                Some(line) => folder.feed(&line),
                None => return Ok(None),
            }
        }
    }

    /// Read exactly `n` body bytes.
    pub async fn read_exact_body(&mut self, n: usize) -> Result<Vec<u8>> {
        bounded(self.read_timeout, read_exact_raw(&mut self.io, n)).await
    }

    /// Read whatever body bytes are available, at most one chunk. An
    /// empty result means end of stream.
    pub async fn read_some(&mut self) -> Result<Vec<u8>> {
        bounded(self.read_timeout, async {
            let mut chunk = vec![0u8; BUFFER_SIZE];
            let n = self.io.read(&mut chunk).await?;
            chunk.truncate(n);
            Ok(chunk)
        })
        .await
    }

    /// Write and flush the full buffer.
    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        if let Some(trace) = &self.trace {
            trace.send(data).await;
        }
        self.io.write_all(data).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// Run an I/O future under an optional time limit.
async fn bounded<T, F>(limit: Option<Duration>, op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => match timeout(limit, op).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        },
        None => op.await,
    }
}

/// Read one CRLF-terminated line byte by byte.
///
/// Also used directly on an unbuffered stream where read-ahead is not
/// safe, notably the HTTP proxy response that precedes a TLS
/// handshake. Lines are capped at MAX_LINE bytes with the remainder
/// left in the stream. A stream ending mid-line yields the partial
/// line; end of stream at a line boundary yields `None`.
pub(crate) async fn read_line_raw<R>(io: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = io.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }
        if byte[0] == b'\n' && line.last() == Some(&b'\r') {
            line.pop();
            break;
        }
        line.push(byte[0]);
        if line.len() >= MAX_LINE {
            break;
        }
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Read exactly `n` bytes in chunks.
async fn read_exact_raw<R>(io: &mut R, n: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let want = std::cmp::min(n - filled, BUFFER_SIZE);
        let read = io.read(&mut body[filled..filled + want]).await?;
        if read == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += read;
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_line_crlf() {
        let (local, mut remote) = duplex(4096);
        remote.write_all(b"hello\r\nworld\r\n").await.unwrap();
        let mut stream = LineStream::new(local);
        assert_eq!(stream.read_line().await.unwrap().unwrap(), "hello");
        assert_eq!(stream.read_line().await.unwrap().unwrap(), "world");
    }

    #[tokio::test]
    async fn test_read_line_requires_carriage_return() {
        let (local, mut remote) = duplex(4096);
        remote.write_all(b"a\nb\r\n").await.unwrap();
        let mut stream = LineStream::new(local);
        assert_eq!(stream.read_line().await.unwrap().unwrap(), "a\nb");
    }

    #[tokio::test]
    async fn test_read_line_clean_eof() {
        let (local, remote) = duplex(4096);
        drop(remote);
        let mut stream = LineStream::new(local);
        assert!(stream.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line_partial_at_eof() {
        let (local, mut remote) = duplex(4096);
        remote.write_all(b"partial").await.unwrap();
        drop(remote);
        let mut stream = LineStream::new(local);
        assert_eq!(stream.read_line().await.unwrap().unwrap(), "partial");
        assert!(stream.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line_caps_at_max_line() {
        let (local, mut remote) = duplex(4096);
        let mut long = vec![b'x'; MAX_LINE + 6];
        long.extend_from_slice(b"\r\n");
        remote.write_all(&long).await.unwrap();
        let mut stream = LineStream::new(local);
        let first = stream.read_line().await.unwrap().unwrap();
        assert_eq!(first.len(), MAX_LINE);
        let rest = stream.read_line().await.unwrap().unwrap();
        assert_eq!(rest, "xxxxxx");
    }

    #[tokio::test]
    async fn test_read_line_timeout() {
        let (local, _remote) = duplex(4096);
        let mut stream = LineStream::new(local);
        stream.set_read_timeout(Duration::from_millis(50));
        assert!(matches!(stream.read_line().await, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_read_headers_folds_and_terminates() {
        let (local, mut remote) = duplex(4096);
        remote
            .write_all(b"A: 1\r\n continued\r\nB: 2\r\n\r\nGET / HTTP/1.1\r\n")
            .await
            .unwrap();
        let mut stream = LineStream::new(local);
        let headers = stream.read_headers().await.unwrap().unwrap();
        assert_eq!(headers, ["A: 1 continued", "B: 2"]);
        // The terminator is consumed, the next line is untouched.
        assert_eq!(stream.read_line().await.unwrap().unwrap(), "GET / HTTP/1.1");
    }

    #[tokio::test]
    async fn test_read_headers_eof_without_terminator() {
        let (local, mut remote) = duplex(4096);
        remote.write_all(b"A: 1\r\nB: 2\r\n").await.unwrap();
        drop(remote);
        let mut stream = LineStream::new(local);
        assert!(stream.read_headers().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_exact_body() {
        let (local, mut remote) = duplex(4096);
        remote.write_all(b"hello world").await.unwrap();
        let mut stream = LineStream::new(local);
        assert_eq!(stream.read_exact_body(5).await.unwrap(), b"hello");
        assert_eq!(stream.read_exact_body(6).await.unwrap(), b" world");
    }

    #[tokio::test]
    async fn test_read_exact_body_eof_short() {
        let (local, mut remote) = duplex(4096);
        remote.write_all(b"abc").await.unwrap();
        drop(remote);
        let mut stream = LineStream::new(local);
        assert!(stream.read_exact_body(10).await.is_err());
    }

    #[tokio::test]
    async fn test_read_some_drains_in_chunks() {
        let (local, mut remote) = duplex(4096);
        remote.write_all(&vec![b'z'; BUFFER_SIZE + 3]).await.unwrap();
        drop(remote);
        let mut stream = LineStream::new(local);
        assert_eq!(stream.read_some().await.unwrap().len(), BUFFER_SIZE);
        assert_eq!(stream.read_some().await.unwrap(), b"zzz");
        assert!(stream.read_some().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_all_writes_through() {
        let (local, mut remote) = duplex(4096);
        let mut stream = LineStream::new(local);
        stream.send_all(b"ping\r\n").await.unwrap();
        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\r\n");
    }

    #[tokio::test]
    async fn test_trace_records_lines_and_sends() {
        let (local, mut remote) = duplex(4096);
        remote.write_all(b"greeting\r\n").await.unwrap();
        let trace = TraceLog::new();
        let mut stream = LineStream::new(local);
        stream.set_trace(trace.clone());
        stream.read_line().await.unwrap();
        stream.send_all(b"reply\r\n").await.unwrap();
        let entries = trace.take().await;
        assert_eq!(entries, ["recv: greeting", "send: reply"]);
    }
}
