//! Session lifecycle: connect, authenticate, submit, then hand the
//! link to the proxy loop.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use sci_shared::auth;
use sci_shared::protocol::{CONNECT_TIMEOUT, CRLF, READ_TIMEOUT};
use sci_shared::{Error, Result};

use crate::config::ClientConfig;
use crate::net::{
    connect_tcp, read_line_raw, tls_connector, tls_handshake, LineStream, MaybeTlsStream,
};
use crate::proxy;
use crate::request::TestRequest;
use crate::result::SessionResult;
use crate::trace::TraceLog;

/// Client for running tests through an SCI server.
pub struct SciClient {
    config: ClientConfig,
}

/// Live state of one authenticated session.
pub(crate) struct Session {
    pub(crate) config: ClientConfig,
    pub(crate) stream: LineStream<MaybeTlsStream>,
    pub(crate) host_names: Vec<String>,
    pub(crate) connector: TlsConnector,
    pub(crate) trace: Option<TraceLog>,
}

impl SciClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Run one test session to completion.
    pub async fn perform_test(&self, mut request: TestRequest) -> Result<SessionResult> {
        request.merge_url_host()?;
        let connector = tls_connector();
        let trace = if self.config.debug {
            Some(TraceLog::new())
        } else {
            None
        };
        let mut stream = self.establish_connection(&connector, trace.clone()).await?;
        authenticate(&mut stream, &self.config).await?;
        submit_request(&mut stream, &request, &self.config).await?;
        info!("Test accepted for {}", request.url);
        let session = Session {
            config: self.config.clone(),
            stream,
            host_names: request.host_names.clone(),
            connector,
            trace,
        };
        proxy::run(session).await
    }

    /// Open the server link, tunneling and upgrading to TLS as
    /// configured.
    async fn establish_connection(
        &self,
        connector: &TlsConnector,
        trace: Option<TraceLog>,
    ) -> Result<LineStream<MaybeTlsStream>> {
        let host = &self.config.server_hostname;
        let port = self.config.effective_port();
        let tcp = match &self.config.proxy {
            Some(proxy) => {
                let mut tcp = connect_tcp(&proxy.hostname, proxy.port).await?;
                connect_tunnel(&mut tcp, host, port, &trace).await?;
                tcp
            }
            None => connect_tcp(host, port).await?,
        };
        let link = if self.config.server_secure {
            MaybeTlsStream::Tls(Box::new(tls_handshake(connector, host, tcp).await?))
        } else {
            MaybeTlsStream::Plain(tcp)
        };
        info!("Connected to {}:{}", host, port);
        let mut stream = LineStream::new(link);
        stream.set_read_timeout(READ_TIMEOUT);
        if let Some(trace) = trace {
            stream.set_trace(trace);
        }
        Ok(stream)
    }
}

/// Tunnel through an HTTP proxy with a CONNECT request.
///
/// Reads stay unbuffered so a TLS handshake that follows sees every
/// byte after the proxy's header block.
async fn connect_tunnel(
    tcp: &mut TcpStream,
    host: &str,
    port: u16,
    trace: &Option<TraceLog>,
) -> Result<()> {
    let request = format!("CONNECT {}:{} HTTP/1.0{}{}", host, port, CRLF, CRLF);
    if let Some(trace) = trace {
        trace.send(request.as_bytes()).await;
    }
    tcp.write_all(request.as_bytes()).await?;
    let status = match tunnel_line(tcp).await? {
        Some(line) => line,
        None => {
            return Err(Error::Proxy(
                "HTTP proxy dropped connection after request".to_string(),
            ))
        }
    };
    if let Some(trace) = trace {
        trace.recv(&status).await;
    }
    debug!("recv: {}", status);
    if !status.starts_with("HTTP/1.") {
        return Err(Error::Proxy(format!(
            "Unknown status line from HTTP proxy: {}",
            status
        )));
    }
    if status.split(' ').nth(1) != Some("200") {
        return Err(Error::Proxy(format!(
            "HTTP proxy server returned error: {}",
            status
        )));
    }
    loop {
        match tunnel_line(tcp).await? {
            Some(line) if line.is_empty() => return Ok(()),
            Some(_) => continue,
            None => {
                return Err(Error::Proxy(
                    "HTTP proxy dropped connection during response headers".to_string(),
                ))
            }
        }
    }
}

/// One line of the proxy response, under the connect budget.
async fn tunnel_line(tcp: &mut TcpStream) -> Result<Option<String>> {
    match timeout(CONNECT_TIMEOUT, read_line_raw(tcp)).await {
        Ok(line) => line,
        Err(_) => Err(Error::Proxy(
            "Timed out reading from HTTP proxy".to_string(),
        )),
    }
}

/// Read the greeting and answer the challenge.
async fn authenticate(
    stream: &mut LineStream<MaybeTlsStream>,
    config: &ClientConfig,
) -> Result<()> {
    let greeting = match stream.read_line().await? {
        Some(line) if !line.is_empty() => line,
        _ => {
            return Err(Error::Protocol(
                "Error reading SCI greeting line".to_string(),
            ))
        }
    };
    let challenge = auth::parse_greeting(&greeting)?;
    let response = auth::auth_response(&config.licence_key, challenge)?;
    stream
        .send_all(format!("{}{}", response, CRLF).as_bytes())
        .await?;
    let ack = match stream.read_line().await? {
        Some(line) if !line.is_empty() => line,
        _ => {
            return Err(Error::Protocol(
                "Error reading from SCI server after authentication sent".to_string(),
            ))
        }
    };
    if ack != "OK" {
        return Err(Error::Authentication(ack));
    }
    debug!("Authenticated as {}", auth::key_id(&config.licence_key));
    Ok(())
}

/// Send the length-prefixed test request and wait for acceptance.
async fn submit_request(
    stream: &mut LineStream<MaybeTlsStream>,
    request: &TestRequest,
    config: &ClientConfig,
) -> Result<()> {
    let json = request.wire_json(config)?;
    let payload = format!("{}{}{}{}", json.len(), CRLF, json, CRLF);
    stream.send_all(payload.as_bytes()).await?;
    let ack = match stream.read_line().await? {
        Some(line) if !line.is_empty() => line,
        _ => {
            return Err(Error::Protocol(
                "Error reading from SCI server after request data sent".to_string(),
            ))
        }
    };
    if ack != "OK" {
        return Err(Error::Request(ack));
    }
    Ok(())
}
