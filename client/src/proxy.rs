//! Proxy phase: service the HTTP fetches the SCI server issues.
//!
//! Each iteration reads one server command. HTTP commands are checked
//! against the security policy, forwarded to the target web server
//! under a shared wall-clock deadline, and their responses relayed
//! back. Policy violations and upstream failures answer with a control
//! line and keep the loop alive; only server-side errors are fatal.

use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

use sci_shared::auth;
use sci_shared::headers::{content_length, write_headers};
use sci_shared::protocol::{
    ControlLine, Method, RequestLine, ServerCommand, CONNECT_TIMEOUT, CRLF, WEB_TIMEOUT,
};
use sci_shared::{Error, Result};

use crate::config::ClientConfig;
use crate::net::{tls_handshake, LineStream, MaybeTlsStream};
use crate::result::{self, SessionResult};
use crate::session::Session;

/// Scheme of a proxied target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

/// Resolved, policy-checked target of one forwarded request.
#[derive(Debug)]
struct WebTarget {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
}

/// Drive the proxy loop until the server completes or fails the
/// session.
pub(crate) async fn run(mut session: Session) -> Result<SessionResult> {
    loop {
        let line = match session.stream.read_line().await? {
            Some(line) if !line.is_empty() => line,
            _ => {
                return Err(Error::Protocol(
                    "Error reading from SCI server during proxy phase".to_string(),
                ))
            }
        };
        match ServerCommand::parse(&line)? {
            ServerCommand::Noop => continue,
            ServerCommand::Complete { url } => return result::complete(session, url).await,
            ServerCommand::Error { message } => return Err(Error::Remote(message)),
            ServerCommand::Request(request) => forward_request(&mut session, request).await?,
        }
    }
}

/// Service one HTTP command. The request's header block and declared
/// body are consumed before any policy decision.
async fn forward_request(session: &mut Session, request: RequestLine) -> Result<()> {
    let headers = match session.stream.read_headers().await? {
        Some(headers) => headers,
        None => {
            return Err(Error::Protocol(
                "SCI server disconnected while sending HTTP headers".to_string(),
            ))
        }
    };
    let body = match content_length(&headers) {
        Some(length) => Some(session.stream.read_exact_body(length).await.map_err(|_| {
            Error::Protocol("SCI server disconnected while sending HTTP body".to_string())
        })?),
        None => None,
    };

    let target = match authorize(&request, &session.config, &session.host_names) {
        Ok(target) => target,
        Err(rejection) => {
            warn!(
                "Rejected {} {}: {}",
                request.method.as_str(),
                request.target,
                rejection.text()
            );
            return send_control(session, &rejection).await;
        }
    };
    let mut web = match connect_web(session, &target).await {
        Ok(web) => web,
        Err(failure) => {
            warn!(
                "Connect to {}:{} failed: {}",
                target.host,
                target.port,
                failure.text()
            );
            return send_control(session, &failure).await;
        }
    };
    match relay(session, &request, &target, &headers, body.as_deref(), &mut web).await? {
        Some(control) => send_control(session, &control).await,
        None => Ok(()),
    }
}

/// Answer the server with a control line and stay in the loop.
async fn send_control(session: &mut Session, control: &ControlLine) -> Result<()> {
    session.stream.send_all(control.to_wire().as_bytes()).await
}

/// Apply the security policy. The target server is never contacted
/// when any check fails.
fn authorize(
    request: &RequestLine,
    config: &ClientConfig,
    host_names: &[String],
) -> std::result::Result<WebTarget, ControlLine> {
    if request.method == Method::Post && !config.post_allowed {
        return Err(ControlLine::PostDisallowed);
    }
    let url = match Url::parse(&request.target) {
        Ok(url) => url,
        Err(_) => return Err(ControlLine::SchemeNotAllowed(String::new())),
    };
    let scheme = match url.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => return Err(ControlLine::SchemeNotAllowed(other.to_string())),
    };
    let host = match url.host_str() {
        Some(host) => host.to_string(),
        None => return Err(ControlLine::HostDenied(String::new())),
    };
    if !host_names
        .iter()
        .any(|name| name.eq_ignore_ascii_case(&host))
    {
        return Err(ControlLine::HostDenied(host));
    }
    let port = url.port().unwrap_or(match scheme {
        Scheme::Https => 443,
        Scheme::Http => 80,
    });
    if matches!(port, 0 | 19 | 25) {
        return Err(ControlLine::PortDenied(port));
    }
    Ok(WebTarget {
        scheme,
        host,
        port,
        path: url.path().to_string(),
        query: url.query().map(|q| q.to_string()),
    })
}

/// Open the target connection within the connect budget, mapping
/// failures to their control lines.
async fn connect_web(
    session: &Session,
    target: &WebTarget,
) -> std::result::Result<LineStream<MaybeTlsStream>, ControlLine> {
    match timeout(CONNECT_TIMEOUT, open_target(&session.connector, target)).await {
        Ok(Ok(stream)) => {
            let mut web = LineStream::new(stream);
            if let Some(trace) = &session.trace {
                web.set_trace(trace.clone());
            }
            Ok(web)
        }
        Ok(Err(control)) => Err(control),
        Err(_) => Err(ControlLine::WebTimeout),
    }
}

/// Resolve and connect to the target, wrapping in TLS for https.
async fn open_target(
    connector: &TlsConnector,
    target: &WebTarget,
) -> std::result::Result<MaybeTlsStream, ControlLine> {
    let address = format!("{}:{}", target.host, target.port);
    let mut addrs = match lookup_host(address.as_str()).await {
        Ok(addrs) => addrs,
        Err(_) => return Err(ControlLine::UnknownHostname),
    };
    let addr = match addrs.next() {
        Some(addr) => addr,
        None => return Err(ControlLine::UnknownHostname),
    };
    let tcp = match TcpStream::connect(addr).await {
        Ok(tcp) => tcp,
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(ControlLine::ConnectionRefused)
        }
        Err(e) => return Err(ControlLine::Exception(e.to_string())),
    };
    match target.scheme {
        Scheme::Https => match tls_handshake(connector, &target.host, tcp).await {
            Ok(tls) => Ok(MaybeTlsStream::Tls(Box::new(tls))),
            Err(e) => Err(ControlLine::Exception(e.to_string())),
        },
        Scheme::Http => Ok(MaybeTlsStream::Plain(tcp)),
    }
}

/// Forward one request and relay the response. `Ok(Some(_))` carries a
/// non-fatal control line for the server.
async fn relay(
    session: &mut Session,
    request: &RequestLine,
    target: &WebTarget,
    headers: &[String],
    body: Option<&[u8]>,
    web: &mut LineStream<MaybeTlsStream>,
) -> Result<Option<ControlLine>> {
    let start = Instant::now();
    let deadline = start + WEB_TIMEOUT;

    let head = request_head(request, target, headers, &session.config);
    match timeout_at(deadline, web.send_all(head.as_bytes())).await {
        Ok(result) => result?,
        Err(_) => return Ok(Some(ControlLine::WebTimeout)),
    }
    if let Some(body) = body {
        match timeout_at(deadline, web.send_all(body)).await {
            Ok(result) => result?,
            Err(_) => return Ok(Some(ControlLine::WebTimeout)),
        }
    }

    let status = match timeout_at(deadline, web.read_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) | Ok(Err(_)) => {
            return Ok(Some(ControlLine::BadStatus(String::new())))
        }
        Err(_) => return Ok(Some(ControlLine::WebTimeout)),
    };
    let status_ms = start.elapsed().as_millis();
    if !status.starts_with("HTTP") {
        return Ok(Some(ControlLine::BadStatus(status)));
    }

    let response_headers = match timeout_at(deadline, web.read_headers()).await {
        Ok(Ok(Some(headers))) => headers,
        Ok(Ok(None)) | Ok(Err(_)) => return Ok(Some(ControlLine::NoEndOfHeaders)),
        Err(_) => return Ok(Some(ControlLine::WebTimeout)),
    };

    let mut body_bytes: Vec<u8> = Vec::new();
    loop {
        match timeout_at(deadline, web.read_some()).await {
            Ok(Ok(chunk)) => {
                if chunk.is_empty() {
                    break;
                }
                body_bytes.extend_from_slice(&chunk);
            }
            Ok(Err(_)) => break,
            Err(_) => return Ok(Some(ControlLine::WebTimeout)),
        }
    }
    // The deadline applies even when the body completed at end of
    // stream.
    if Instant::now() >= deadline {
        return Ok(Some(ControlLine::WebTimeout));
    }
    let total_ms = start.elapsed().as_millis();

    let head = response_head(&status, &response_headers, body_bytes.len(), status_ms, total_ms);
    session.stream.send_all(head.as_bytes()).await?;
    session.stream.send_all(&body_bytes).await?;
    debug!(
        "Relayed {} {} ({} bytes in {} ms)",
        request.method.as_str(),
        request.target,
        body_bytes.len(),
        total_ms
    );
    Ok(None)
}

/// Build the outbound request head: request line, original headers,
/// the control header, any extra headers, terminator.
fn request_head(
    request: &RequestLine,
    target: &WebTarget,
    headers: &[String],
    config: &ClientConfig,
) -> String {
    // A configured extra query replaces the URL's own query string.
    let query = match (&config.extra_query, &target.query) {
        (Some(extra), _) => format!("?{}", extra),
        (None, Some(query)) => format!("?{}", query),
        (None, None) => String::new(),
    };
    let mut head = format!(
        "{} {}{} {}{}",
        request.method.as_str(),
        target.path,
        query,
        request.version,
        CRLF
    );
    head.push_str(&write_headers(headers, &[]));
    head.push_str(&format!(
        "X-SCI-CONTROL: {} content-only{}",
        auth::key_id(&config.licence_key),
        CRLF
    ));
    for header in &config.extra_headers {
        head.push_str(header);
        head.push_str(CRLF);
    }
    head.push_str(CRLF);
    head
}

/// Rebuild the response head for the SCI server: original status line,
/// headers less any Content-Length, an accurate Content-Length, and
/// the timing headers.
fn response_head(
    status: &str,
    headers: &[String],
    body_len: usize,
    status_ms: u128,
    total_ms: u128,
) -> String {
    let mut head = format!("{}{}", status, CRLF);
    head.push_str(&write_headers(headers, &["Content-Length"]));
    head.push_str(&format!("Content-Length: {}{}", body_len, CRLF));
    head.push_str(&format!("X-SCI-Response: {}{}", status_ms, CRLF));
    head.push_str(&format!("X-SCI-TotalTime: {}{}", total_ms, CRLF));
    head.push_str(CRLF);
    head
}
