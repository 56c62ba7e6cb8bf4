//! Wire types for the SCI testing protocol.
//!
//! The protocol is line oriented: CRLF-terminated command and control
//! lines on the server link, standard HTTP header blocks around the
//! requests being proxied.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::headers::decimal_prefix;

/// Default SCI server hostname
pub const DEFAULT_SERVER: &str = "sci.sitemorse.com";

/// Default port for plain-TCP sessions
pub const DEFAULT_PORT: u16 = 5371;

/// Default port for TLS sessions
pub const DEFAULT_TLS_PORT: u16 = 5372;

/// Client version string
pub const CLIENT_VERSION: &str = "1.0.0";

/// Budget for every TCP connect, TLS handshake included
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Idle read budget on the SCI server link
pub const READ_TIMEOUT: Duration = Duration::from_secs(240);

/// Wall-clock budget shared by all steps of one forwarded request
pub const WEB_TIMEOUT: Duration = Duration::from_secs(6);

/// Chunk size for body reads
pub const BUFFER_SIZE: usize = 512;

/// Maximum length of a single protocol line
pub const MAX_LINE: usize = 1024;

/// Line terminator
pub const CRLF: &str = "\r\n";

/// HTTP methods the SCI server may ask us to forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// Request line of an HTTP command from the SCI server
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    /// Absolute target URL, uninterpreted at this stage
    pub target: String,
    /// HTTP version token, echoed verbatim when forwarding
    pub version: String,
}

/// A command line read from the SCI server during the proxy phase
#[derive(Debug, Clone)]
pub enum ServerCommand {
    /// Keep-alive, ignored
    Noop,
    /// Terminal success, carries the tested URL
    Complete { url: String },
    /// Terminal failure raised by the server
    Error { message: String },
    /// HTTP request to forward to a web server
    Request(RequestLine),
}

impl ServerCommand {
    /// Parse one command line. Anything unrecognized is a protocol
    /// violation, as is a request line with a malformed version token.
    pub fn parse(line: &str) -> Result<Self> {
        if line == "XSCI-NOOP" {
            return Ok(ServerCommand::Noop);
        }
        if let Some(url) = line.strip_prefix("XSCI-COMPLETE ") {
            return Ok(ServerCommand::Complete {
                url: url.to_string(),
            });
        }
        if let Some(message) = line.strip_prefix("XSCI-ERROR ") {
            return Ok(ServerCommand::Error {
                message: message.to_string(),
            });
        }
        let method = if line.starts_with("GET ") {
            Method::Get
        } else if line.starts_with("POST ") {
            Method::Post
        } else {
            return Err(Error::Protocol(format!("Unknown SCI request: {}", line)));
        };
        let mut parts = line.split(' ');
        parts.next();
        let target = parts.next().unwrap_or_default().to_string();
        let version = parts.next().unwrap_or_default().to_string();
        if !version.starts_with("HTTP/1.") || version.len() != 8 {
            return Err(Error::Protocol(format!("Unknown HTTP version: {}", version)));
        }
        Ok(ServerCommand::Request(RequestLine {
            method,
            target,
            version,
        }))
    }
}

/// Non-fatal control line answered to the SCI server when a forwarded
/// request is rejected or its target fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    PostDisallowed,
    SchemeNotAllowed(String),
    HostDenied(String),
    PortDenied(u16),
    UnknownHostname,
    ConnectionRefused,
    WebTimeout,
    Exception(String),
    BadStatus(String),
    NoEndOfHeaders,
}

impl ControlLine {
    /// Rejection code carried on the wire
    pub fn code(&self) -> &'static str {
        match self {
            ControlLine::PostDisallowed => "accessdenied",
            ControlLine::SchemeNotAllowed(_) => "badscheme",
            ControlLine::HostDenied(_) => "accessdenied",
            ControlLine::PortDenied(_) => "badport",
            ControlLine::UnknownHostname => "noaddr",
            ControlLine::ConnectionRefused => "connref",
            ControlLine::WebTimeout => "timeout",
            ControlLine::Exception(_) => "exception",
            ControlLine::BadStatus(_) => "badstatus",
            ControlLine::NoEndOfHeaders => "noeoh",
        }
    }

    /// Human-readable text carried after the code
    pub fn text(&self) -> String {
        match self {
            ControlLine::PostDisallowed => "POST actions have been disallowed".to_string(),
            ControlLine::SchemeNotAllowed(scheme) => {
                format!("URL scheme '{}' not allowed", scheme)
            }
            ControlLine::HostDenied(host) => {
                format!("CMS proxy access denied to host '{}'", host)
            }
            ControlLine::PortDenied(port) => format!("Access denied to port {}", port),
            ControlLine::UnknownHostname => "Unknown hostname".to_string(),
            ControlLine::ConnectionRefused => "Connection refused".to_string(),
            ControlLine::WebTimeout => "Timeout reading from web server".to_string(),
            ControlLine::Exception(detail) => detail.clone(),
            ControlLine::BadStatus(status) => format!("Bad status line '{}'", status),
            ControlLine::NoEndOfHeaders => "No end-of-headers found".to_string(),
        }
    }

    /// Wire form, terminator included.
    pub fn to_wire(&self) -> String {
        format!("XSCI {} {}{}", self.code(), self.text(), CRLF)
    }
}

/// Extract the payload length from the extended-result trailer's
/// `Content-Length` line. The trailer fixes the header spelling, so the
/// value starts at byte offset 16.
pub fn trailer_content_length(line: &str) -> usize {
    decimal_prefix(line.get(16..).unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_noop() {
        assert!(matches!(
            ServerCommand::parse("XSCI-NOOP"),
            Ok(ServerCommand::Noop)
        ));
    }

    #[test]
    fn test_parse_complete() {
        match ServerCommand::parse("XSCI-COMPLETE http://site.example/page") {
            Ok(ServerCommand::Complete { url }) => {
                assert_eq!(url, "http://site.example/page");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error() {
        match ServerCommand::parse("XSCI-ERROR licence expired") {
            Ok(ServerCommand::Error { message }) => {
                assert_eq!(message, "licence expired");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_get_request() {
        match ServerCommand::parse("GET http://site.example/a?b=1 HTTP/1.1") {
            Ok(ServerCommand::Request(req)) => {
                assert_eq!(req.method, Method::Get);
                assert_eq!(req.target, "http://site.example/a?b=1");
                assert_eq!(req.version, "HTTP/1.1");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_post_request() {
        match ServerCommand::parse("POST https://site.example/form HTTP/1.0") {
            Ok(ServerCommand::Request(req)) => {
                assert_eq!(req.method, Method::Post);
                assert_eq!(req.version, "HTTP/1.0");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_command() {
        assert!(matches!(
            ServerCommand::parse("FETCH http://x/ HTTP/1.1"),
            Err(Error::Protocol(_))
        ));
        // A completion without its trailing space is not a completion.
        assert!(matches!(
            ServerCommand::parse("XSCI-COMPLETE"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_bad_version() {
        assert!(ServerCommand::parse("GET http://x/ HTTP/2.0").is_err());
        assert!(ServerCommand::parse("GET http://x/ HTTP/1.").is_err());
        assert!(ServerCommand::parse("GET http://x/ HTTP/1.11").is_err());
        assert!(ServerCommand::parse("GET http://x/").is_err());
    }

    #[test]
    fn test_control_line_wire_text() {
        assert_eq!(
            ControlLine::PostDisallowed.to_wire(),
            "XSCI accessdenied POST actions have been disallowed\r\n"
        );
        assert_eq!(
            ControlLine::SchemeNotAllowed("ftp".to_string()).to_wire(),
            "XSCI badscheme URL scheme 'ftp' not allowed\r\n"
        );
        assert_eq!(
            ControlLine::HostDenied("evil.example".to_string()).to_wire(),
            "XSCI accessdenied CMS proxy access denied to host 'evil.example'\r\n"
        );
        assert_eq!(
            ControlLine::PortDenied(25).to_wire(),
            "XSCI badport Access denied to port 25\r\n"
        );
        assert_eq!(
            ControlLine::UnknownHostname.to_wire(),
            "XSCI noaddr Unknown hostname\r\n"
        );
        assert_eq!(
            ControlLine::ConnectionRefused.to_wire(),
            "XSCI connref Connection refused\r\n"
        );
        assert_eq!(
            ControlLine::WebTimeout.to_wire(),
            "XSCI timeout Timeout reading from web server\r\n"
        );
        assert_eq!(
            ControlLine::Exception("tls alert".to_string()).to_wire(),
            "XSCI exception tls alert\r\n"
        );
        assert_eq!(
            ControlLine::BadStatus("garbage".to_string()).to_wire(),
            "XSCI badstatus Bad status line 'garbage'\r\n"
        );
        assert_eq!(
            ControlLine::NoEndOfHeaders.to_wire(),
            "XSCI noeoh No end-of-headers found\r\n"
        );
    }

    #[test]
    fn test_trailer_content_length() {
        assert_eq!(trailer_content_length("Content-Length: 00000013"), 13);
        assert_eq!(trailer_content_length("Content-Length: 42"), 42);
        // Short or malformed lines read as an empty payload.
        assert_eq!(trailer_content_length("Content-Length:"), 0);
        assert_eq!(trailer_content_length(""), 0);
    }
}
