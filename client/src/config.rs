//! Client configuration for an SCI session.

use sci_shared::protocol::{DEFAULT_PORT, DEFAULT_SERVER, DEFAULT_TLS_PORT};

/// Outbound HTTP proxy used to reach the SCI server.
#[derive(Debug, Clone)]
pub struct ForwardProxy {
    pub hostname: String,
    pub port: u16,
}

/// Settings for a single client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Licence key: eight-character key ID followed by the secret.
    pub licence_key: String,

    /// SCI server hostname.
    pub server_hostname: String,

    /// Explicit server port, overriding the scheme default.
    pub server_port: Option<u16>,

    /// Connect to the server over TLS.
    pub server_secure: bool,

    /// Request the extended response trailer with the results body.
    pub extended_response: bool,

    /// Allow the server to issue POST requests during the test.
    pub post_allowed: bool,

    /// Query string substituted into every proxied request.
    pub extra_query: Option<String>,

    /// Headers appended to every proxied request.
    pub extra_headers: Vec<String>,

    /// Cookies passed to the server with the test request.
    pub cookies: Option<serde_json::Value>,

    /// HTTP proxy to tunnel the server connection through.
    pub proxy: Option<ForwardProxy>,

    /// Capture a line-level trace of server traffic.
    pub debug: bool,
}

impl ClientConfig {
    /// Configuration with defaults for the given licence key.
    pub fn new(licence_key: &str) -> Self {
        Self {
            licence_key: licence_key.to_string(),
            server_hostname: DEFAULT_SERVER.to_string(),
            server_port: None,
            server_secure: true,
            extended_response: true,
            post_allowed: true,
            extra_query: None,
            extra_headers: Vec::new(),
            cookies: None,
            proxy: None,
            debug: false,
        }
    }

    /// Port to connect to, falling back to the scheme default.
    pub fn effective_port(&self) -> u16 {
        self.server_port.unwrap_or(if self.server_secure {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        })
    }
}
