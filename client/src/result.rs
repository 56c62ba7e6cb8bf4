//! Terminal result of a session.

use tracing::debug;

use sci_shared::protocol::trailer_content_length;
use sci_shared::{Error, Result};

use crate::session::Session;

/// Outcome of a completed test session.
#[derive(Debug)]
pub struct SessionResult {
    /// URL echoed by the server on completion.
    pub url: String,

    /// Raw result payload, JSON when extended responses are enabled.
    pub results: Vec<u8>,

    /// Whether a debug trace was captured.
    pub debug: bool,

    /// Ordered log of the session's traffic.
    pub debug_trace: Option<Vec<String>>,
}

/// Assemble the result after `XSCI-COMPLETE`, reading the extended
/// trailer when enabled. The trailer is a fixed shape: a Content-Type
/// line, a Content-Length line, a blank line, then the payload.
pub(crate) async fn complete(mut session: Session, url: String) -> Result<SessionResult> {
    let mut results = Vec::new();
    if session.config.extended_response {
        trailer_line(&mut session).await?; // Content-Type
        let length = trailer_content_length(&trailer_line(&mut session).await?);
        trailer_line(&mut session).await?; // blank
        results = session.stream.read_exact_body(length).await.map_err(|_| {
            Error::Protocol("SCI server disconnected while sending results".to_string())
        })?;
        debug!("Read {} result bytes for {}", results.len(), url);
    }
    let debug_trace = match &session.trace {
        Some(trace) => Some(trace.take().await),
        None => None,
    };
    Ok(SessionResult {
        url,
        results,
        debug: session.config.debug,
        debug_trace,
    })
}

/// One line of the result trailer.
async fn trailer_line(session: &mut Session) -> Result<String> {
    match session.stream.read_line().await? {
        Some(line) => Ok(line),
        None => Err(Error::Protocol(
            "SCI server disconnected while sending results".to_string(),
        )),
    }
}
