//! Challenge-response authentication.
//!
//! The server greets with `SCI:<version>...<challenge>`. The client
//! answers with the first eight characters of its licence key followed
//! by the lowercase hex HMAC-SHA1 of the challenge, keyed with the
//! remainder of the licence.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// Validate a greeting line and extract the challenge portion.
pub fn parse_greeting(line: &str) -> Result<&str> {
    if line.len() < 16 || !line.starts_with("SCI:") {
        return Err(Error::Protocol(
            "Bad greeting line from SCI server".to_string(),
        ));
    }
    if line.as_bytes()[4] != b'1' {
        return Err(Error::Protocol(
            "SCI server is using incompatible protocol version".to_string(),
        ));
    }
    line.get(8..).ok_or_else(|| {
        Error::Protocol("Bad greeting line from SCI server".to_string())
    })
}

/// Public identifier portion of a licence key.
pub fn key_id(licence: &str) -> &str {
    licence.get(..8).unwrap_or(licence)
}

/// Compute the response to an authentication challenge.
pub fn auth_response(licence: &str, challenge: &str) -> Result<String> {
    let secret = licence.get(8..).unwrap_or("");
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Authentication(format!("Bad licence key: {}", e)))?;
    mac.update(challenge.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(format!("{}{}", key_id(licence), hex::encode(digest)))
}
