//! SCI Client
//!
//! Client library for the SCI remote testing protocol. Opens an
//! authenticated session with an SCI server, submits a test request,
//! then services the HTTP fetches the server issues while the test
//! runs and collects the final results.

pub mod config;
pub mod net;
pub mod proxy;
pub mod request;
pub mod result;
pub mod session;
pub mod trace;

pub use config::{ClientConfig, ForwardProxy};
pub use request::TestRequest;
pub use result::SessionResult;
pub use session::SciClient;

pub use sci_shared::{protocol, Error, Result};
