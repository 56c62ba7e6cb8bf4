//! Test request submitted to the SCI server.

use serde::Serialize;
use serde_json::Value;
use url::Url;

use sci_shared::{Error, Result};

use crate::config::ClientConfig;

/// A test to run against one URL.
#[derive(Debug, Clone)]
pub struct TestRequest {
    /// URL under test.
    pub url: String,

    /// Hostnames the server is allowed to fetch from during the test.
    /// The URL's own host is merged in before submission.
    pub host_names: Vec<String>,

    /// Server-side view to run.
    pub view: String,

    /// Additional pages for multi-page views.
    pub pages_list: Vec<String>,

    /// User identifier passed through to the server.
    pub user: String,

    /// Server identifier passed through to the server.
    pub server: String,
}

/// Submission payload. Field names and order are fixed by the server.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    url: &'a str,
    host_names: &'a [String],
    view: &'a str,
    extended_response: bool,
    screenshot: bool,
    test_content: bool,
    cookies: &'a Option<Value>,
    pages_list: &'a [String],
    user: &'a str,
    server: &'a str,
}

impl TestRequest {
    /// Request for the given URL with default settings.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            host_names: Vec::new(),
            view: "snapshot-page".to_string(),
            pages_list: Vec::new(),
            user: String::new(),
            server: String::new(),
        }
    }

    /// Ensure the allow-list contains the test URL's own host.
    pub fn merge_url_host(&mut self) -> Result<()> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| Error::Request(format!("Bad test URL '{}': {}", self.url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Request(format!("Test URL '{}' has no host", self.url)))?;
        if !self
            .host_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(host))
        {
            self.host_names.push(host.to_string());
        }
        Ok(())
    }

    /// Serialize the submission payload.
    pub fn wire_json(&self, config: &ClientConfig) -> Result<String> {
        let wire = WireRequest {
            url: &self.url,
            host_names: &self.host_names,
            view: &self.view,
            extended_response: config.extended_response,
            screenshot: true,
            test_content: true,
            cookies: &config.cookies,
            pages_list: &self.pages_list,
            user: &self.user,
            server: &self.server,
        };
        serde_json::to_string(&wire)
            .map_err(|e| Error::Request(format!("Could not encode test request: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_adds_url_host() {
        let mut request = TestRequest::new("http://site.example/page");
        request.merge_url_host().unwrap();
        assert_eq!(request.host_names, ["site.example"]);
    }

    #[test]
    fn test_merge_skips_present_host_case_insensitively() {
        let mut request = TestRequest::new("http://site.example/page");
        request.host_names = vec!["Site.Example".to_string(), "cdn.example".to_string()];
        request.merge_url_host().unwrap();
        assert_eq!(request.host_names, ["Site.Example", "cdn.example"]);
    }

    #[test]
    fn test_merge_rejects_unparseable_url() {
        let mut request = TestRequest::new("not a url");
        assert!(matches!(request.merge_url_host(), Err(Error::Request(_))));
    }

    #[test]
    fn test_merge_rejects_hostless_url() {
        let mut request = TestRequest::new("mailto:someone@site.example");
        assert!(matches!(request.merge_url_host(), Err(Error::Request(_))));
    }

    #[test]
    fn test_wire_json_shape() {
        let config = ClientConfig::new("ABCDEFGH0123456789");
        let mut request = TestRequest::new("http://site.example/page");
        request.merge_url_host().unwrap();
        let json = request.wire_json(&config).unwrap();
        assert_eq!(
            json,
            concat!(
                "{\"url\":\"http://site.example/page\",",
                "\"hostNames\":[\"site.example\"],",
                "\"view\":\"snapshot-page\",",
                "\"extendedResponse\":true,",
                "\"screenshot\":true,",
                "\"testContent\":true,",
                "\"cookies\":null,",
                "\"pagesList\":[],",
                "\"user\":\"\",",
                "\"server\":\"\"}"
            )
        );
    }

    #[test]
    fn test_wire_json_carries_options() {
        let mut config = ClientConfig::new("key");
        config.extended_response = false;
        config.cookies = Some(json!({"session": "abc123"}));
        let mut request = TestRequest::new("https://site.example/");
        request.user = "tester".to_string();
        request.server = "staging".to_string();
        request.pages_list = vec!["/a".to_string(), "/b".to_string()];
        request.merge_url_host().unwrap();
        let json = request.wire_json(&config).unwrap();
        assert!(json.contains("\"extendedResponse\":false"));
        assert!(json.contains("\"cookies\":{\"session\":\"abc123\"}"));
        assert!(json.contains("\"pagesList\":[\"/a\",\"/b\"]"));
        assert!(json.contains("\"user\":\"tester\""));
        assert!(json.contains("\"server\":\"staging\""));
    }
}
