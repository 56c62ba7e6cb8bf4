//! Folding codec for HTTP header blocks.
//!
//! Headers arrive one raw line at a time. A line starting with a space
//! or tab continues the previous header and is appended verbatim; an
//! empty line terminates the block.

/// Incremental folder for one header block.
#[derive(Debug, Default)]
pub struct HeaderFolder {
    headers: Vec<String>,
    pending: String,
}

impl HeaderFolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one non-terminator line.
    pub fn feed(&mut self, line: &str) {
        if line.starts_with(' ') || line.starts_with('\t') {
            self.pending.push_str(line);
        } else {
            if !self.pending.is_empty() {
                self.headers.push(std::mem::take(&mut self.pending));
            }
            self.pending.push_str(line);
        }
    }

    /// Terminate the block and take the folded headers.
    pub fn finish(mut self) -> Vec<String> {
        if !self.pending.is_empty() {
            self.headers.push(std::mem::take(&mut self.pending));
        }
        self.headers
    }
}

/// Serialize folded headers to wire form, skipping any whose name
/// matches an entry in `exclude` case-insensitively.
pub fn write_headers(headers: &[String], exclude: &[&str]) -> String {
    let mut out = String::new();
    for header in headers {
        if exclude.iter().any(|name| matches_name(header, name)) {
            continue;
        }
        out.push_str(header);
        out.push_str("\r\n");
    }
    out
}

/// Value of the first `Content-Length` header, if one is present.
/// A header with no parseable digits reads as zero.
pub fn content_length(headers: &[String]) -> Option<usize> {
    for header in headers {
        if matches_name(header, "Content-Length") {
            let value = header.split_once(':').map(|(_, v)| v).unwrap_or("");
            return Some(decimal_prefix(value));
        }
    }
    None
}

/// True when the header line's name equals `name` case-insensitively.
fn matches_name(header: &str, name: &str) -> bool {
    match header.split_once(':') {
        Some((header_name, _)) => header_name.eq_ignore_ascii_case(name),
        None => false,
    }
}

/// Leading decimal value of a string, ignoring leading whitespace.
/// Reads as zero when no digits are present.
pub(crate) fn decimal_prefix(s: &str) -> usize {
    let digits: String = s
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}
