#![no_std]

//! Incremental HTTP/1.x request framing for the control server.
//!
//! The server feeds raw socket chunks into a [`RequestBuf`]; once the
//! header terminator has been seen and (for requests that declare a
//! `Content-Length`) the body has fully arrived, the assembled request can
//! be parsed and routed. Wall-clock bounds on how long the server keeps
//! feeding are the socket loop's business, not this crate's.

use heapless::Vec;

/// Hard cap on one request (headers + body). Requests against this server
/// are a handful of form fields or a one-line command at most.
pub const MAX_REQUEST: usize = 2048;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Header terminator or declared body bytes still outstanding.
    NeedMore,
    /// A complete request is buffered.
    Complete,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The request exceeded [`MAX_REQUEST`] before completing.
    TooLarge,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// The request line did not split into exactly method/path/version.
    BadRequestLine,
}

/// A framed request, borrowing the assembler's buffer. The body is clamped
/// to the declared `Content-Length`.
#[derive(Debug)]
pub struct Request<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub version: &'a str,
    pub body: &'a [u8],
}

/// Assembles one request from raw chunks as they arrive.
pub struct RequestBuf {
    buf: Vec<u8, MAX_REQUEST>,
    header_end: Option<usize>,
    content_length: usize,
}

impl RequestBuf {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            header_end: None,
            content_length: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True once the header terminator has been seen.
    pub fn header_complete(&self) -> bool {
        self.header_end.is_some()
    }

    /// True once the header terminator has been seen and the declared body
    /// has fully arrived.
    pub fn complete(&self) -> bool {
        matches!(self.header_end, Some(end) if self.buf.len() >= end + self.content_length)
    }

    /// Feed one chunk. Returns [`Progress::Complete`] once the header
    /// terminator has been seen and `body.len() >= content_length`.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Progress, FrameError> {
        if self.buf.extend_from_slice(chunk).is_err() {
            return Err(FrameError::TooLarge);
        }

        if self.header_end.is_none() {
            if let Some(end) = find_header_end(&self.buf) {
                self.header_end = Some(end);
                self.content_length = scan_content_length(&self.buf[..end]);
            }
        }

        match self.header_end {
            Some(end) if self.buf.len() >= end + self.content_length => Ok(Progress::Complete),
            Some(_) | None if self.buf.is_full() => Err(FrameError::TooLarge),
            _ => Ok(Progress::NeedMore),
        }
    }

    /// Parse the assembled request. Only valid after `push` returned
    /// [`Progress::Complete`].
    pub fn request(&self) -> Result<Request<'_>, RequestError> {
        let header_end = self.header_end.unwrap_or(self.buf.len());
        let head = &self.buf[..header_end];

        let line_end = head
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(head.len());
        let line = trim_ascii(&head[..line_end]);
        let line = core::str::from_utf8(line).map_err(|_| RequestError::BadRequestLine)?;

        let mut parts = line.split_whitespace();
        let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(p), Some(v), None) => (m, p, v),
            _ => return Err(RequestError::BadRequestLine),
        };

        let body_end = (header_end + self.content_length).min(self.buf.len());
        Ok(Request {
            method,
            path,
            version,
            body: &self.buf[header_end..body_end],
        })
    }
}

impl Default for RequestBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// Index just past the header terminator: the standard blank-line sequence,
/// or a bare double-newline as a tolerant fallback.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

/// Case-insensitive `Content-Length` scan over the header block. A
/// malformed value counts as zero; when the header repeats, the last
/// occurrence wins.
fn scan_content_length(head: &[u8]) -> usize {
    let mut value = 0usize;
    for line in head.split(|&b| b == b'\n').skip(1) {
        let line = trim_ascii(line);
        let Some((name, rest)) = split_header(line) else {
            continue;
        };
        if name.eq_ignore_ascii_case(b"content-length") {
            value = core::str::from_utf8(trim_ascii(rest))
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(0)
                .min(MAX_REQUEST);
        }
    }
    value
}

fn split_header(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    Some((&line[..colon], &line[colon + 1..]))
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

/// The control server's routing table, in precedence order. Unmatched
/// paths fall back to the control page so captive-portal clients land
/// somewhere useful from any URL.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    IndexPage,
    WifiScan,
    WifiStatus,
    WifiConnect,
    Command,
    Icon,
    Fallback,
}

pub fn resolve(method: &str, path: &str) -> Route {
    match method {
        "GET" if path == "/" || path.starts_with("/index") => Route::IndexPage,
        "GET" if path == "/wifi/scan" => Route::WifiScan,
        "GET" if path == "/wifi/status" => Route::WifiStatus,
        "POST" if path == "/wifi/connect" => Route::WifiConnect,
        "POST" if path == "/cmd" => Route::Command,
        "GET"
            if path.starts_with("/favicon.ico")
                || path.starts_with("/apple-touch-icon.png")
                || path.starts_with("/apple-touch-icon-precomposed.png") =>
        {
            Route::Icon
        }
        _ => Route::Fallback,
    }
}

/// Extract a string field from a small flat JSON object, e.g.
/// `{"ssid":"net","psk":"secret"}`. Only what the connect endpoint needs
/// (no escapes, no nesting); the firmware stays off heavyweight JSON
/// parsers for three flat fields.
pub fn json_str_field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    let mut search = body;
    loop {
        let idx = search.find('"')?;
        let after_quote = &search[idx + 1..];
        let end = after_quote.find('"')?;
        let candidate = &after_quote[..end];
        let rest = &after_quote[end + 1..];
        if candidate == key {
            // Only a quoted string directly after a colon counts; anything
            // else was a value that happened to spell the key.
            if let Some(value) = quoted_value_after_colon(rest) {
                return Some(value);
            }
        }
        search = rest;
    }
}

fn quoted_value_after_colon(rest: &str) -> Option<&str> {
    let rest = rest.trim_start().strip_prefix(':')?;
    let rest = rest.trim_start().strip_prefix('"')?;
    let value_end = rest.find('"')?;
    Some(&rest[..value_end])
}

/// Extract a field from a `k=v&k2=v2` form body.
pub fn form_field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    for pair in body.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return Some(v);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(chunks: &[&[u8]]) -> RequestBuf {
        let mut rb = RequestBuf::new();
        let mut progress = Progress::NeedMore;
        for chunk in chunks {
            progress = rb.push(chunk).unwrap();
        }
        assert_eq!(progress, Progress::Complete);
        rb
    }

    #[test]
    fn frames_a_simple_get() {
        let rb = complete(&[b"GET /wifi/status HTTP/1.1\r\nHost: modgate\r\n\r\n"]);
        let req = rb.request().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/wifi/status");
        assert_eq!(req.version, "HTTP/1.1");
        assert!(req.body.is_empty());
    }

    #[test]
    fn accepts_bare_newline_terminator() {
        let rb = complete(&[b"GET / HTTP/1.0\nHost: modgate\n\n"]);
        assert_eq!(rb.request().unwrap().path, "/");
    }

    #[test]
    fn body_split_across_chunks_is_reassembled() {
        let rb = complete(&[
            b"POST /cmd HTTP/1.1\r\nContent-Length: 8\r\n\r\nSYS ",
            b"PING",
        ]);
        let req = rb.request().unwrap();
        assert_eq!(req.body, b"SYS PING");
    }

    #[test]
    fn headers_and_body_in_one_chunk() {
        let rb = complete(&[b"POST /cmd HTTP/1.1\r\nContent-Length: 2\r\n\r\nOKextra"]);
        // Body clamps to the declared length.
        assert_eq!(rb.request().unwrap().body, b"OK");
    }

    #[test]
    fn waits_for_declared_body() {
        let mut rb = RequestBuf::new();
        assert_eq!(
            rb.push(b"POST /cmd HTTP/1.1\r\nContent-Length: 4\r\n\r\nAB")
                .unwrap(),
            Progress::NeedMore
        );
        assert_eq!(rb.push(b"CD").unwrap(), Progress::Complete);
    }

    #[test]
    fn content_length_is_case_insensitive_and_last_wins() {
        let rb = complete(&[b"POST /cmd HTTP/1.1\r\ncontent-LENGTH: 9\r\nContent-Length: 2\r\n\r\nhi"]);
        assert_eq!(rb.request().unwrap().body, b"hi");
    }

    #[test]
    fn malformed_content_length_reads_as_zero() {
        let rb = complete(&[b"POST /cmd HTTP/1.1\r\nContent-Length: banana\r\n\r\n"]);
        assert!(rb.request().unwrap().body.is_empty());
    }

    #[test]
    fn missing_content_length_means_empty_body() {
        let rb = complete(&[b"POST /cmd HTTP/1.1\r\n\r\n"]);
        assert!(rb.request().unwrap().body.is_empty());
    }

    #[test]
    fn bad_request_lines_are_rejected() {
        for raw in [
            &b"GARBAGE\r\n\r\n"[..],
            &b"GET /\r\n\r\n"[..],
            &b"GET / HTTP/1.1 junk\r\n\r\n"[..],
        ] {
            let mut rb = RequestBuf::new();
            assert_eq!(rb.push(raw).unwrap(), Progress::Complete);
            assert!(rb.request().is_err());
        }
    }

    #[test]
    fn oversized_requests_error_out() {
        let mut rb = RequestBuf::new();
        let filler = [b'a'; 512];
        let mut result = Ok(Progress::NeedMore);
        for _ in 0..5 {
            result = rb.push(&filler);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(FrameError::TooLarge));
    }

    #[test]
    fn route_precedence() {
        assert_eq!(resolve("GET", "/"), Route::IndexPage);
        assert_eq!(resolve("GET", "/index.html"), Route::IndexPage);
        assert_eq!(resolve("GET", "/wifi/scan"), Route::WifiScan);
        assert_eq!(resolve("GET", "/wifi/status"), Route::WifiStatus);
        assert_eq!(resolve("POST", "/wifi/connect"), Route::WifiConnect);
        assert_eq!(resolve("POST", "/cmd"), Route::Command);
        assert_eq!(resolve("GET", "/favicon.ico"), Route::Icon);
        assert_eq!(resolve("GET", "/apple-touch-icon.png"), Route::Icon);
        // Captive-portal behavior: anything else serves the page.
        assert_eq!(resolve("GET", "/generate_204"), Route::Fallback);
        assert_eq!(resolve("GET", "/cmd"), Route::Fallback);
        assert_eq!(resolve("POST", "/"), Route::Fallback);
    }

    #[test]
    fn json_field_extraction() {
        let body = r#"{"ssid":"HomeNet","psk":"hunter22"}"#;
        assert_eq!(json_str_field(body, "ssid"), Some("HomeNet"));
        assert_eq!(json_str_field(body, "psk"), Some("hunter22"));
        assert_eq!(json_str_field(body, "password"), None);
        assert_eq!(json_str_field("{}", "ssid"), None);
        // Whitespace around the colon is tolerated.
        assert_eq!(
            json_str_field(r#"{ "ssid" : "a b" }"#, "ssid"),
            Some("a b")
        );
        // A value spelling the key does not shadow the real key.
        assert_eq!(
            json_str_field(r#"{"ssid":"psk","psk":"real"}"#, "psk"),
            Some("real")
        );
    }

    #[test]
    fn form_field_extraction() {
        assert_eq!(form_field("ssid=HomeNet&psk=pw", "ssid"), Some("HomeNet"));
        assert_eq!(form_field("ssid=HomeNet&psk=pw", "psk"), Some("pw"));
        assert_eq!(form_field("ssid=HomeNet", "psk"), None);
    }
}
