//! Header/body recovery from the backend's single output stream
//!
//! The procedure writes one undifferentiated stream. Leading lines that look
//! like `Name: value` are held as candidates until a blank line confirms them
//! as a header block. The block only counts when at least one recognized
//! header (`Content-Type`, `Content-Length`, `Status`, `Location`,
//! `Set-Cookie`, `WWW-Authenticate`) is among them; otherwise every byte is
//! body.

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tracing::{debug, warn};

const RECOGNIZED: [&str; 6] = [
    "content-type",
    "content-length",
    "status",
    "location",
    "set-cookie",
    "www-authenticate",
];

/// Response metadata recovered from a header block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    /// Explicit `Status`, or the status forced by `Location`/`WWW-Authenticate`
    pub status: Option<StatusCode>,
    pub reason: Option<String>,
    pub content_type: Option<String>,
    /// Declared length; only a hint, see [`crate::output::send_page`]
    pub content_length: Option<u64>,
    /// Remaining headers in output order
    pub headers: Vec<(String, String)>,
    /// New affinity key from a `Set-Cookie` of the affinity cookie; empty
    /// when the procedure cleared it
    pub affinity: Option<String>,
}

impl ResponseHead {
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }
}

/// Classification of the output seen so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// Leading bytes could still be headers
    Scanning,
    /// A header block was found and consumed
    Headers,
    /// No header block; everything is body
    Body,
}

/// Position in the backend output stream
#[derive(Debug)]
pub struct OutputCursor {
    pending: BytesMut,
    /// Offset of the first unscanned line in `pending`
    scanned: usize,
    candidates: Vec<(String, String)>,
    recognized: bool,
    state: OutputState,
    lookahead: usize,
    affinity_cookie: Option<String>,
    head: ResponseHead,
}

impl OutputCursor {
    /// `lookahead` bounds how far a header block may extend
    pub fn new(lookahead: usize, affinity_cookie: Option<&str>) -> Self {
        Self {
            pending: BytesMut::new(),
            scanned: 0,
            candidates: Vec::new(),
            recognized: false,
            state: OutputState::Scanning,
            lookahead: lookahead.max(1),
            affinity_cookie: affinity_cookie.map(str::to_string),
            head: ResponseHead::default(),
        }
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    pub fn is_classified(&self) -> bool {
        self.state != OutputState::Scanning
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Feed output; returns body bytes that are ready to send
    pub fn push(&mut self, data: &[u8]) -> Option<Bytes> {
        if self.is_classified() {
            return (!data.is_empty()).then(|| Bytes::copy_from_slice(data));
        }
        self.pending.extend_from_slice(data);
        self.scan(false)
    }

    /// End of output; returns whatever body was still held back
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.is_classified() {
            return None;
        }
        self.scan(true)
    }

    fn scan(&mut self, eof: bool) -> Option<Bytes> {
        loop {
            if self.scanned > self.lookahead {
                return self.all_body();
            }
            let rest = &self.pending[self.scanned..];
            let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
                if eof || self.pending.len() > self.lookahead {
                    return self.all_body();
                }
                return None;
            };

            let line = &rest[..newline];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                if !self.recognized {
                    return self.all_body();
                }
                let body_start = self.scanned + newline + 1;
                let body = self.pending.split_off(body_start).freeze();
                self.pending.clear();
                self.apply_headers();
                self.state = OutputState::Headers;
                return (!body.is_empty()).then_some(body);
            }

            match header_line(line) {
                Some((name, value)) => {
                    if RECOGNIZED.contains(&name.to_ascii_lowercase().as_str()) {
                        self.recognized = true;
                    }
                    self.candidates.push((name, value));
                    self.scanned += newline + 1;
                }
                None => return self.all_body(),
            }
        }
    }

    fn all_body(&mut self) -> Option<Bytes> {
        self.state = OutputState::Body;
        self.candidates.clear();
        let body = self.pending.split().freeze();
        (!body.is_empty()).then_some(body)
    }

    fn apply_headers(&mut self) {
        let mut explicit_status = false;
        let mut location = false;
        let mut challenge = false;

        for (name, value) in std::mem::take(&mut self.candidates) {
            match name.to_ascii_lowercase().as_str() {
                "content-type" => self.head.content_type = Some(value),
                "content-length" => match value.parse::<u64>() {
                    Ok(length) => self.head.content_length = Some(length),
                    Err(_) => warn!(value = %value, "Ignoring malformed Content-Length from procedure"),
                },
                "status" => match parse_status(&value) {
                    Some((status, reason)) => {
                        self.head.status = Some(status);
                        self.head.reason = reason;
                        explicit_status = true;
                    }
                    None => warn!(value = %value, "Ignoring malformed Status from procedure"),
                },
                "location" => {
                    location = true;
                    self.head.headers.push(("Location".into(), value));
                }
                "set-cookie" => {
                    if let Some(cookie) = self.affinity_cookie.as_deref() {
                        if let Some(key) = cookie_value(&value, cookie) {
                            self.head.affinity = Some(key.to_string());
                        }
                    }
                    self.head.headers.push(("Set-Cookie".into(), value));
                }
                "www-authenticate" => {
                    challenge = true;
                    self.head.headers.push(("WWW-Authenticate".into(), value));
                }
                _ => self.head.headers.push((name, value)),
            }
        }

        if challenge {
            self.head.status = Some(StatusCode::UNAUTHORIZED);
            self.head.reason = None;
        } else if location && !explicit_status {
            self.head.status = Some(StatusCode::FOUND);
        }
        debug!(
            status = self.head.status().as_u16(),
            headers = self.head.headers.len(),
            "Header block recognized"
        );
    }
}

/// Split a `Name: value` line; `None` when the line is not header-shaped
fn header_line(line: &[u8]) -> Option<(String, String)> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = &line[..colon];
    if name.is_empty()
        || !name
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return None;
    }
    let value = String::from_utf8_lossy(&line[colon + 1..]);
    let value: String = value.chars().filter(|c| !c.is_control()).collect();
    Some((
        String::from_utf8_lossy(name).into_owned(),
        value.trim().to_string(),
    ))
}

/// `"404 Not Found"` to status and reason
fn parse_status(value: &str) -> Option<(StatusCode, Option<String>)> {
    let (code, reason) = match value.split_once(char::is_whitespace) {
        Some((code, reason)) => (code, reason.trim()),
        None => (value, ""),
    };
    let status = StatusCode::from_u16(code.parse().ok()?).ok()?;
    let reason = (!reason.is_empty()).then(|| reason.to_string());
    Some((status, reason))
}

/// Value of cookie `name` in a `Set-Cookie` header
fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    let pair = header.split(';').next()?;
    let (key, value) = pair.split_once('=')?;
    (key.trim() == name).then(|| value.trim())
}
