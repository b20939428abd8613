//! Multipart boundary scanner
//!
//! Incremental `multipart/form-data` parser. Input is fed in arbitrary
//! chunks; [`MultipartScanner::next_event`] yields part starts, body data and
//! part ends as soon as they can be decided.
//!
//! A delimiter match is only acted on once the buffer also holds the two
//! bytes after it (`\r\n` or `--`) or the input has ended. When no match is
//! found, all but the last `delimiter.len()` bytes are released as data, so a
//! delimiter straddling two reads is still found.

use bytes::{Buf, Bytes, BytesMut};
use procgate_common::{GatewayError, Result};

/// Parsed headers of one part
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders {
    pub name: String,
    /// Present for file fields
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

impl PartHeaders {
    pub fn is_file(&self) -> bool {
        self.file_name.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    AwaitBoundary,
    ReadFieldHeaders,
    ReadScalarBody,
    ReadFileBody,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    PartStart(PartHeaders),
    /// Body bytes of the current part
    Data(Bytes),
    PartEnd,
    /// Closing delimiter seen
    End,
}

/// Rolling working buffer plus the headers of the part being read
#[derive(Debug, Default)]
pub struct TransferFrame {
    buf: BytesMut,
    headers: Option<PartHeaders>,
}

impl TransferFrame {
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn headers(&self) -> Option<&PartHeaders> {
        self.headers.as_ref()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Boundary parameter of a `multipart/form-data` content type
pub fn boundary_from_content_type(content_type: &str) -> Result<String> {
    let mut parts = content_type.split(';');
    let media = parts.next().unwrap_or("").trim();
    if !media.eq_ignore_ascii_case("multipart/form-data") {
        return Err(GatewayError::StreamingFormat(format!(
            "not a multipart/form-data request: {}",
            media
        )));
    }
    parts
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty() && b.len() <= 70)
        .ok_or_else(|| GatewayError::StreamingFormat("missing or invalid multipart boundary".into()))
}

pub struct MultipartScanner {
    /// `\r\n--` + boundary
    delimiter: Vec<u8>,
    state: ScanState,
    frame: TransferFrame,
    eof: bool,
    max_header_bytes: usize,
    /// Preamble allowance before the opening boundary
    lookahead: usize,
    preamble_seen: usize,
    opened: bool,
}

impl MultipartScanner {
    pub fn new(boundary: &str, max_header_bytes: usize, lookahead: usize) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        let mut frame = TransferFrame::default();
        // Lets the opening boundary match the same delimiter as later ones
        frame.buf.extend_from_slice(b"\r\n");
        Self {
            delimiter,
            state: ScanState::AwaitBoundary,
            frame,
            eof: false,
            max_header_bytes,
            lookahead,
            preamble_seen: 0,
            opened: false,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn frame(&self) -> &TransferFrame {
        &self.frame
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.frame.buf.extend_from_slice(chunk);
    }

    /// Mark the end of input
    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// Next decidable event; `Ok(None)` means more input is needed
    pub fn next_event(&mut self) -> Result<Option<ScanEvent>> {
        match self.state {
            ScanState::End => Ok(None),
            ScanState::AwaitBoundary => self.await_boundary(),
            ScanState::ReadFieldHeaders => self.read_headers(),
            ScanState::ReadScalarBody | ScanState::ReadFileBody => self.read_body(),
        }
    }

    fn await_boundary(&mut self) -> Result<Option<ScanEvent>> {
        let dlen = self.delimiter.len();
        match find(&self.frame.buf, &self.delimiter) {
            Some(pos) if self.frame.buf.len() >= pos + dlen + 2 => {
                let suffix = [self.frame.buf[pos + dlen], self.frame.buf[pos + dlen + 1]];
                self.frame.buf.advance(pos + dlen + 2);
                self.opened = true;
                match &suffix {
                    b"--" => {
                        self.state = ScanState::End;
                        self.frame.buf.clear();
                        Ok(Some(ScanEvent::End))
                    }
                    b"\r\n" => {
                        self.state = ScanState::ReadFieldHeaders;
                        self.read_headers()
                    }
                    _ => Err(GatewayError::StreamingFormat(
                        "boundary not followed by CRLF or '--'".into(),
                    )),
                }
            }
            Some(_) if !self.eof => Ok(None),
            Some(_) => Err(GatewayError::StreamingFormat(
                "upload ended inside a boundary".into(),
            )),
            None => {
                if self.opened {
                    // Later delimiters always sit at the head of the buffer
                    return Err(GatewayError::StreamingFormat("expected a boundary".into()));
                }
                let keep = dlen.saturating_sub(1).min(self.frame.buf.len());
                let drop = self.frame.buf.len() - keep;
                self.frame.buf.advance(drop);
                self.preamble_seen += drop;
                if self.preamble_seen > self.lookahead {
                    return Err(GatewayError::StreamingFormat(format!(
                        "opening boundary not found within {} bytes",
                        self.lookahead
                    )));
                }
                if self.eof {
                    return Err(GatewayError::StreamingFormat("no opening boundary".into()));
                }
                Ok(None)
            }
        }
    }

    fn read_headers(&mut self) -> Result<Option<ScanEvent>> {
        if self.frame.buf.starts_with(b"\r\n") {
            return Err(GatewayError::StreamingFormat("part without name=".into()));
        }
        let Some(end) = find(&self.frame.buf, b"\r\n\r\n") else {
            if self.frame.buf.len() > self.max_header_bytes {
                return Err(GatewayError::StreamingFormat(format!(
                    "part headers exceed {} bytes",
                    self.max_header_bytes
                )));
            }
            if self.eof {
                return Err(GatewayError::StreamingFormat("truncated part headers".into()));
            }
            return Ok(None);
        };
        if end > self.max_header_bytes {
            return Err(GatewayError::StreamingFormat(format!(
                "part headers exceed {} bytes",
                self.max_header_bytes
            )));
        }
        let block = self.frame.buf.split_to(end + 4);
        let headers = parse_part_headers(&String::from_utf8_lossy(&block[..end]))?;
        self.state = if headers.is_file() {
            ScanState::ReadFileBody
        } else {
            ScanState::ReadScalarBody
        };
        self.frame.headers = Some(headers.clone());
        Ok(Some(ScanEvent::PartStart(headers)))
    }

    fn read_body(&mut self) -> Result<Option<ScanEvent>> {
        let dlen = self.delimiter.len();
        match find(&self.frame.buf, &self.delimiter) {
            Some(0) => {
                if self.frame.buf.len() < dlen + 2 && !self.eof {
                    return Ok(None);
                }
                self.state = ScanState::AwaitBoundary;
                self.frame.headers = None;
                Ok(Some(ScanEvent::PartEnd))
            }
            Some(pos) => Ok(Some(ScanEvent::Data(self.frame.buf.split_to(pos).freeze()))),
            None => {
                if self.eof {
                    return Err(GatewayError::StreamingFormat(
                        "upload ended before the closing boundary".into(),
                    ));
                }
                let keep = dlen.min(self.frame.buf.len());
                let release = self.frame.buf.len() - keep;
                if release == 0 {
                    return Ok(None);
                }
                Ok(Some(ScanEvent::Data(self.frame.buf.split_to(release).freeze())))
            }
        }
    }
}

/// Parse the header block of one part
pub fn parse_part_headers(block: &str) -> Result<PartHeaders> {
    let mut headers = PartHeaders::default();
    let mut name = None;
    for line in block.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            for (param, param_value) in disposition_params(value) {
                if param.eq_ignore_ascii_case("name") {
                    name = Some(param_value);
                } else if param.eq_ignore_ascii_case("filename") {
                    headers.file_name = Some(base_name(&param_value).to_string());
                }
            }
        } else if key.eq_ignore_ascii_case("content-type") {
            headers.content_type = Some(value.trim().to_string());
        }
    }
    headers.name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| GatewayError::StreamingFormat("part without name=".into()))?;
    Ok(headers)
}

/// `key=value` parameters of a Content-Disposition value, quotes removed
fn disposition_params(value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = value;
    // Skip the disposition type
    match rest.find(';') {
        Some(i) => rest = &rest[i + 1..],
        None => return params,
    }
    loop {
        rest = rest.trim_start_matches(&[' ', '\t', ';'][..]);
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    _ => out.push(c),
                }
            }
            value = out;
            rest = &quoted[end.min(quoted.len())..];
        } else {
            let end = rest.find(';').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        params.push((key, value));
    }
    params
}

/// Strip client-side directories some browsers send
fn base_name(path: &str) -> &str {
    path.rsplit(&['/', '\\'][..]).next().unwrap_or(path)
}
