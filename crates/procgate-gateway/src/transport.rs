//! Front-end transport interface
//!
//! Each front end (embedded server module, standalone daemon) implements
//! [`Transport`] for one request/response exchange. The engine only reads the
//! request through it and writes the response through it.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use procgate_common::{GatewayError, Result};
use std::collections::VecDeque;

/// Whether a header write replaces or adds to an existing header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    Replace,
    Append,
}

/// CGI-style request environment (`REQUEST_METHOD`, `PATH_INFO`, `HTTP_COOKIE`, ...)
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Set a variable, replacing an existing one of the same name
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn method(&self) -> &str {
        self.get("REQUEST_METHOD").unwrap_or("GET")
    }

    pub fn path_info(&self) -> &str {
        self.get("PATH_INFO").unwrap_or("")
    }

    pub fn query_string(&self) -> &str {
        self.get("QUERY_STRING").unwrap_or("")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("CONTENT_TYPE")
    }

    /// Value of a request cookie
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.get("HTTP_COOKIE")?.split(';').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name).then(|| value.trim())
        })
    }
}

/// One request/response exchange with a client
#[async_trait]
pub trait Transport: Send {
    fn environment(&self) -> &Environment;

    /// Declared request body length, when the client sent one
    fn content_length(&self) -> Option<u64>;

    /// Next chunk of the request body (at most `max_bytes`); `None` at end
    async fn read_body(&mut self, max_bytes: usize) -> Result<Option<Bytes>>;

    async fn write_status(&mut self, status: StatusCode, reason: Option<&str>) -> Result<()>;

    async fn write_header(&mut self, name: &str, value: &str, mode: HeaderMode) -> Result<()>;

    async fn write_body(&mut self, bytes: &[u8]) -> Result<()>;

    async fn flush(&mut self) -> Result<()>;

    /// Whether status and headers have already been sent
    fn is_committed(&self) -> bool;
}

/// In-memory transport: the request body is supplied up front and the
/// response is captured for the caller to forward
#[derive(Debug, Default)]
pub struct BufferedTransport {
    environment: Environment,
    request_chunks: VecDeque<Bytes>,
    content_length: Option<u64>,
    status: Option<(StatusCode, Option<String>)>,
    headers: Vec<(String, String)>,
    body: BytesMut,
    committed: bool,
    flushes: usize,
    /// Simulated client disconnect once this many body bytes were written
    fail_after_bytes: Option<usize>,
}

impl BufferedTransport {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            ..Default::default()
        }
    }

    /// Supply the request body as one chunk
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.content_length = Some(body.len() as u64);
        self.request_chunks = VecDeque::from(vec![body]);
        self
    }

    /// Supply the request body as a sequence of reads
    pub fn with_body_chunks<I, B>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.request_chunks = chunks.into_iter().map(Into::into).collect();
        self.content_length = Some(self.request_chunks.iter().map(|c| c.len() as u64).sum());
        self
    }

    /// Fail writes once `bytes` of body have been accepted
    pub fn disconnect_after(mut self, bytes: usize) -> Self {
        self.fail_after_bytes = Some(bytes);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status.as_ref().map(|(s, _)| *s).unwrap_or(StatusCode::OK)
    }

    pub fn reason(&self) -> Option<&str> {
        self.status.as_ref().and_then(|(_, r)| r.as_deref())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header of the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    /// Consume into status, headers and body
    pub fn into_parts(self) -> (StatusCode, Vec<(String, String)>, Bytes) {
        let status = self.status();
        (status, self.headers, self.body.freeze())
    }
}

#[async_trait]
impl Transport for BufferedTransport {
    fn environment(&self) -> &Environment {
        &self.environment
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    async fn read_body(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
        let Some(mut chunk) = self.request_chunks.pop_front() else {
            return Ok(None);
        };
        if chunk.len() > max_bytes {
            let rest = chunk.split_off(max_bytes);
            self.request_chunks.push_front(rest);
        }
        Ok(Some(chunk))
    }

    async fn write_status(&mut self, status: StatusCode, reason: Option<&str>) -> Result<()> {
        if self.committed {
            return Err(GatewayError::Internal("status written after headers were sent".into()));
        }
        self.status = Some((status, reason.map(str::to_string)));
        Ok(())
    }

    async fn write_header(&mut self, name: &str, value: &str, mode: HeaderMode) -> Result<()> {
        if self.committed {
            return Err(GatewayError::Internal(format!(
                "header '{}' written after headers were sent",
                name
            )));
        }
        if mode == HeaderMode::Replace {
            self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        }
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    async fn write_body(&mut self, bytes: &[u8]) -> Result<()> {
        self.committed = true;
        if let Some(limit) = self.fail_after_bytes {
            if self.body.len() + bytes.len() > limit {
                let room = limit.saturating_sub(self.body.len());
                self.body.extend_from_slice(&bytes[..room]);
                return Err(GatewayError::Transport("client disconnected".into()));
            }
        }
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.committed = true;
        self.flushes += 1;
        Ok(())
    }

    fn is_committed(&self) -> bool {
        self.committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_lookup() {
        let env = Environment::from_pairs([("HTTP_COOKIE", "a=1; PROCGATE_SESSION=abc ; b=2")]);
        assert_eq!(env.cookie("PROCGATE_SESSION"), Some("abc"));
        assert_eq!(env.cookie("b"), Some("2"));
        assert_eq!(env.cookie("missing"), None);
    }

    #[test]
    fn test_environment_set_replaces() {
        let mut env = Environment::new();
        env.set("PATH_INFO", "/a");
        env.set("PATH_INFO", "/b");
        assert_eq!(env.len(), 1);
        assert_eq!(env.path_info(), "/b");
    }

    #[tokio::test]
    async fn test_read_body_respects_max_bytes() {
        let mut transport = BufferedTransport::new(Environment::new()).with_body("abcdefgh");
        assert_eq!(transport.read_body(3).await.unwrap().unwrap(), Bytes::from("abc"));
        assert_eq!(transport.read_body(10).await.unwrap().unwrap(), Bytes::from("defgh"));
        assert!(transport.read_body(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_header_replace_and_append() {
        let mut transport = BufferedTransport::new(Environment::new());
        transport.write_header("Set-Cookie", "a=1", HeaderMode::Append).await.unwrap();
        transport.write_header("Set-Cookie", "b=2", HeaderMode::Append).await.unwrap();
        transport.write_header("Content-Type", "text/html", HeaderMode::Replace).await.unwrap();
        transport.write_header("content-type", "text/plain", HeaderMode::Replace).await.unwrap();
        assert_eq!(transport.header_values("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(transport.header_values("Content-Type"), vec!["text/plain"]);
    }

    #[tokio::test]
    async fn test_disconnect_after() {
        let mut transport = BufferedTransport::new(Environment::new()).disconnect_after(4);
        transport.write_body(b"abc").await.unwrap();
        let err = transport.write_body(b"def").await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(transport.body(), b"abcd");
    }
}
