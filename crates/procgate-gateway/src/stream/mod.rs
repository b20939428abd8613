//! Upload/download streaming
//!
//! - [`multipart`]: boundary scanner over the request body
//! - [`lob`]: piecewise large-object writes and ranged reads
//! - [`cache`]: file-system staging collaborator
//!
//! [`receive_multipart`] drives the scanner from a [`Transport`] and routes
//! each part: plain fields into the argument table, file bodies into a
//! [`FileSink`]. [`RoutingSink`] sends a file to a large object when its
//! argument is declared as one and to the location's upload target
//! otherwise.

pub mod cache;
pub mod lob;
pub mod multipart;

pub use cache::{CacheStore, DirectoryCache};
pub use lob::{send_lob, ByteRange, Download, LobReader, PieceWriter};
pub use multipart::{boundary_from_content_type, MultipartScanner, PartHeaders, ScanEvent, ScanState};

use crate::binder::args::is_valid_name;
use crate::binder::{ArgumentTable, CallMode, DescribeEntry};
use crate::driver::{BackendDriver, LobKind, LobLocator};
use crate::metrics;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use procgate_common::config::UploadSettings;
use procgate_common::{GatewayError, Result};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Where an uploaded file ended up
#[derive(Debug, Clone, PartialEq)]
pub enum StoredFile {
    /// Contents kept in memory, bound as a blob
    Blob(Bytes),
    /// Stored name or locator, bound as text
    Named(String),
}

/// Destination for uploaded file bodies, one file at a time
#[async_trait]
pub trait FileSink: Send {
    /// Metrics label
    fn target(&self) -> &'static str;

    /// Start a file for the argument at `position` of the table
    async fn begin(&mut self, headers: &PartHeaders, position: usize) -> Result<()>;

    async fn write(&mut self, data: Bytes) -> Result<()>;

    async fn finish(&mut self) -> Result<StoredFile>;

    /// Discard a file left incomplete by a failed upload
    async fn abort(&mut self) {}
}

/// Keeps small files in memory
#[derive(Debug)]
pub struct MemorySink {
    threshold: usize,
    buf: BytesMut,
}

impl MemorySink {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            buf: BytesMut::new(),
        }
    }
}

#[async_trait]
impl FileSink for MemorySink {
    fn target(&self) -> &'static str {
        "memory"
    }

    async fn begin(&mut self, _headers: &PartHeaders, _position: usize) -> Result<()> {
        self.buf.clear();
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        let size = self.buf.len() + data.len();
        if size > self.threshold {
            return Err(GatewayError::PayloadTooLarge {
                size: size as u64,
                limit: self.threshold as u64,
            });
        }
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<StoredFile> {
        Ok(StoredFile::Blob(self.buf.split().freeze()))
    }
}

/// Writes files piecewise into backend large objects
pub struct LobSink<'a, D: BackendDriver> {
    driver: &'a D,
    session: &'a mut D::Session,
    piece_size: usize,
    current: Option<(LobLocator, PieceWriter)>,
}

impl<'a, D: BackendDriver> LobSink<'a, D> {
    pub fn new(driver: &'a D, session: &'a mut D::Session, piece_size: usize) -> Self {
        Self {
            driver,
            session,
            piece_size,
            current: None,
        }
    }
}

#[async_trait]
impl<'a, D: BackendDriver> FileSink for LobSink<'a, D> {
    fn target(&self) -> &'static str {
        "large_object"
    }

    async fn begin(&mut self, headers: &PartHeaders, _position: usize) -> Result<()> {
        let name = headers.file_name.as_deref().unwrap_or(&headers.name);
        let locator = self
            .driver
            .lob_create(self.session, LobKind::Blob, name, headers.content_type.as_deref())
            .await?;
        self.current = Some((locator, PieceWriter::new(self.piece_size)));
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        let Some((locator, writer)) = self.current.as_mut() else {
            return Err(GatewayError::Internal("large-object write without a file".into()));
        };
        for piece in writer.push(&data) {
            self.driver.lob_write(self.session, locator, piece).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<StoredFile> {
        let Some((locator, mut writer)) = self.current.take() else {
            return Err(GatewayError::Internal("large-object finish without a file".into()));
        };
        let last = writer.finish();
        self.driver.lob_write(self.session, &locator, last).await?;
        debug!(locator = %locator.0, bytes = writer.bytes_written(), "Large object written");
        Ok(StoredFile::Named(locator.0))
    }
}

/// Stages files in the file cache and promotes them when complete
pub struct CacheSink<'a> {
    store: &'a dyn CacheStore,
    current: Option<(PathBuf, tokio::fs::File, String)>,
}

impl<'a> CacheSink<'a> {
    pub fn new(store: &'a dyn CacheStore) -> Self {
        Self {
            store,
            current: None,
        }
    }
}

#[async_trait]
impl<'a> FileSink for CacheSink<'a> {
    fn target(&self) -> &'static str {
        "file_cache"
    }

    async fn begin(&mut self, headers: &PartHeaders, _position: usize) -> Result<()> {
        let file_name = headers.file_name.as_deref().unwrap_or(&headers.name);
        let logical = format!("{}/{}", uuid::Uuid::new_v4(), file_name);
        let (staged, file) = self.store.create_staging().await?;
        self.current = Some((staged, file, logical));
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        let Some((_, file, _)) = self.current.as_mut() else {
            return Err(GatewayError::Internal("cache write without a file".into()));
        };
        file.write_all(&data).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<StoredFile> {
        let Some((staged, mut file, logical)) = self.current.take() else {
            return Err(GatewayError::Internal("cache finish without a file".into()));
        };
        file.flush().await?;
        drop(file);
        let Some(final_path) = self.store.map_logical_to_physical(&logical) else {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(GatewayError::StreamingFormat(format!(
                "file name '{}' cannot be stored",
                logical
            )));
        };
        self.store.stage_and_promote(&staged, &final_path).await?;
        Ok(StoredFile::Named(logical))
    }

    async fn abort(&mut self) {
        if let Some((staged, file, _)) = self.current.take() {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&staged).await {
                warn!(path = %staged.display(), "Failed to remove staged upload: {}", e);
            }
        }
    }
}

/// Picks a destination per file from the procedure's declared arguments
pub struct RoutingSink<'a, D: BackendDriver> {
    lob: LobSink<'a, D>,
    /// Destination of files not bound to a large-object argument; `None`
    /// sends every file to a large object
    fallback: Option<Box<dyn FileSink + 'a>>,
    shapes: &'a DescribeEntry,
    mode: CallMode,
    to_lob: bool,
    lob_files: usize,
}

impl<'a, D: BackendDriver> RoutingSink<'a, D> {
    pub fn new(
        lob: LobSink<'a, D>,
        fallback: Option<Box<dyn FileSink + 'a>>,
        shapes: &'a DescribeEntry,
        mode: CallMode,
    ) -> Self {
        Self {
            lob,
            fallback,
            shapes,
            mode,
            to_lob: false,
            lob_files: 0,
        }
    }

    /// Whether any file went into a large object of the session
    pub fn wrote_large_objects(&self) -> bool {
        self.lob_files > 0
    }

    fn active(&mut self) -> &mut dyn FileSink {
        match self.fallback.as_deref_mut() {
            Some(fallback) if !self.to_lob => fallback,
            _ => &mut self.lob,
        }
    }
}

#[async_trait]
impl<'a, D: BackendDriver> FileSink for RoutingSink<'a, D> {
    fn target(&self) -> &'static str {
        match &self.fallback {
            Some(fallback) if !self.to_lob => fallback.target(),
            _ => self.lob.target(),
        }
    }

    async fn begin(&mut self, headers: &PartHeaders, position: usize) -> Result<()> {
        self.to_lob = self.fallback.is_none() || self.shapes.is_large_object(&headers.name, position, self.mode);
        if self.to_lob {
            self.lob_files += 1;
        }
        debug!(argument = %headers.name, target = self.target(), "Routing uploaded file");
        self.active().begin(headers, position).await
    }

    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.active().write(data).await
    }

    async fn finish(&mut self) -> Result<StoredFile> {
        self.active().finish().await
    }

    async fn abort(&mut self) {
        self.active().abort().await
    }
}

/// Totals of one multipart upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub fields: usize,
    pub files: usize,
    pub file_bytes: u64,
    pub body_bytes: u64,
}

enum OpenPart {
    Field(String, BytesMut),
    /// Argument name and bytes written so far
    File(String, u64),
}

/// Read a multipart body, filling `table` and routing files to `sink`
pub async fn receive_multipart<T: Transport + ?Sized>(
    transport: &mut T,
    boundary: &str,
    settings: &UploadSettings,
    lookahead: usize,
    mode: CallMode,
    table: &mut ArgumentTable,
    sink: &mut dyn FileSink,
) -> Result<UploadSummary> {
    check_declared_length(transport, settings)?;
    let result = scan_parts(transport, boundary, settings, lookahead, mode, table, sink).await;
    match result {
        Ok(summary) => {
            debug!(
                fields = summary.fields,
                files = summary.files,
                bytes = summary.body_bytes,
                "Multipart upload received"
            );
            Ok(summary)
        }
        Err(e) => {
            sink.abort().await;
            Err(e)
        }
    }
}

async fn scan_parts<T: Transport + ?Sized>(
    transport: &mut T,
    boundary: &str,
    settings: &UploadSettings,
    lookahead: usize,
    mode: CallMode,
    table: &mut ArgumentTable,
    sink: &mut dyn FileSink,
) -> Result<UploadSummary> {
    let mut scanner = MultipartScanner::new(boundary, settings.max_header_bytes, lookahead);
    let mut summary = UploadSummary::default();
    let mut open: Option<OpenPart> = None;

    loop {
        match scanner.next_event()? {
            Some(ScanEvent::PartStart(headers)) => {
                if !mode.is_flexible() && !is_valid_name(&headers.name) {
                    return Err(GatewayError::Encoding(format!(
                        "invalid argument name '{}'",
                        headers.name
                    )));
                }
                // Browsers send an empty filename when no file was chosen
                if headers.file_name.as_deref().map_or(false, |f| !f.is_empty()) {
                    sink.begin(&headers, table.position(&headers.name)).await?;
                    open = Some(OpenPart::File(headers.name, 0));
                } else {
                    open = Some(OpenPart::Field(headers.name, BytesMut::new()));
                }
            }
            Some(ScanEvent::Data(data)) => match open.as_mut() {
                Some(OpenPart::File(_, written)) => {
                    *written += data.len() as u64;
                    summary.file_bytes += data.len() as u64;
                    sink.write(data).await?;
                }
                Some(OpenPart::Field(_, buf)) => buf.extend_from_slice(&data),
                None => {}
            },
            Some(ScanEvent::PartEnd) => match open.take() {
                Some(OpenPart::File(name, written)) => {
                    summary.files += 1;
                    metrics::record_upload_bytes(sink.target(), written);
                    match sink.finish().await? {
                        StoredFile::Blob(data) => table.push_blob(name, data)?,
                        StoredFile::Named(stored) => table.push_file(name, stored)?,
                    }
                }
                Some(OpenPart::Field(name, buf)) => {
                    summary.fields += 1;
                    let value = String::from_utf8(buf.to_vec()).map_err(|_| {
                        GatewayError::Encoding(format!("field '{}' is not valid UTF-8", name))
                    })?;
                    table.push(name, value)?;
                }
                None => {}
            },
            Some(ScanEvent::End) => return Ok(summary),
            None => match transport.read_body(settings.read_chunk.max(1)).await? {
                Some(chunk) => {
                    summary.body_bytes += chunk.len() as u64;
                    if summary.body_bytes > settings.max_upload_bytes {
                        return Err(GatewayError::PayloadTooLarge {
                            size: summary.body_bytes,
                            limit: settings.max_upload_bytes,
                        });
                    }
                    scanner.feed(&chunk);
                }
                None => scanner.finish(),
            },
        }
    }
}

/// Reject a body whose declared length is over the upload cap
pub fn check_declared_length<T: Transport + ?Sized>(transport: &T, settings: &UploadSettings) -> Result<()> {
    match transport.content_length() {
        Some(length) if length > settings.max_upload_bytes => Err(GatewayError::PayloadTooLarge {
            size: length,
            limit: settings.max_upload_bytes,
        }),
        _ => Ok(()),
    }
}

/// Read a whole URL-encoded body
pub async fn read_form_body<T: Transport + ?Sized>(
    transport: &mut T,
    settings: &UploadSettings,
) -> Result<Bytes> {
    check_declared_length(transport, settings)?;
    let mut body = BytesMut::new();
    while let Some(chunk) = transport.read_body(settings.read_chunk.max(1)).await? {
        if (body.len() + chunk.len()) as u64 > settings.max_upload_bytes {
            return Err(GatewayError::PayloadTooLarge {
                size: (body.len() + chunk.len()) as u64,
                limit: settings.max_upload_bytes,
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::ArgValue;
    use crate::transport::{BufferedTransport, Environment};

    fn upload_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--b0\r\nContent-Disposition: form-data; name=\"tag\"\r\n\r\nx\r\n");
        body.extend_from_slice(b"--b0\r\nContent-Disposition: form-data; name=\"tag\"\r\n\r\ny\r\n");
        body.extend_from_slice(
            b"--b0\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"n.bin\"\r\n\r\n",
        );
        body.extend_from_slice(&[7u8; 100]);
        body.extend_from_slice(b"\r\n--b0--\r\n");
        body
    }

    fn settings() -> UploadSettings {
        UploadSettings {
            read_chunk: 13,
            ..UploadSettings::default()
        }
    }

    #[tokio::test]
    async fn test_memory_upload_into_table() {
        let mut transport = BufferedTransport::new(Environment::new()).with_body(upload_body());
        let mut table = ArgumentTable::new();
        let mut sink = MemorySink::new(1024);
        let summary = receive_multipart(
            &mut transport,
            "b0",
            &settings(),
            4096,
            CallMode::Keyword,
            &mut table,
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(summary.files, 1);
        assert_eq!(summary.fields, 2);
        assert_eq!(summary.file_bytes, 100);
        assert_eq!(
            table.get("tag").unwrap().value,
            ArgValue::Collection(vec!["x".into(), "y".into()])
        );
        let doc = table.get("doc").unwrap();
        assert!(doc.is_file);
        assert_eq!(doc.value, ArgValue::Blob(Bytes::from(vec![7u8; 100])));
    }

    #[tokio::test]
    async fn test_memory_threshold() {
        let mut transport = BufferedTransport::new(Environment::new()).with_body(upload_body());
        let mut table = ArgumentTable::new();
        let mut sink = MemorySink::new(50);
        let err = receive_multipart(
            &mut transport,
            "b0",
            &settings(),
            4096,
            CallMode::Keyword,
            &mut table,
            &mut sink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge { limit: 50, .. }));
    }

    #[tokio::test]
    async fn test_upload_cap() {
        let mut s = settings();
        s.max_upload_bytes = 64;
        let mut transport = BufferedTransport::new(Environment::new()).with_body(upload_body());
        let mut table = ArgumentTable::new();
        let mut sink = MemorySink::new(1024);
        let err = receive_multipart(&mut transport, "b0", &s, 4096, CallMode::Keyword, &mut table, &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_cache_upload_promotes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryCache::new(dir.path());
        let mut transport = BufferedTransport::new(Environment::new())
            .with_body_chunks(upload_body().chunks(9).map(|c| c.to_vec()).collect::<Vec<_>>());
        let mut table = ArgumentTable::new();
        let mut sink = CacheSink::new(&store);
        receive_multipart(&mut transport, "b0", &settings(), 4096, CallMode::Keyword, &mut table, &mut sink)
            .await
            .unwrap();

        let ArgValue::Scalar(logical) = &table.get("doc").unwrap().value else {
            panic!("expected stored name");
        };
        assert!(logical.ends_with("/n.bin"));
        let path = store.map_logical_to_physical(logical).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![7u8; 100]);
    }

    #[tokio::test]
    async fn test_empty_filename_is_a_field() {
        let body = b"--b0\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"\"\r\n\r\n\r\n--b0--\r\n";
        let mut transport = BufferedTransport::new(Environment::new()).with_body(body.to_vec());
        let mut table = ArgumentTable::new();
        let mut sink = MemorySink::new(1024);
        let summary = receive_multipart(&mut transport, "b0", &settings(), 4096, CallMode::Keyword, &mut table, &mut sink)
            .await
            .unwrap();
        assert_eq!(summary.files, 0);
        assert_eq!(table.get("doc").unwrap().value, ArgValue::Scalar(String::new()));
    }

    #[tokio::test]
    async fn test_read_form_body() {
        let mut transport = BufferedTransport::new(Environment::new()).with_body("a=1&b=2");
        let body = read_form_body(&mut transport, &settings()).await.unwrap();
        assert_eq!(&body[..], b"a=1&b=2");

        let mut s = settings();
        s.max_upload_bytes = 3;
        let mut transport = BufferedTransport::new(Environment::new()).with_body("a=1&b=2");
        assert!(read_form_body(&mut transport, &s).await.is_err());
    }
}
