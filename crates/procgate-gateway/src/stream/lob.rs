//! Piecewise large-object transfer
//!
//! Writes split an upload into `First`/`Next`/`Last` pieces (or a single
//! `Only`); reads pull fixed-size pieces, optionally narrowed to a byte
//! range, straight to the transport.

use crate::driver::{BackendDriver, LobLocator, LobPiece};
use crate::metrics;
use crate::transport::{HeaderMode, Transport};
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use procgate_common::{GatewayError, Result};
use tracing::debug;

/// Inclusive byte range of a `Range` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Resolve a `Range` header against a content length
    ///
    /// Returns `Ok(None)` for headers that are not a single `bytes=` range;
    /// those are ignored and the full content is served.
    pub fn parse(header: &str, length: u64) -> Result<Option<ByteRange>> {
        let Some(spec) = header.trim().strip_prefix("bytes=") else {
            return Ok(None);
        };
        if spec.contains(',') {
            return Ok(None);
        }
        let Some((first, last)) = spec.split_once('-') else {
            return Ok(None);
        };
        let (first, last) = (first.trim(), last.trim());
        let unsatisfiable = || GatewayError::RangeNotSatisfiable { length };

        let range = if first.is_empty() {
            // Suffix range: the last n bytes
            let Ok(n) = last.parse::<u64>() else {
                return Ok(None);
            };
            if n == 0 || length == 0 {
                return Err(unsatisfiable());
            }
            ByteRange {
                start: length.saturating_sub(n),
                end: length - 1,
            }
        } else {
            let Ok(start) = first.parse::<u64>() else {
                return Ok(None);
            };
            let requested_end = if last.is_empty() {
                None
            } else {
                match last.parse::<u64>() {
                    Ok(end) => Some(end),
                    Err(_) => return Ok(None),
                }
            };
            if start >= length || requested_end.map_or(false, |end| end < start) {
                return Err(unsatisfiable());
            }
            ByteRange {
                start,
                end: requested_end.map_or(length - 1, |end| end.min(length - 1)),
            }
        };
        Ok(Some(range))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a response
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Buffers upload data into fixed-size pieces for a large-object write
///
/// One piece is always held back so the final write can be flagged `Last`
/// (or `Only` when the object fits in a single piece).
#[derive(Debug)]
pub struct PieceWriter {
    piece_size: usize,
    pending: BytesMut,
    pieces_written: usize,
    bytes_written: u64,
}

impl PieceWriter {
    pub fn new(piece_size: usize) -> Self {
        Self {
            piece_size: piece_size.max(1),
            pending: BytesMut::new(),
            pieces_written: 0,
            bytes_written: 0,
        }
    }

    /// Append data; returns the pieces now ready to write
    pub fn push(&mut self, data: &[u8]) -> Vec<LobPiece> {
        self.pending.extend_from_slice(data);
        let mut ready = Vec::new();
        while self.pending.len() > self.piece_size {
            let piece = self.pending.split_to(self.piece_size).freeze();
            ready.push(self.tag(piece, false));
        }
        ready
    }

    /// The final piece
    pub fn finish(&mut self) -> LobPiece {
        let rest = self.pending.split().freeze();
        self.tag(rest, true)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn tag(&mut self, piece: Bytes, last: bool) -> LobPiece {
        self.bytes_written += piece.len() as u64;
        let first = self.pieces_written == 0;
        self.pieces_written += 1;
        match (first, last) {
            (true, true) => LobPiece::Only(piece),
            (true, false) => LobPiece::First(piece),
            (false, true) => LobPiece::Last(piece),
            (false, false) => LobPiece::Next(piece),
        }
    }
}

/// Reads a large object piece by piece
pub struct LobReader<'a, D: BackendDriver> {
    driver: &'a D,
    locator: LobLocator,
    piece_size: usize,
    offset: u64,
    /// Exclusive
    end: u64,
}

impl<'a, D: BackendDriver> LobReader<'a, D> {
    pub fn new(driver: &'a D, locator: LobLocator, length: u64, piece_size: usize) -> Self {
        Self {
            driver,
            locator,
            piece_size: piece_size.max(1),
            offset: 0,
            end: length,
        }
    }

    /// Restrict reading to `range`
    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.offset = range.start;
        self.end = range.end + 1;
        self
    }

    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.offset)
    }

    /// Next piece; `None` once the range is exhausted
    pub async fn next_piece(&mut self, session: &mut D::Session) -> Result<Option<Bytes>> {
        if self.offset >= self.end {
            return Ok(None);
        }
        let want = self.remaining().min(self.piece_size as u64) as usize;
        let piece = self
            .driver
            .lob_read(session, &self.locator, self.offset, want)
            .await?;
        if piece.is_empty() {
            // Object shorter than reported
            self.offset = self.end;
            return Ok(None);
        }
        self.offset += piece.len() as u64;
        Ok(Some(piece))
    }

    /// Stream the remaining pieces to the transport
    pub async fn copy_to<T: Transport + ?Sized>(
        &mut self,
        session: &mut D::Session,
        transport: &mut T,
    ) -> Result<u64> {
        let mut sent = 0u64;
        while let Some(piece) = self.next_piece(session).await? {
            transport.write_body(&piece).await?;
            sent += piece.len() as u64;
        }
        Ok(sent)
    }
}

/// A large object to send as the whole response
#[derive(Debug, Clone)]
pub struct Download<'a> {
    pub locator: &'a LobLocator,
    pub content_type: &'a str,
    pub file_name: Option<&'a str>,
    /// Raw `Range` request header
    pub range: Option<&'a str>,
    pub piece_size: usize,
}

/// Send a large object with status, headers and range handling
pub async fn send_lob<D: BackendDriver, T: Transport + ?Sized>(
    driver: &D,
    session: &mut D::Session,
    transport: &mut T,
    download: Download<'_>,
) -> Result<u64> {
    let length = driver.lob_length(session, download.locator).await?;
    let range = match download.range {
        Some(header) => ByteRange::parse(header, length)?,
        None => None,
    };

    let mut reader = LobReader::new(driver, download.locator.clone(), length, download.piece_size);
    match range {
        Some(range) => {
            transport
                .write_status(StatusCode::PARTIAL_CONTENT, None)
                .await?;
            transport
                .write_header("Content-Range", &range.content_range(length), HeaderMode::Replace)
                .await?;
            transport
                .write_header("Content-Length", &range.len().to_string(), HeaderMode::Replace)
                .await?;
            reader = reader.with_range(range);
        }
        None => {
            transport.write_status(StatusCode::OK, None).await?;
            transport
                .write_header("Content-Length", &length.to_string(), HeaderMode::Replace)
                .await?;
        }
    }
    transport
        .write_header("Content-Type", download.content_type, HeaderMode::Replace)
        .await?;
    transport
        .write_header("Accept-Ranges", "bytes", HeaderMode::Replace)
        .await?;
    if let Some(name) = download.file_name {
        transport
            .write_header(
                "Content-Disposition",
                &format!("attachment; filename=\"{}\"", name.replace('"', "")),
                HeaderMode::Replace,
            )
            .await?;
    }

    let sent = reader.copy_to(session, transport).await?;
    transport.flush().await?;
    metrics::record_download_bytes("lob", sent);
    debug!(locator = %download.locator.0, length, sent, "Large object sent");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_forms() {
        assert_eq!(
            ByteRange::parse("bytes=0-9", 100).unwrap(),
            Some(ByteRange { start: 0, end: 9 })
        );
        assert_eq!(
            ByteRange::parse("bytes=90-", 100).unwrap(),
            Some(ByteRange { start: 90, end: 99 })
        );
        assert_eq!(
            ByteRange::parse("bytes=-10", 100).unwrap(),
            Some(ByteRange { start: 90, end: 99 })
        );
        // End past the content is clamped
        assert_eq!(
            ByteRange::parse("bytes=50-500", 100).unwrap(),
            Some(ByteRange { start: 50, end: 99 })
        );
        assert_eq!(ByteRange::parse("bytes=-500", 100).unwrap().unwrap().start, 0);
    }

    #[test]
    fn test_range_unsatisfiable() {
        for header in ["bytes=100-", "bytes=100-200", "bytes=-0", "bytes=20-10"] {
            assert!(
                matches!(
                    ByteRange::parse(header, 100),
                    Err(GatewayError::RangeNotSatisfiable { length: 100 })
                ),
                "{}",
                header
            );
        }
    }

    #[test]
    fn test_range_ignored() {
        for header in ["items=0-1", "bytes=0-1,5-6", "bytes=a-b", "bytes"] {
            assert_eq!(ByteRange::parse(header, 100).unwrap(), None, "{}", header);
        }
    }

    #[test]
    fn test_content_range() {
        let range = ByteRange { start: 10, end: 19 };
        assert_eq!(range.len(), 10);
        assert_eq!(range.content_range(100), "bytes 10-19/100");
    }

    #[test]
    fn test_piece_writer_tags() {
        let mut writer = PieceWriter::new(4);
        assert!(writer.push(b"ab").is_empty());
        assert_eq!(writer.finish(), LobPiece::Only(Bytes::from_static(b"ab")));

        let mut writer = PieceWriter::new(4);
        let mut pieces = writer.push(b"abcdefghij");
        pieces.push(writer.finish());
        assert_eq!(
            pieces,
            vec![
                LobPiece::First(Bytes::from_static(b"abcd")),
                LobPiece::Next(Bytes::from_static(b"efgh")),
                LobPiece::Last(Bytes::from_static(b"ij")),
            ]
        );
        assert_eq!(writer.bytes_written(), 10);
    }

    #[test]
    fn test_piece_writer_exact_multiple() {
        let mut writer = PieceWriter::new(4);
        let mut pieces = writer.push(b"abcd");
        pieces.extend(writer.push(b"efgh"));
        pieces.push(writer.finish());
        assert_eq!(
            pieces,
            vec![
                LobPiece::First(Bytes::from_static(b"abcd")),
                LobPiece::Last(Bytes::from_static(b"efgh")),
            ]
        );
    }
}
