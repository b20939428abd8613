//! Output reassembly
//!
//! - [`reassembler`]: header/body recovery from the page stream
//! - [`rowset`]: cursor rendering as CSV, JSON or XML
//! - [`charset`]: when a declared length survives charset conversion

pub mod charset;
pub mod reassembler;
pub mod rowset;

pub use reassembler::{OutputCursor, OutputState, ResponseHead};
pub use rowset::{encoder_for, send_rowset, RowEncoder};

use crate::driver::BackendDriver;
use crate::transport::{HeaderMode, Transport};
use bytes::Bytes;
use http::StatusCode;
use procgate_common::config::{CharsetSettings, OutputSettings};
use procgate_common::Result;
use tracing::{debug, warn};

/// Page output rules of one location
#[derive(Debug, Clone, Copy)]
pub struct PageOptions<'a> {
    pub output: &'a OutputSettings,
    pub charset: &'a CharsetSettings,
    /// Cookie whose `Set-Cookie` updates the session affinity key
    pub affinity_cookie: Option<&'a str>,
}

/// What was sent for a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSummary {
    pub status: StatusCode,
    pub body_bytes: u64,
    /// Affinity key set by the procedure; empty when it cleared the cookie
    pub affinity: Option<String>,
    /// Whether `Content-Length` was sent
    pub sized: bool,
}

/// Read the page the last call produced and send it as the response
///
/// The body length is sent only when the whole body arrived before the
/// first write and the charset conversion cannot change its byte length;
/// otherwise the response is streamed unsized.
pub async fn send_page<D: BackendDriver, T: Transport + ?Sized>(
    driver: &D,
    session: &mut D::Session,
    transport: &mut T,
    options: PageOptions<'_>,
) -> Result<PageSummary> {
    let piece_size = options.output.read_piece_size.max(1);
    let mut cursor = OutputCursor::new(options.output.header_lookahead_bytes, options.affinity_cookie);

    // Read until the leading bytes are classified
    let mut first: Option<Bytes> = None;
    let mut ended = false;
    while !cursor.is_classified() {
        match driver.read_output(session, piece_size).await? {
            Some(piece) => first = cursor.push(&piece),
            None => {
                first = cursor.finish();
                ended = true;
            }
        }
    }
    // One more read tells whether the body is complete
    let mut next: Option<Bytes> = None;
    if !ended {
        match driver.read_output(session, piece_size).await? {
            Some(piece) => next = Some(piece),
            None => ended = true,
        }
    }

    let head = cursor.head().clone();
    let status = head.status();
    transport.write_status(status, head.reason.as_deref()).await?;
    for (name, value) in &head.headers {
        transport.write_header(name, value, HeaderMode::Append).await?;
    }
    let content_type = head
        .content_type
        .as_deref()
        .unwrap_or(&options.output.default_content_type);
    transport
        .write_header("Content-Type", content_type, HeaderMode::Replace)
        .await?;

    let first_len = first.as_ref().map_or(0, |b| b.len() as u64);
    let sized = ended && charset::length_preserving(options.charset);
    if sized {
        if let Some(declared) = head.content_length {
            if declared != first_len {
                warn!(declared, actual = first_len, "Procedure declared a wrong Content-Length");
            }
        }
        transport
            .write_header("Content-Length", &first_len.to_string(), HeaderMode::Replace)
            .await?;
    }

    let mut body_bytes = 0u64;
    for piece in first.iter().chain(next.iter()) {
        transport.write_body(piece).await?;
        body_bytes += piece.len() as u64;
    }
    if !ended {
        while let Some(piece) = driver.read_output(session, piece_size).await? {
            transport.write_body(&piece).await?;
            body_bytes += piece.len() as u64;
        }
    }
    transport.flush().await?;

    debug!(status = status.as_u16(), bytes = body_bytes, sized, "Page sent");
    Ok(PageSummary {
        status,
        body_bytes,
        affinity: head.affinity,
        sized,
    })
}
