//! Cursor rendering: CSV, JSON and XML row encoders
//!
//! Rows are fetched in batches and encoded into a buffer that is written to
//! the transport whenever it reaches the download piece size, so a result of
//! any size streams in bounded memory. A cursor whose only column is a
//! character large object is sent as raw text instead.

use crate::driver::{BackendDriver, Column, ColumnKind, CursorHandle, Value};
use crate::metrics;
use crate::stream::LobReader;
use crate::transport::{HeaderMode, Transport};
use bytes::{BufMut, BytesMut};
use http::StatusCode;
use procgate_common::config::{OutputSettings, RowsetFormat, RowsetSettings, XmlNamespace};
use procgate_common::Result;
use std::fmt::Write as _;
use tracing::debug;

/// Renders rows into an output buffer
pub trait RowEncoder: Send {
    fn content_type(&self) -> &'static str;

    fn begin(&mut self, columns: &[Column], out: &mut BytesMut);

    /// One row; `None` is a NULL value
    fn row(&mut self, values: &[Option<String>], out: &mut BytesMut);

    fn finish(&mut self, out: &mut BytesMut);
}

/// Encoder for the configured format
pub fn encoder_for(settings: &RowsetSettings) -> Box<dyn RowEncoder> {
    match settings.format {
        RowsetFormat::Csv => Box::new(CsvEncoder),
        RowsetFormat::Json => Box::new(JsonEncoder::new(settings.json_wrapper.clone())),
        RowsetFormat::Xml => Box::new(XmlEncoder::new(settings)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CSV
// ═══════════════════════════════════════════════════════════════════════════

/// Header row, then one CRLF-terminated line per row
#[derive(Debug, Default)]
pub struct CsvEncoder;

fn csv_field(value: &str, out: &mut BytesMut) {
    if value.contains(&[',', '"', '\r', '\n'][..]) {
        out.put_u8(b'"');
        out.put_slice(value.replace('"', "\"\"").as_bytes());
        out.put_u8(b'"');
    } else {
        out.put_slice(value.as_bytes());
    }
}

impl RowEncoder for CsvEncoder {
    fn content_type(&self) -> &'static str {
        RowsetFormat::Csv.content_type()
    }

    fn begin(&mut self, columns: &[Column], out: &mut BytesMut) {
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                out.put_u8(b',');
            }
            csv_field(&column.name, out);
        }
        out.put_slice(b"\r\n");
    }

    fn row(&mut self, values: &[Option<String>], out: &mut BytesMut) {
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                out.put_u8(b',');
            }
            csv_field(value.as_deref().unwrap_or(""), out);
        }
        out.put_slice(b"\r\n");
    }

    fn finish(&mut self, _out: &mut BytesMut) {}
}

// ═══════════════════════════════════════════════════════════════════════════
// JSON
// ═══════════════════════════════════════════════════════════════════════════

/// Array of objects keyed by column name, optionally wrapped in an object
#[derive(Debug)]
pub struct JsonEncoder {
    wrapper: Option<String>,
    columns: Vec<Column>,
    rows: usize,
}

impl JsonEncoder {
    pub fn new(wrapper: Option<String>) -> Self {
        Self {
            wrapper,
            columns: Vec::new(),
            rows: 0,
        }
    }
}

fn json_string(value: &str, out: &mut BytesMut) {
    out.put_slice(serde_json::Value::String(value.to_string()).to_string().as_bytes());
}

impl RowEncoder for JsonEncoder {
    fn content_type(&self) -> &'static str {
        RowsetFormat::Json.content_type()
    }

    fn begin(&mut self, columns: &[Column], out: &mut BytesMut) {
        self.columns = columns.to_vec();
        if let Some(wrapper) = &self.wrapper {
            out.put_u8(b'{');
            json_string(wrapper, out);
            out.put_u8(b':');
        }
        out.put_u8(b'[');
    }

    fn row(&mut self, values: &[Option<String>], out: &mut BytesMut) {
        if self.rows > 0 {
            out.put_u8(b',');
        }
        self.rows += 1;
        out.put_u8(b'{');
        for (i, (column, value)) in self.columns.iter().zip(values).enumerate() {
            if i > 0 {
                out.put_u8(b',');
            }
            json_string(&column.name, out);
            out.put_u8(b':');
            match value {
                None => out.put_slice(b"null"),
                Some(v) if column.kind == ColumnKind::Number && is_json_number(v) => {
                    out.put_slice(v.as_bytes())
                }
                Some(v) => json_string(v, out),
            }
        }
        out.put_u8(b'}');
    }

    fn finish(&mut self, out: &mut BytesMut) {
        out.put_u8(b']');
        if self.wrapper.is_some() {
            out.put_u8(b'}');
        }
    }
}

fn is_json_number(value: &str) -> bool {
    serde_json::from_str::<serde_json::Number>(value).is_ok()
}

// ═══════════════════════════════════════════════════════════════════════════
// XML
// ═══════════════════════════════════════════════════════════════════════════

/// Root element wrapping one element per row, one child per column
#[derive(Debug)]
pub struct XmlEncoder {
    root: String,
    row: String,
    namespace: Option<XmlNamespace>,
    namespace_on_root: bool,
    namespace_on_row: bool,
    suppress_empty_root: bool,
    columns: Vec<String>,
    rows: usize,
}

impl XmlEncoder {
    pub fn new(settings: &RowsetSettings) -> Self {
        Self {
            root: element_name(&settings.xml_root),
            row: element_name(&settings.xml_row),
            namespace: settings.xml_namespace.clone(),
            namespace_on_root: settings.xml_namespace_on_root,
            namespace_on_row: settings.xml_namespace_on_row,
            suppress_empty_root: settings.xml_suppress_empty_root,
            columns: Vec::new(),
            rows: 0,
        }
    }

    fn qualified(&self, name: &str, namespaced: bool) -> String {
        match &self.namespace {
            Some(ns) if namespaced && !ns.prefix.is_empty() => format!("{}:{}", ns.prefix, name),
            _ => name.to_string(),
        }
    }

    fn declaration(&self) -> String {
        match &self.namespace {
            Some(ns) if ns.prefix.is_empty() => format!(" xmlns=\"{}\"", xml_escape(&ns.uri)),
            Some(ns) => format!(" xmlns:{}=\"{}\"", ns.prefix, xml_escape(&ns.uri)),
            None => String::new(),
        }
    }

    fn open_root(&self, out: &mut BytesMut) {
        let mut tag = String::from("<?xml version=\"1.1\" encoding=\"UTF-8\"?>\n<");
        tag.push_str(&self.qualified(&self.root, self.namespace_on_root));
        if self.namespace_on_root {
            tag.push_str(&self.declaration());
        }
        tag.push('>');
        out.put_slice(tag.as_bytes());
    }

    fn close_root(&self, out: &mut BytesMut) {
        let tag = format!("</{}>\n", self.qualified(&self.root, self.namespace_on_root));
        out.put_slice(tag.as_bytes());
    }
}

impl RowEncoder for XmlEncoder {
    fn content_type(&self) -> &'static str {
        RowsetFormat::Xml.content_type()
    }

    fn begin(&mut self, columns: &[Column], _out: &mut BytesMut) {
        // Root is deferred to the first row so an empty result can be suppressed
        self.columns = columns.iter().map(|c| element_name(&c.name)).collect();
    }

    fn row(&mut self, values: &[Option<String>], out: &mut BytesMut) {
        if self.rows == 0 {
            self.open_root(out);
        }
        self.rows += 1;

        let row_tag = self.qualified(&self.row, self.namespace_on_row);
        let mut text = format!("<{}", row_tag);
        if self.namespace_on_row && !self.namespace_on_root {
            text.push_str(&self.declaration());
        }
        text.push('>');
        for (column, value) in self.columns.iter().zip(values) {
            match value {
                None => {
                    let _ = write!(text, "<{}/>", column);
                }
                Some(v) => {
                    let _ = write!(text, "<{}>{}</{}>", column, xml_escape(v), column);
                }
            }
        }
        let _ = write!(text, "</{}>", row_tag);
        out.put_slice(text.as_bytes());
    }

    fn finish(&mut self, out: &mut BytesMut) {
        if self.rows == 0 {
            if self.suppress_empty_root {
                return;
            }
            self.open_root(out);
        }
        self.close_root(out);
    }
}

/// Escape text content
///
/// Control characters, carriage return and the line separators a parser
/// would normalize are written as numeric references, which XML 1.1 allows.
/// NUL has no representation in any XML version and becomes U+FFFD.
pub fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '\t' | '\n' => escaped.push(c),
            '\0' => escaped.push(char::REPLACEMENT_CHARACTER),
            c if c.is_control() || c == '\u{2028}' => {
                let _ = write!(escaped, "&#x{:X};", c as u32);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

/// Column name made safe as an element name
fn element_name(name: &str) -> String {
    let mut element: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !element.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        element.insert(0, '_');
    }
    element
}

// ═══════════════════════════════════════════════════════════════════════════
// STREAMING
// ═══════════════════════════════════════════════════════════════════════════

/// Render a cursor as the whole response; returns body bytes sent
pub async fn send_rowset<D: BackendDriver, T: Transport + ?Sized>(
    driver: &D,
    session: &mut D::Session,
    transport: &mut T,
    cursor: CursorHandle,
    rowset: &RowsetSettings,
    output: &OutputSettings,
) -> Result<u64> {
    let columns = driver.cursor_columns(session, cursor).await?;
    if columns.len() == 1 && columns[0].kind == ColumnKind::Clob {
        return send_text_column(driver, session, transport, cursor, rowset, output).await;
    }

    let mut encoder = encoder_for(rowset);
    transport.write_status(StatusCode::OK, None).await?;
    transport
        .write_header("Content-Type", encoder.content_type(), HeaderMode::Replace)
        .await?;

    let flush_at = output.download_piece_size.max(1);
    let mut out = BytesMut::with_capacity(flush_at);
    let mut sent = 0u64;
    let mut rows = 0usize;
    encoder.begin(&columns, &mut out);

    while let Some(batch) = driver
        .fetch_rows(session, cursor, rowset.fetch_batch.max(1))
        .await?
    {
        if batch.is_empty() {
            break;
        }
        for row in batch {
            let mut values = Vec::with_capacity(row.len());
            for value in row {
                values.push(value_text(driver, session, value, output.download_piece_size).await?);
            }
            encoder.row(&values, &mut out);
            rows += 1;
            if out.len() >= flush_at {
                transport.write_body(&out).await?;
                sent += out.len() as u64;
                out.clear();
            }
        }
    }

    encoder.finish(&mut out);
    if !out.is_empty() {
        transport.write_body(&out).await?;
        sent += out.len() as u64;
    }
    transport.flush().await?;
    metrics::record_download_bytes("rowset", sent);
    debug!(rows, bytes = sent, format = ?rowset.format, "Rowset sent");
    Ok(sent)
}

/// Stream a single large-text column without encoding
async fn send_text_column<D: BackendDriver, T: Transport + ?Sized>(
    driver: &D,
    session: &mut D::Session,
    transport: &mut T,
    cursor: CursorHandle,
    rowset: &RowsetSettings,
    output: &OutputSettings,
) -> Result<u64> {
    transport.write_status(StatusCode::OK, None).await?;
    transport
        .write_header("Content-Type", &output.default_content_type, HeaderMode::Replace)
        .await?;

    let mut sent = 0u64;
    while let Some(batch) = driver
        .fetch_rows(session, cursor, rowset.fetch_batch.max(1))
        .await?
    {
        if batch.is_empty() {
            break;
        }
        for value in batch.into_iter().flatten() {
            match value {
                Value::Lob(locator) => {
                    let length = driver.lob_length(session, &locator).await?;
                    let mut reader =
                        LobReader::new(driver, locator, length, output.download_piece_size);
                    sent += reader.copy_to(session, transport).await?;
                }
                Value::Text(text) | Value::Number(text) => {
                    transport.write_body(text.as_bytes()).await?;
                    sent += text.len() as u64;
                }
                Value::Null => {}
            }
        }
    }
    transport.flush().await?;
    metrics::record_download_bytes("clob", sent);
    debug!(bytes = sent, "Large text column streamed");
    Ok(sent)
}

async fn value_text<D: BackendDriver>(
    driver: &D,
    session: &mut D::Session,
    value: Value,
    piece_size: usize,
) -> Result<Option<String>> {
    Ok(match value {
        Value::Null => None,
        Value::Text(text) | Value::Number(text) => Some(text),
        Value::Lob(locator) => {
            let length = driver.lob_length(session, &locator).await?;
            let mut reader = LobReader::new(driver, locator, length, piece_size);
            let mut content = Vec::with_capacity(length as usize);
            while let Some(piece) = reader.next_piece(session).await? {
                content.extend_from_slice(&piece);
            }
            Some(String::from_utf8_lossy(&content).into_owned())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quick_xml::events::Event;
    use quick_xml::Reader;

    const AWKWARD: &str = "a,b \"q\" <x> & y\u{1}z";

    fn columns() -> Vec<Column> {
        vec![
            Column {
                name: "id".into(),
                kind: ColumnKind::Number,
            },
            Column {
                name: "label".into(),
                kind: ColumnKind::Text,
            },
        ]
    }

    fn encode(encoder: &mut dyn RowEncoder, rows: &[Vec<Option<String>>]) -> String {
        let mut out = BytesMut::new();
        encoder.begin(&columns(), &mut out);
        for row in rows {
            encoder.row(row, &mut out);
        }
        encoder.finish(&mut out);
        String::from_utf8(out.to_vec()).unwrap()
    }

    /// Minimal RFC 4180 reader for one line of fields
    fn parse_csv_line(line: &str) -> Vec<String> {
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut chars = line.chars().peekable();
        let mut quoted = false;
        while let Some(c) = chars.next() {
            match (c, quoted) {
                ('"', false) if field.is_empty() => quoted = true,
                ('"', true) if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                ('"', true) => quoted = false,
                (',', false) => fields.push(std::mem::take(&mut field)),
                (c, _) => field.push(c),
            }
        }
        fields.push(field);
        fields
    }

    /// Text content of every `<label>` element, as a conforming parser reads it
    fn xml_labels(text: &str) -> Vec<String> {
        let mut reader = Reader::from_str(text);
        let mut labels = Vec::new();
        let mut inside = false;
        loop {
            match reader.read_event().unwrap() {
                Event::Start(e) if e.name().as_ref() == b"label" => {
                    inside = true;
                    labels.push(String::new());
                }
                Event::End(e) if e.name().as_ref() == b"label" => inside = false,
                Event::Text(e) if inside => {
                    labels.last_mut().unwrap().push_str(&e.unescape().unwrap());
                }
                Event::Eof => break,
                _ => {}
            }
        }
        labels
    }

    #[test]
    fn test_csv_round_trip() {
        let text = encode(
            &mut CsvEncoder,
            &[vec![Some("1".into()), Some(AWKWARD.into())], vec![Some("2".into()), None]],
        );
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "id,label");
        assert_eq!(parse_csv_line(lines[1]), vec!["1".to_string(), AWKWARD.to_string()]);
        assert_eq!(lines[2], "2,");
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn test_json_round_trip() {
        let text = encode(
            &mut JsonEncoder::new(None),
            &[vec![Some("1".into()), Some(AWKWARD.into())], vec![Some("x7".into()), None]],
        );
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[0]["id"], serde_json::json!(1));
        assert_eq!(parsed[0]["label"], serde_json::json!(AWKWARD));
        // Not a valid number, so quoted
        assert_eq!(parsed[1]["id"], serde_json::json!("x7"));
        assert_eq!(parsed[1]["label"], serde_json::Value::Null);
    }

    #[test]
    fn test_json_wrapper() {
        let text = encode(&mut JsonEncoder::new(Some("rows".into())), &[]);
        assert_eq!(text, "{\"rows\":[]}");
    }

    #[test]
    fn test_xml_round_trip() {
        let mut encoder = XmlEncoder::new(&RowsetSettings::default());
        let awkward = [AWKWARD, "\r\n\u{85}\u{7f}\u{2028}\t"].concat();
        let text = encode(&mut encoder, &[vec![Some("1".into()), Some(awkward.clone())]]);
        assert!(text.starts_with("<?xml version=\"1.1\""));
        assert!(text.contains("&#x1;"));
        assert!(text.contains("&#xD;\n"));
        assert_eq!(xml_labels(&text), vec![awkward]);
        assert!(text.contains("<ROWSET><ROW><id>1</id>"));
        assert!(text.ends_with("</ROW></ROWSET>\n"));
    }

    #[test]
    fn test_xml_nul_is_replaced() {
        assert_eq!(xml_escape("a\0b"), "a\u{fffd}b");
        let mut encoder = XmlEncoder::new(&RowsetSettings::default());
        let text = encode(&mut encoder, &[vec![Some("1".into()), Some("a\0b".into())]]);
        assert_eq!(xml_labels(&text), vec!["a\u{fffd}b".to_string()]);
    }

    #[test]
    fn test_xml_empty_root() {
        let mut settings = RowsetSettings::default();
        let text = encode(&mut XmlEncoder::new(&settings), &[]);
        assert!(text.ends_with("<ROWSET></ROWSET>\n"));

        settings.xml_suppress_empty_root = true;
        assert_eq!(encode(&mut XmlEncoder::new(&settings), &[]), "");
    }

    #[test]
    fn test_xml_namespace_placement() {
        let mut settings = RowsetSettings::default();
        settings.xml_namespace = Some(XmlNamespace {
            prefix: "r".into(),
            uri: "urn:rows".into(),
        });
        let text = encode(&mut XmlEncoder::new(&settings), &[vec![None, None]]);
        assert!(text.contains("<r:ROWSET xmlns:r=\"urn:rows\"><ROW><id/><label/></ROW></r:ROWSET>"));

        settings.xml_namespace_on_root = false;
        settings.xml_namespace_on_row = true;
        let text = encode(&mut XmlEncoder::new(&settings), &[vec![None, None]]);
        assert!(text.contains("<ROWSET><r:ROW xmlns:r=\"urn:rows\">"));
        assert!(text.contains("</r:ROW></ROWSET>"));
    }

    #[test]
    fn test_element_names() {
        assert_eq!(element_name("ORDER ID"), "ORDER_ID");
        assert_eq!(element_name("1st"), "_1st");
        assert_eq!(element_name(""), "_");
    }
}
