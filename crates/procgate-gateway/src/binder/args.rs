//! Request argument collection
//!
//! Arguments arrive as `name=value` pairs from the query string, an
//! URL-encoded body, or multipart fields (see [`crate::stream::multipart`]).
//! Repeated names become collections in input order.

use super::CallMode;
use bytes::Bytes;
use procgate_common::{GatewayError, Result};

/// Value of one argument
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Scalar(String),
    Collection(Vec<String>),
    /// File contents held in memory, bound as a binary large object
    Blob(Bytes),
}

impl ArgValue {
    pub fn is_collection(&self) -> bool {
        matches!(self, ArgValue::Collection(_))
    }

    /// Textual values in order (a blob has none)
    pub fn texts(&self) -> Vec<&str> {
        match self {
            ArgValue::Scalar(v) => vec![v.as_str()],
            ArgValue::Collection(vs) => vs.iter().map(String::as_str).collect(),
            ArgValue::Blob(_) => Vec::new(),
        }
    }
}

/// One named argument
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
    /// Widest value in bytes
    pub max_width: usize,
    /// Value is the stored name or locator of an uploaded file
    pub is_file: bool,
}

/// Ordered, case-insensitively keyed argument set of one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgumentTable {
    entries: Vec<Argument>,
}

impl ArgumentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Argument> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Argument> {
        self.entries.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Position `name` has, or would take if added now
    pub fn position(&self, name: &str) -> usize {
        self.entries
            .iter()
            .position(|a| a.name.eq_ignore_ascii_case(name))
            .unwrap_or(self.entries.len())
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Argument> {
        self.entries
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Add a text value; a repeated name turns the entry into a collection
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.insert(name.into(), value.into(), false)
    }

    /// Add the stored name or locator of an uploaded file
    pub fn push_file(&mut self, name: impl Into<String>, stored: impl Into<String>) -> Result<()> {
        self.insert(name.into(), stored.into(), true)
    }

    /// Add in-memory file contents
    pub fn push_blob(&mut self, name: impl Into<String>, data: Bytes) -> Result<()> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(GatewayError::StreamingFormat(format!(
                "file field '{}' repeated; in-memory uploads bind one file per name",
                name
            )));
        }
        self.entries.push(Argument {
            max_width: data.len(),
            value: ArgValue::Blob(data),
            name,
            is_file: true,
        });
        Ok(())
    }

    fn insert(&mut self, name: String, value: String, is_file: bool) -> Result<()> {
        match self.get_mut(&name) {
            Some(existing) => {
                existing.max_width = existing.max_width.max(value.len());
                existing.is_file |= is_file;
                match &mut existing.value {
                    ArgValue::Collection(values) => values.push(value),
                    ArgValue::Scalar(first) => {
                        let first = std::mem::take(first);
                        existing.value = ArgValue::Collection(vec![first, value]);
                    }
                    ArgValue::Blob(_) => {
                        return Err(GatewayError::StreamingFormat(format!(
                            "field '{}' repeats an in-memory file upload",
                            name
                        )))
                    }
                }
            }
            None => self.entries.push(Argument {
                max_width: value.len(),
                value: ArgValue::Scalar(value),
                name,
                is_file,
            }),
        }
        Ok(())
    }

    /// Turn a scalar into a singleton collection; false if not a scalar
    pub fn promote(&mut self, name: &str) -> bool {
        match self.get_mut(name) {
            Some(arg) => match &mut arg.value {
                ArgValue::Scalar(v) => {
                    let v = std::mem::take(v);
                    arg.value = ArgValue::Collection(vec![v]);
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Turn a singleton collection back into a scalar; false otherwise
    pub fn demote(&mut self, name: &str) -> bool {
        match self.get_mut(name) {
            Some(arg) => match &mut arg.value {
                ArgValue::Collection(vs) if vs.len() == 1 => {
                    let v = vs.pop().unwrap_or_default();
                    arg.value = ArgValue::Scalar(v);
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Promote by position (positional calls carry no declared names)
    pub fn promote_at(&mut self, index: usize) -> bool {
        match self.entries.get(index).map(|a| a.name.clone()) {
            Some(name) => self.promote(&name),
            None => false,
        }
    }

    pub fn demote_at(&mut self, index: usize) -> bool {
        match self.entries.get(index).map(|a| a.name.clone()) {
            Some(name) => self.demote(&name),
            None => false,
        }
    }
}

/// Whether `name` only uses characters valid in a procedure argument name
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '#' | '.'))
}

/// Decode one URL-encoded component (`%XX` escapes and `+` for space)
pub fn decode_component(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() >= i + 3
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(GatewayError::Encoding(format!(
                    "malformed percent-escape at byte {} of '{}'",
                    i, raw
                )));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| GatewayError::Encoding(format!("invalid UTF-8 in '{}': {}", raw, e)))
}

/// Parse `name=value&...` pairs into `table`
pub fn collect_into(table: &mut ArgumentTable, input: &str, mode: CallMode) -> Result<()> {
    for pair in input.split('&').filter(|p| !p.is_empty()) {
        let (raw_name, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = decode_component(raw_name)?;
        let value = decode_component(raw_value)?;
        if name.is_empty() {
            continue;
        }
        if !mode.is_flexible() && !is_valid_name(&name) {
            return Err(GatewayError::Encoding(format!(
                "invalid argument name '{}'",
                name
            )));
        }
        table.push(name, value)?;
    }
    Ok(())
}

/// Build the argument table from the query string and an URL-encoded body
pub fn collect(query: &str, body: Option<&[u8]>, mode: CallMode) -> Result<ArgumentTable> {
    let mut table = ArgumentTable::new();
    collect_into(&mut table, query, mode)?;
    if let Some(body) = body {
        let text = std::str::from_utf8(body)
            .map_err(|e| GatewayError::Encoding(format!("request body is not UTF-8: {}", e)))?;
        collect_into(&mut table, text.trim_end_matches(&['\r', '\n'][..]), mode)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_repeated_names_become_collection() {
        let table = collect("name=a&name=b&x=1", None, CallMode::Keyword).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get("name").unwrap().value,
            ArgValue::Collection(vec!["a".into(), "b".into()])
        );
        assert_eq!(table.get("x").unwrap().value, ArgValue::Scalar("1".into()));
    }

    #[test]
    fn test_names_match_case_insensitively() {
        let table = collect("Id=1&ID=2&id=3", None, CallMode::Keyword).unwrap();
        let arg = table.get("id").unwrap();
        assert_eq!(arg.name, "Id");
        assert_eq!(arg.value.texts(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_decoding() {
        let table = collect("q=a+b%26c&e=%C3%A9", None, CallMode::Keyword).unwrap();
        assert_eq!(table.get("q").unwrap().value, ArgValue::Scalar("a b&c".into()));
        assert_eq!(table.get("e").unwrap().value, ArgValue::Scalar("é".into()));
        assert_eq!(table.get("e").unwrap().max_width, 2);
    }

    #[test]
    fn test_malformed_escape() {
        for input in ["a=%2", "a=%zz", "a%=1"] {
            let err = collect(input, None, CallMode::Keyword).unwrap_err();
            assert!(matches!(err, GatewayError::Encoding(_)), "{}", input);
        }
    }

    #[test]
    fn test_name_validation_skipped_in_flexible_mode() {
        assert!(collect("bad-name=1", None, CallMode::Keyword).is_err());
        let table = collect("bad-name=1", None, CallMode::Flexible { reduced: false }).unwrap();
        assert!(table.get("bad-name").is_some());
    }

    #[test]
    fn test_body_merges_with_query() {
        let table = collect("a=1", Some(b"a=2&b=3\r\n"), CallMode::Keyword).unwrap();
        assert_eq!(table.get("a").unwrap().value.texts(), vec!["1", "2"]);
        assert_eq!(table.get("b").unwrap().value, ArgValue::Scalar("3".into()));
    }

    #[test]
    fn test_collection_never_reverts() {
        let mut table = collect("a=1&a=2", None, CallMode::Keyword).unwrap();
        assert!(!table.demote("a"));
        table.push("a", "3").unwrap();
        assert!(table.get("a").unwrap().value.is_collection());
    }

    #[test]
    fn test_promote_and_demote_singleton() {
        let mut table = collect("a=1", None, CallMode::Keyword).unwrap();
        assert!(table.promote("A"));
        assert_eq!(table.get("a").unwrap().value, ArgValue::Collection(vec!["1".into()]));
        assert!(table.demote("a"));
        assert_eq!(table.get("a").unwrap().value, ArgValue::Scalar("1".into()));
    }

    #[test]
    fn test_empty_value_and_bare_name() {
        let table = collect("a=&b&&c=x", None, CallMode::Keyword).unwrap();
        assert_eq!(table.get("a").unwrap().value, ArgValue::Scalar(String::new()));
        assert_eq!(table.get("b").unwrap().value, ArgValue::Scalar(String::new()));
        assert_eq!(table.len(), 3);
    }
}
