//! Backend driver interface
//!
//! The gateway drives a backend RPC driver through this trait: connect, bind
//! and execute a call, read the page output, fetch cursor rows, describe a
//! procedure, and move large objects piecewise. Concrete drivers live outside
//! this crate.
//!
//! Drivers report failures as [`GatewayError`] values. The engine depends on
//! three of them being classified correctly:
//!
//! - `ShapeMismatch` when a scalar was bound where a collection was declared
//!   (or the reverse); triggers the describe-and-retry loop
//! - `StaleConnection` when the session died while idle in the pool; triggers
//!   one reconnect
//! - `Auth { recoverable }` when the backend refused the credentials

use crate::binder::call::CallDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use procgate_common::{Credentials, Result};

/// How a bind slot is transferred to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindKind {
    /// Single character value
    Scalar,
    /// Array of character values
    Collection,
    /// Binary large object
    LargeObjectBlob,
    /// Character large object
    LargeObjectClob,
    /// OUT cursor opened by the procedure
    Cursor,
    /// OUT character value naming something produced by the call
    OutputName,
}

/// Value carried by a bind slot
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Text(String),
    Texts(Vec<String>),
    Blob(Bytes),
    Locator(LobLocator),
    /// Placeholder for an OUT bind
    Output,
}

/// One positional bind slot of a call
#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    /// Placeholder name without the leading ':' (e.g. `b3`)
    pub placeholder: String,
    /// Argument name the slot was produced from
    pub name: String,
    pub value: BindValue,
    /// Widest element in bytes (buffer sizing)
    pub declared_width: usize,
    /// Element count for collections, 1 otherwise
    pub element_count: usize,
    pub kind: BindKind,
}

/// Result of executing a call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutcome {
    /// Cursor bound to the OUT cursor argument, if any
    pub cursor: Option<CursorHandle>,
    /// Document the procedure asked the gateway to download
    pub document: Option<Document>,
}

/// Opaque cursor identifier issued by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorHandle(pub u64);

/// Opaque large-object locator issued by the driver
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LobLocator(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobKind {
    Blob,
    Clob,
}

/// A stored document scheduled for download
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub locator: LobLocator,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

/// A piece of a piecewise large-object write
#[derive(Debug, Clone, PartialEq)]
pub enum LobPiece {
    First(Bytes),
    Next(Bytes),
    Last(Bytes),
    /// Whole object in one write
    Only(Bytes),
}

impl LobPiece {
    pub fn data(&self) -> &Bytes {
        match self {
            LobPiece::First(b) | LobPiece::Next(b) | LobPiece::Last(b) | LobPiece::Only(b) => b,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, LobPiece::Last(_) | LobPiece::Only(_))
    }
}

/// Declared shape of a procedure argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    Scalar,
    Collection,
    LargeObject,
    Cursor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredArg {
    pub name: String,
    pub shape: ArgShape,
}

/// Procedure signature as reported by describe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcedureSignature {
    pub args: Vec<DeclaredArg>,
}

impl ProcedureSignature {
    /// Case-insensitive lookup of a declared argument
    pub fn arg(&self, name: &str) -> Option<&DeclaredArg> {
        self.args.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }
}

/// Type of a cursor column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Number,
    Date,
    Clob,
    Blob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

/// A single fetched column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Number(String),
    Lob(LobLocator),
}

pub type Row = Vec<Value>;

/// Primitives the gateway drives against a backend
#[async_trait]
pub trait BackendDriver: Send + Sync + 'static {
    /// Backend session handle held by a pool slot
    type Session: Send + 'static;

    async fn connect(&self, credentials: &Credentials) -> Result<Self::Session>;

    async fn execute(&self, session: &mut Self::Session, call: &CallDescriptor) -> Result<ExecOutcome>;

    async fn describe(&self, session: &mut Self::Session, procedure: &str) -> Result<ProcedureSignature>;

    /// Next piece of the page written by the last call; `None` once drained
    async fn read_output(&self, session: &mut Self::Session, max_bytes: usize) -> Result<Option<Bytes>>;

    async fn cursor_columns(&self, session: &mut Self::Session, cursor: CursorHandle) -> Result<Vec<Column>>;

    /// Up to `max_rows` rows; `None` at end of data
    async fn fetch_rows(
        &self,
        session: &mut Self::Session,
        cursor: CursorHandle,
        max_rows: usize,
    ) -> Result<Option<Vec<Row>>>;

    async fn lob_create(
        &self,
        session: &mut Self::Session,
        kind: LobKind,
        name: &str,
        content_type: Option<&str>,
    ) -> Result<LobLocator>;

    async fn lob_write(&self, session: &mut Self::Session, locator: &LobLocator, piece: LobPiece) -> Result<()>;

    async fn lob_length(&self, session: &mut Self::Session, locator: &LobLocator) -> Result<u64>;

    /// Read `len` bytes at byte `offset` (zero-based)
    async fn lob_read(
        &self,
        session: &mut Self::Session,
        locator: &LobLocator,
        offset: u64,
        len: usize,
    ) -> Result<Bytes>;

    async fn commit(&self, session: &mut Self::Session) -> Result<()>;

    async fn rollback(&self, session: &mut Self::Session) -> Result<()>;

    async fn disconnect(&self, session: Self::Session);
}
