//! Scripted in-memory backend for engine tests
//!
//! Procedures are closures over a [`CallContext`]: they read their binds,
//! print page output, open cursors and create large objects. Sessions can be
//! killed to simulate a backend that dropped idle connections.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use procgate_common::{Credentials, GatewayError, LocationConfig, Result};
use procgate_gateway::binder::CallDescriptor;
use procgate_gateway::driver::{
    ArgShape, BackendDriver, BindValue, Column, ColumnKind, CursorHandle, DeclaredArg, Document, ExecOutcome,
    LobKind, LobLocator, LobPiece, ProcedureSignature, Row, Value,
};
use procgate_gateway::{BufferedTransport, Engine, Environment};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

pub type Procedure = Arc<dyn Fn(&mut CallContext<'_>) -> Result<ExecOutcome> + Send + Sync>;

#[derive(Debug)]
pub struct MockSession {
    pub id: u64,
    pub username: String,
    output: VecDeque<Bytes>,
    /// Variables pushed by the environment call
    cgi: Vec<(String, String)>,
}

#[derive(Debug, Default, Clone)]
pub struct StoredLob {
    pub kind: Option<LobKind>,
    pub name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    pub pieces: usize,
}

#[derive(Default)]
pub struct DriverState {
    pub connects: usize,
    pub disconnects: usize,
    pub describes: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// Text of every executed call, in order
    pub calls: Vec<String>,
    pub lobs: HashMap<String, StoredLob>,
    cursors: HashMap<u64, (Vec<Column>, VecDeque<Row>)>,
    dead: HashSet<u64>,
    next_session: u64,
    next_lob: u64,
    next_cursor: u64,
}

impl DriverState {
    pub fn store_lob(&mut self, kind: LobKind, name: &str, content_type: Option<&str>, data: &[u8]) -> LobLocator {
        self.next_lob += 1;
        let locator = format!("lob-{}", self.next_lob);
        self.lobs.insert(
            locator.clone(),
            StoredLob {
                kind: Some(kind),
                name: name.to_string(),
                content_type: content_type.map(str::to_string),
                data: data.to_vec(),
                pieces: 0,
            },
        );
        LobLocator(locator)
    }
}

/// What a procedure sees of its call
pub struct CallContext<'a> {
    pub call: &'a CallDescriptor,
    pub username: &'a str,
    cgi: &'a [(String, String)],
    output: &'a mut VecDeque<Bytes>,
    pub state: &'a mut DriverState,
}

impl<'a> CallContext<'a> {
    pub fn print(&mut self, text: impl AsRef<[u8]>) {
        self.output.push_back(Bytes::copy_from_slice(text.as_ref()));
    }

    /// Scalar bound for argument `name`
    pub fn text(&self, name: &str) -> Option<String> {
        self.call
            .binds
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
            .and_then(|b| match &b.value {
                BindValue::Text(v) => Some(v.clone()),
                _ => None,
            })
    }

    /// Collection bound for argument `name`
    pub fn texts(&self, name: &str) -> Option<Vec<String>> {
        self.call
            .binds
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
            .and_then(|b| match &b.value {
                BindValue::Texts(v) => Some(v.clone()),
                _ => None,
            })
    }

    /// In-memory file bound for argument `name`
    pub fn blob(&self, name: &str) -> Option<Bytes> {
        self.call
            .binds
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
            .and_then(|b| match &b.value {
                BindValue::Blob(v) => Some(v.clone()),
                _ => None,
            })
    }

    /// Request variable set by the environment call
    pub fn cgi(&self, name: &str) -> Option<&str> {
        self.cgi.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn open_cursor(&mut self, columns: Vec<Column>, rows: Vec<Row>) -> CursorHandle {
        self.state.next_cursor += 1;
        let id = self.state.next_cursor;
        self.state.cursors.insert(id, (columns, rows.into()));
        CursorHandle(id)
    }
}

/// Scripted backend shared by all sessions
#[derive(Default)]
pub struct MockDriver {
    procedures: Mutex<HashMap<String, Procedure>>,
    signatures: Mutex<HashMap<String, ProcedureSignature>>,
    refused_users: Mutex<HashSet<String>>,
    pub state: Mutex<DriverState>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn procedure<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut CallContext<'_>) -> Result<ExecOutcome> + Send + Sync + 'static,
    {
        self.procedures.lock().insert(name.to_ascii_lowercase(), Arc::new(body));
    }

    /// Procedure that prints `page` verbatim
    pub fn page(&self, name: &str, page: &'static str) {
        self.procedure(name, move |ctx| {
            ctx.print(page);
            Ok(ExecOutcome::default())
        });
    }

    pub fn signature(&self, name: &str, args: &[(&str, ArgShape)]) {
        let signature = ProcedureSignature {
            args: args
                .iter()
                .map(|(n, shape)| DeclaredArg {
                    name: n.to_string(),
                    shape: *shape,
                })
                .collect(),
        };
        self.signatures.lock().insert(name.to_ascii_lowercase(), signature);
    }

    pub fn refuse_user(&self, username: &str) {
        self.refused_users.lock().insert(username.to_string());
    }

    /// Make every open session fail its next call as stale
    pub fn kill_sessions(&self) {
        let mut state = self.state.lock();
        let live = state.next_session;
        state.dead.extend(1..=live);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub fn describes(&self) -> usize {
        self.state.lock().describes
    }

    pub fn lob(&self, locator: &str) -> Option<StoredLob> {
        self.state.lock().lobs.get(locator).cloned()
    }

    pub fn store_lob(&self, name: &str, content_type: Option<&str>, data: &[u8]) -> LobLocator {
        self.state.lock().store_lob(LobKind::Blob, name, content_type, data)
    }
}

fn procedure_name(text: &str) -> Option<&str> {
    text.split_once('(').map(|(name, _)| name.trim())
}

/// Whether a call binds a scalar where the signature declares a collection
fn shape_conflict(call: &CallDescriptor, signature: &ProcedureSignature) -> Option<String> {
    call.binds.iter().find_map(|bind| {
        let declared = signature.arg(&bind.name)?;
        match (&bind.value, declared.shape) {
            (BindValue::Text(_), ArgShape::Collection) | (BindValue::Texts(_), ArgShape::Scalar) => Some(format!(
                "PLS-00306: wrong number or types of arguments in call ({})",
                bind.name
            )),
            _ => None,
        }
    })
}

#[async_trait]
impl BackendDriver for MockDriver {
    type Session = MockSession;

    async fn connect(&self, credentials: &Credentials) -> Result<MockSession> {
        if self.refused_users.lock().contains(&credentials.username) {
            return Err(GatewayError::Auth {
                message: format!("ORA-01017: invalid username/password ({})", credentials.username),
                recoverable: true,
            });
        }
        let mut state = self.state.lock();
        state.connects += 1;
        state.next_session += 1;
        Ok(MockSession {
            id: state.next_session,
            username: credentials.username.clone(),
            output: VecDeque::new(),
            cgi: Vec::new(),
        })
    }

    async fn execute(&self, session: &mut MockSession, call: &CallDescriptor) -> Result<ExecOutcome> {
        let mut state = self.state.lock();
        if state.dead.contains(&session.id) {
            return Err(GatewayError::StaleConnection(
                "ORA-03113: end-of-file on communication channel".into(),
            ));
        }
        state.calls.push(call.text.clone());

        let Some(name) = procedure_name(&call.text).map(str::to_ascii_lowercase) else {
            // Plain statement
            return Ok(ExecOutcome::default());
        };
        if name == "owa.init_cgi_env" {
            let names = call.binds.get(1).map(|b| b.value.clone());
            let values = call.binds.get(2).map(|b| b.value.clone());
            if let (Some(BindValue::Texts(names)), Some(BindValue::Texts(values))) = (names, values) {
                session.cgi = names.into_iter().zip(values).collect();
            }
            return Ok(ExecOutcome::default());
        }
        if let Some(signature) = self.signatures.lock().get(&name) {
            if let Some(message) = shape_conflict(call, signature) {
                return Err(GatewayError::ShapeMismatch {
                    procedure: name,
                    message,
                });
            }
        }
        let Some(procedure) = self.procedures.lock().get(&name).cloned() else {
            return Err(GatewayError::backend(
                6550,
                format!("PLS-00201: identifier '{}' must be declared", name),
                None,
            ));
        };

        session.output.clear();
        let mut ctx = CallContext {
            call,
            username: &session.username,
            cgi: &session.cgi,
            output: &mut session.output,
            state: &mut *state,
        };
        (*procedure)(&mut ctx)
    }

    async fn describe(&self, _session: &mut MockSession, procedure: &str) -> Result<ProcedureSignature> {
        self.state.lock().describes += 1;
        Ok(self
            .signatures
            .lock()
            .get(&procedure.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    async fn read_output(&self, session: &mut MockSession, max_bytes: usize) -> Result<Option<Bytes>> {
        let Some(mut piece) = session.output.pop_front() else {
            return Ok(None);
        };
        if piece.len() > max_bytes {
            let rest = piece.split_off(max_bytes);
            session.output.push_front(rest);
        }
        Ok(Some(piece))
    }

    async fn cursor_columns(&self, _session: &mut MockSession, cursor: CursorHandle) -> Result<Vec<Column>> {
        self.state
            .lock()
            .cursors
            .get(&cursor.0)
            .map(|(columns, _)| columns.clone())
            .ok_or_else(|| GatewayError::backend(1001, "ORA-01001: invalid cursor", None))
    }

    async fn fetch_rows(
        &self,
        _session: &mut MockSession,
        cursor: CursorHandle,
        max_rows: usize,
    ) -> Result<Option<Vec<Row>>> {
        let mut state = self.state.lock();
        let (_, rows) = state
            .cursors
            .get_mut(&cursor.0)
            .ok_or_else(|| GatewayError::backend(1001, "ORA-01001: invalid cursor", None))?;
        if rows.is_empty() {
            return Ok(None);
        }
        let take = max_rows.max(1).min(rows.len());
        Ok(Some(rows.drain(..take).collect()))
    }

    async fn lob_create(
        &self,
        _session: &mut MockSession,
        kind: LobKind,
        name: &str,
        content_type: Option<&str>,
    ) -> Result<LobLocator> {
        Ok(self.state.lock().store_lob(kind, name, content_type, &[]))
    }

    async fn lob_write(&self, _session: &mut MockSession, locator: &LobLocator, piece: LobPiece) -> Result<()> {
        let mut state = self.state.lock();
        let lob = state
            .lobs
            .get_mut(&locator.0)
            .ok_or_else(|| GatewayError::backend(22275, "invalid LOB locator", None))?;
        lob.data.extend_from_slice(piece.data());
        lob.pieces += 1;
        Ok(())
    }

    async fn lob_length(&self, _session: &mut MockSession, locator: &LobLocator) -> Result<u64> {
        self.state
            .lock()
            .lobs
            .get(&locator.0)
            .map(|lob| lob.data.len() as u64)
            .ok_or_else(|| GatewayError::backend(22275, "invalid LOB locator", None))
    }

    async fn lob_read(
        &self,
        _session: &mut MockSession,
        locator: &LobLocator,
        offset: u64,
        len: usize,
    ) -> Result<Bytes> {
        let state = self.state.lock();
        let lob = state
            .lobs
            .get(&locator.0)
            .ok_or_else(|| GatewayError::backend(22275, "invalid LOB locator", None))?;
        let start = (offset as usize).min(lob.data.len());
        let end = start.saturating_add(len).min(lob.data.len());
        Ok(Bytes::copy_from_slice(&lob.data[start..end]))
    }

    async fn commit(&self, _session: &mut MockSession) -> Result<()> {
        self.state.lock().commits += 1;
        Ok(())
    }

    async fn rollback(&self, _session: &mut MockSession) -> Result<()> {
        self.state.lock().rollbacks += 1;
        Ok(())
    }

    async fn disconnect(&self, _session: MockSession) {
        self.state.lock().disconnects += 1;
    }
}

pub fn text_column(name: &str) -> Column {
    Column {
        name: name.to_string(),
        kind: ColumnKind::Text,
    }
}

pub fn number_column(name: &str) -> Column {
    Column {
        name: name.to_string(),
        kind: ColumnKind::Number,
    }
}

pub fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

pub fn document(locator: LobLocator, content_type: &str, file_name: &str) -> ExecOutcome {
    ExecOutcome {
        cursor: None,
        document: Some(Document {
            locator,
            content_type: Some(content_type.to_string()),
            file_name: Some(file_name.to_string()),
        }),
    }
}

/// Location `app` logging in as `scott`
pub fn location() -> LocationConfig {
    let mut config = LocationConfig::default();
    config.name = "app".into();
    config.username = Some("scott".into());
    config.password = Some("tiger".into());
    config.pool.capacity = 2;
    config.pool.acquire_timeout_ms = 200;
    config.registry.enabled = false;
    config
}

pub fn engine(driver: &Arc<MockDriver>, config: LocationConfig) -> Engine<MockDriver> {
    let mut engine = Engine::new(Arc::clone(driver));
    engine.add_location(config).unwrap();
    engine
}

/// GET `/app<path>?<query>`
pub fn get(path: &str, query: &str) -> BufferedTransport {
    request("GET", path, query, &[])
}

pub fn request(method: &str, path: &str, query: &str, extra: &[(&str, &str)]) -> BufferedTransport {
    let mut env = Environment::from_pairs([
        ("REQUEST_METHOD", method),
        ("SCRIPT_NAME", "/app"),
        ("PATH_INFO", path),
        ("QUERY_STRING", query),
    ]);
    for (name, value) in extra {
        env.set(*name, *value);
    }
    BufferedTransport::new(env)
}

pub fn body_text(transport: &BufferedTransport) -> String {
    String::from_utf8_lossy(transport.body()).into_owned()
}
