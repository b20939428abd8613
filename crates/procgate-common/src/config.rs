//! Configuration for gateway locations
//!
//! A location is one mount point of the gateway (e.g. `/app`) with its own
//! backend credentials, session pool and output rules. Values come from
//! serde defaults, then an optional file, then `PROCGATE__`-style
//! environment variables.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for one gateway location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Location name, used as the URL prefix and in logs/metrics
    pub name: String,
    /// How backend credentials are obtained
    pub auth_mode: AuthMode,
    /// Static backend user (AuthMode::Static)
    pub username: Option<String>,
    /// Static backend password (AuthMode::Static)
    pub password: Option<String>,
    /// Backend service or connect string
    pub connect_string: Option<String>,
    /// Realm announced in authentication challenges
    pub realm: String,
    /// Procedure invoked when the path names none
    pub default_procedure: Option<String>,
    /// Calling convention when the request does not select flexible mode
    pub call_mode: DefaultCallMode,
    /// Procedure name prefixes that may never be invoked (case-insensitive)
    pub excluded_prefixes: Vec<String>,
    /// Include backend diagnostics in error pages
    pub diagnostics: bool,
    /// Redirect failed requests here instead of rendering an error page
    pub error_redirect_url: Option<String>,
    pub pool: PoolSettings,
    pub bind: BindSettings,
    pub upload: UploadSettings,
    pub output: OutputSettings,
    pub rowset: RowsetSettings,
    pub charset: CharsetSettings,
    pub registry: RegistrySettings,
    pub statements: StatementSettings,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            name: "app".into(),
            auth_mode: AuthMode::Static,
            username: None,
            password: None,
            connect_string: None,
            realm: "procgate".into(),
            default_procedure: None,
            call_mode: DefaultCallMode::Keyword,
            excluded_prefixes: vec![
                "sys.".into(),
                "dbms_".into(),
                "utl_".into(),
                "owa_util.".into(),
            ],
            diagnostics: false,
            error_redirect_url: None,
            pool: PoolSettings::default(),
            bind: BindSettings::default(),
            upload: UploadSettings::default(),
            output: OutputSettings::default(),
            rowset: RowsetSettings::default(),
            charset: CharsetSettings::default(),
            registry: RegistrySettings::default(),
            statements: StatementSettings::default(),
        }
    }
}

impl LocationConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::Config("location name must not be empty".into()));
        }
        if self.pool.capacity == 0 {
            return Err(GatewayError::Config(format!(
                "location '{}': pool capacity must be at least 1",
                self.name
            )));
        }
        if self.bind.max_scalar_width == 0 {
            return Err(GatewayError::Config(format!(
                "location '{}': max_scalar_width must be at least 1",
                self.name
            )));
        }
        if self.output.mode == OutputMode::Rowset && self.rowset.cursor_argument.trim().is_empty() {
            return Err(GatewayError::Config(format!(
                "location '{}': rowset output requires a cursor argument name",
                self.name
            )));
        }
        if self.upload.target == UploadTarget::FileCache && self.upload.cache_root.is_none() {
            return Err(GatewayError::Config(format!(
                "location '{}': file-cache uploads require upload.cache_root",
                self.name
            )));
        }
        Ok(())
    }
}

/// Where backend credentials come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Credentials from configuration
    Static,
    /// Credentials from the request's Basic Authorization header
    Basic,
}

/// Calling convention used by default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultCallMode {
    Keyword,
    Positional,
}

/// Session pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of pooled sessions (also the bound on concurrent leases)
    pub capacity: usize,
    /// Maximum wait for a free slot in milliseconds
    pub acquire_timeout_ms: u64,
    /// Fail the request when no slot frees up instead of using an unpooled session
    pub abort_on_exhaustion: bool,
    /// Idle seconds after which an available session is closed
    pub idle_timeout_secs: u64,
    /// Seconds between background purges (0 disables the purger)
    pub purge_interval_secs: u64,
    /// Route requests carrying the affinity cookie to the same session
    pub session_affinity: bool,
    /// Cookie whose value is the affinity key
    pub affinity_cookie: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 10,
            acquire_timeout_ms: 5_000,
            abort_on_exhaustion: true,
            idle_timeout_secs: 300,
            purge_interval_secs: 60,
            session_affinity: false,
            affinity_cookie: "PROCGATE_SESSION".into(),
        }
    }
}

/// Call binding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindSettings {
    /// Scalars wider than this (bytes) are split into suffix-numbered pieces
    pub max_scalar_width: usize,
    /// Hard cap on bind slots per call
    pub max_binds: usize,
    /// Never describe-and-retry on an argument shape mismatch
    pub strict: bool,
}

impl Default for BindSettings {
    fn default() -> Self {
        Self {
            max_scalar_width: 32_767,
            max_binds: 1_000,
            strict: false,
        }
    }
}

/// Destination of uploaded files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTarget {
    /// Keep file content in memory and bind it as a blob
    Memory,
    /// Write every file piecewise into backend large objects, whatever its
    /// argument is declared as
    LargeObject,
    /// Stage to a temporary file promoted into the file cache
    FileCache,
}

/// Request body and upload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Largest accepted request body
    pub max_upload_bytes: u64,
    /// Largest file accepted by the in-memory target
    pub memory_threshold: usize,
    /// Destination of uploaded files whose argument is not declared as a
    /// large object; those always go to one
    pub target: UploadTarget,
    /// Root directory of the file cache (UploadTarget::FileCache)
    pub cache_root: Option<PathBuf>,
    /// Bound on a part's header block and on the opening boundary search
    pub max_header_bytes: usize,
    /// Bytes requested from the transport per read
    pub read_chunk: usize,
    /// Bytes per large-object write
    pub lob_piece_size: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: 100 * 1024 * 1024,
            memory_threshold: 64 * 1024,
            target: UploadTarget::Memory,
            cache_root: None,
            max_header_bytes: 8 * 1024,
            read_chunk: 32 * 1024,
            lob_piece_size: 32 * 1024,
        }
    }
}

/// How the procedure's result is turned into a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// The procedure writes a page (optional header block + body)
    Page,
    /// The procedure opens a cursor rendered by a row encoder
    Rowset,
}

/// Response rendering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub mode: OutputMode,
    /// Content type of successful pages that declare none
    pub default_content_type: String,
    /// Content type of gateway error pages
    pub error_content_type: String,
    /// Bytes requested from the backend per output read
    pub read_piece_size: usize,
    /// Header block must end within this many bytes to be recognized
    pub header_lookahead_bytes: usize,
    /// Bytes per piece when streaming large objects to the client
    pub download_piece_size: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            mode: OutputMode::Page,
            default_content_type: "text/html".into(),
            error_content_type: "text/plain".into(),
            read_piece_size: 32 * 1024,
            header_lookahead_bytes: 64 * 1024,
            download_piece_size: 32 * 1024,
        }
    }
}

/// Row encoding formats for cursor output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowsetFormat {
    Csv,
    Json,
    Xml,
}

impl RowsetFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            RowsetFormat::Csv => "text/csv",
            RowsetFormat::Json => "application/json",
            RowsetFormat::Xml => "text/xml",
        }
    }
}

/// XML namespace applied to generated elements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmlNamespace {
    pub prefix: String,
    pub uri: String,
}

/// Cursor output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RowsetSettings {
    pub format: RowsetFormat,
    /// Name of the OUT cursor argument appended to the call
    pub cursor_argument: String,
    /// Rows fetched per round trip
    pub fetch_batch: usize,
    /// Wrap the JSON array in an object under this key
    pub json_wrapper: Option<String>,
    pub xml_root: String,
    pub xml_row: String,
    /// Emit nothing at all for an empty result instead of an empty root
    pub xml_suppress_empty_root: bool,
    pub xml_namespace: Option<XmlNamespace>,
    pub xml_namespace_on_root: bool,
    pub xml_namespace_on_row: bool,
}

impl Default for RowsetSettings {
    fn default() -> Self {
        Self {
            format: RowsetFormat::Json,
            cursor_argument: "p_rows".into(),
            fetch_batch: 100,
            json_wrapper: None,
            xml_root: "ROWSET".into(),
            xml_row: "ROW".into(),
            xml_suppress_empty_root: false,
            xml_namespace: None,
            xml_namespace_on_root: true,
            xml_namespace_on_row: false,
        }
    }
}

/// Character set handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CharsetSettings {
    /// Character set of text produced by the backend
    pub backend_charset: String,
    /// Character set announced to clients
    pub client_charset: String,
    /// Character sets where every character is exactly one byte
    pub single_byte_charsets: Vec<String>,
}

impl Default for CharsetSettings {
    fn default() -> Self {
        Self {
            backend_charset: "UTF-8".into(),
            client_charset: "UTF-8".into(),
            single_byte_charsets: vec![
                "US-ASCII".into(),
                "ISO-8859-1".into(),
                "ISO-8859-15".into(),
                "WINDOWS-1252".into(),
            ],
        }
    }
}

/// Cross-process pool registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub enabled: bool,
    /// Backing file of the shared region; process-local when unset
    pub path: Option<PathBuf>,
    /// Size of the shared region
    pub size_bytes: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            size_bytes: 64 * 1024,
        }
    }
}

/// Auxiliary statements run around each call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatementSettings {
    /// Pushes the request environment; binds are count, names, values
    pub environment: Option<String>,
    /// Runs before the procedure
    pub before: Option<String>,
    /// Runs after the procedure
    pub after: Option<String>,
    /// Runs before a session returns to the pool
    pub reset: Option<String>,
}

impl Default for StatementSettings {
    fn default() -> Self {
        Self {
            environment: Some("owa.init_cgi_env(:b1, :b2, :b3)".into()),
            before: None,
            after: None,
            reset: None,
        }
    }
}

/// Load configuration from environment variables
pub fn load_from_env<T: for<'de> Deserialize<'de>>(prefix: &str) -> Result<T> {
    Ok(config::Config::builder()
        .add_source(config::Environment::with_prefix(prefix).separator("__"))
        .build()?
        .try_deserialize()?)
}

/// Load configuration from a file, overridden by environment variables
pub fn load_from_file<T: for<'de> Deserialize<'de>>(path: &Path, prefix: &str) -> Result<T> {
    Ok(config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix(prefix).separator("__"))
        .build()?
        .try_deserialize()?)
}
