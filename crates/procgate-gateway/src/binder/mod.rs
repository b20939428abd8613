//! Call binder: request arguments to procedure invocation
//!
//! - [`args`]: collect and decode arguments into an [`ArgumentTable`]
//! - [`call`]: render call text and bind slots for a calling convention
//! - [`adapt`]: describe-and-retry on argument shape mismatch
//! - [`describe`]: cache of learned procedure shapes

pub mod adapt;
pub mod args;
pub mod call;
pub mod describe;

pub use adapt::{invoke, Adaptation, Invocation, Invoked};
pub use args::{collect, ArgValue, Argument, ArgumentTable};
pub use call::{build, build_with_cursor, environment_call, CallDescriptor};
pub use describe::{DescribeCache, DescribeEntry};

use once_cell::sync::Lazy;
use procgate_common::config::DefaultCallMode;
use procgate_common::{GatewayError, Result};
use regex::Regex;

static PROCEDURE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_$#.]+$").expect("constant pattern"));

/// Calling convention of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// `proc(name=>:b1, ...)`
    Keyword,
    /// `proc(:b1, ...)` in argument order
    Positional,
    /// All arguments as parallel name/value collections, with a leading
    /// count unless `reduced`
    Flexible { reduced: bool },
}

impl CallMode {
    pub fn is_flexible(self) -> bool {
        matches!(self, CallMode::Flexible { .. })
    }
}

impl From<DefaultCallMode> for CallMode {
    fn from(mode: DefaultCallMode) -> Self {
        match mode {
            DefaultCallMode::Keyword => CallMode::Keyword,
            DefaultCallMode::Positional => CallMode::Positional,
        }
    }
}

/// Split a requested procedure into its name and calling convention
///
/// A leading `!` asks for the flexible form.
pub fn resolve_procedure(requested: &str, default: DefaultCallMode) -> (String, CallMode) {
    match requested.strip_prefix('!') {
        Some(name) => (name.to_string(), CallMode::Flexible { reduced: false }),
        None => (requested.to_string(), default.into()),
    }
}

/// Reject malformed or excluded procedure names
pub fn validate_procedure(name: &str, excluded_prefixes: &[String]) -> Result<()> {
    if !PROCEDURE_NAME.is_match(name) {
        return Err(GatewayError::Forbidden(format!("procedure name '{}'", name)));
    }
    let lower = name.to_ascii_lowercase();
    if let Some(prefix) = excluded_prefixes
        .iter()
        .find(|p| lower.starts_with(&p.to_ascii_lowercase()))
    {
        return Err(GatewayError::Forbidden(format!(
            "procedure '{}' (excluded prefix '{}')",
            name, prefix
        )));
    }
    Ok(())
}
