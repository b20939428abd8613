//! Describe-and-retry adaptation
//!
//! A call whose argument shapes do not match the procedure (scalar bound
//! where a collection is declared, or the reverse) is retried exactly once
//! after describing the procedure and reconciling the argument table. The
//! learned shape goes into the [`DescribeCache`] so the next call to the same
//! procedure is built right the first time.

use super::args::{ArgValue, ArgumentTable};
use super::call::{build_with_cursor, CallDescriptor};
use super::describe::{DescribeCache, DescribeEntry};
use super::CallMode;
use crate::driver::{ArgShape, BackendDriver, ExecOutcome, ProcedureSignature};
use procgate_common::config::BindSettings;
use procgate_common::{GatewayError, Result};
use tracing::{debug, info, warn};

/// Verdict on one execution attempt
#[derive(Debug)]
pub enum Adaptation {
    Success(ExecOutcome),
    /// Rebuild from this table and try again
    RetryWithPromotion(ArgumentTable),
    Fatal(GatewayError),
}

/// Fixed parameters of one invocation
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub procedure: &'a str,
    pub mode: CallMode,
    pub settings: &'a BindSettings,
    /// OUT cursor argument appended for rowset output
    pub cursor: Option<&'a str>,
}

/// Result of a successful invocation
#[derive(Debug)]
pub struct Invoked {
    pub outcome: ExecOutcome,
    /// Call as finally executed
    pub call: CallDescriptor,
    /// Whether the adaptation retry was needed
    pub adapted: bool,
}

/// Promote arguments the cache knows to be collections
pub fn apply_cached(table: &mut ArgumentTable, entry: &DescribeEntry) {
    for name in &entry.collection_args {
        table.promote(name);
    }
}

/// Calling form after consulting the cache
pub fn effective_mode(mode: CallMode, entry: Option<&DescribeEntry>) -> CallMode {
    match (mode, entry) {
        (CallMode::Flexible { reduced }, Some(entry)) => CallMode::Flexible {
            reduced: entry.reduced_flexible.unwrap_or(reduced),
        },
        _ => mode,
    }
}

/// Reconcile the supplied arguments against a described signature
///
/// Returns the adjusted table, the shape to cache, and whether anything
/// changed.
pub fn reconcile(
    table: &ArgumentTable,
    signature: &ProcedureSignature,
    mode: CallMode,
) -> (ArgumentTable, DescribeEntry, bool) {
    let mut adjusted = table.clone();
    let mut changed = false;
    let declared: Vec<_> = signature
        .args
        .iter()
        .filter(|a| a.shape != ArgShape::Cursor)
        .collect();

    let mut entry = DescribeEntry::from_signature(signature);
    match mode {
        CallMode::Flexible { reduced } => {
            let learned = declared.len() == 2;
            entry.reduced_flexible = Some(learned);
            changed = learned != reduced;
        }
        CallMode::Keyword | CallMode::Positional => {
            let names: Vec<String> = table.iter().map(|a| a.name.clone()).collect();
            for (index, name) in names.iter().enumerate() {
                let shape = match mode {
                    CallMode::Keyword => signature.arg(name).map(|a| a.shape),
                    _ => declared.get(index).map(|a| a.shape),
                };
                let Some(shape) = shape else { continue };
                let is_collection = adjusted
                    .get(name)
                    .map(|a| a.value.is_collection())
                    .unwrap_or(false);
                match shape {
                    ArgShape::Collection if !is_collection => {
                        changed |= adjusted.promote(name);
                    }
                    ArgShape::Scalar if is_collection => {
                        changed |= adjusted.demote(name);
                    }
                    _ => {}
                }
                if shape == ArgShape::Collection {
                    entry.collection_args.insert(name.to_ascii_lowercase());
                }
            }
        }
    }
    (adjusted, entry, changed)
}

fn with_call_text(error: GatewayError, call: &CallDescriptor) -> GatewayError {
    match error {
        GatewayError::Backend {
            code,
            message,
            call_text: None,
        } => GatewayError::Backend {
            code,
            message,
            call_text: Some(call.text.clone()),
        },
        other => other,
    }
}

/// Judge one attempt and decide whether to adapt
#[allow(clippy::too_many_arguments)]
pub async fn assess<D: BackendDriver>(
    driver: &D,
    session: &mut D::Session,
    cache: &DescribeCache,
    invocation: &Invocation<'_>,
    table: &ArgumentTable,
    mode: CallMode,
    attempt: u32,
    result: Result<ExecOutcome>,
    call: &CallDescriptor,
) -> Adaptation {
    let (procedure, message) = match result {
        Ok(outcome) => return Adaptation::Success(outcome),
        Err(GatewayError::ShapeMismatch { procedure, message }) => (procedure, message),
        Err(e) => return Adaptation::Fatal(with_call_text(e, call)),
    };

    if attempt > 0 || invocation.settings.strict {
        warn!(
            procedure = %procedure,
            attempt,
            strict = invocation.settings.strict,
            "Argument shape mismatch is final"
        );
        return Adaptation::Fatal(GatewayError::ShapeMismatchFatal { procedure, message });
    }

    let signature = match driver.describe(session, invocation.procedure).await {
        Ok(signature) => signature,
        Err(e) => return Adaptation::Fatal(e),
    };
    let (adjusted, learned, changed) = reconcile(table, &signature, mode);
    cache.merge(invocation.procedure, learned);

    if !changed {
        warn!(procedure = %procedure, "Describe found nothing to adapt");
        return Adaptation::Fatal(GatewayError::ShapeMismatchFatal { procedure, message });
    }
    info!(
        procedure = %procedure,
        declared = signature.args.len(),
        "Retrying call with adapted argument shapes"
    );
    Adaptation::RetryWithPromotion(adjusted)
}

/// Build and execute the call, adapting once on a shape mismatch
pub async fn invoke<D: BackendDriver>(
    driver: &D,
    session: &mut D::Session,
    cache: &DescribeCache,
    invocation: &Invocation<'_>,
    mut table: ArgumentTable,
) -> Result<Invoked> {
    let cached = cache.get(invocation.procedure);
    if let Some(entry) = &cached {
        apply_cached(&mut table, entry);
        debug!(procedure = invocation.procedure, "Applied cached argument shapes");
    }
    let mut mode = effective_mode(invocation.mode, cached.as_deref());

    for attempt in 0..2 {
        let call = build_with_cursor(
            invocation.procedure,
            &table,
            mode,
            invocation.settings,
            invocation.cursor,
        )?;
        let result = driver.execute(session, &call).await;
        match assess(driver, session, cache, invocation, &table, mode, attempt, result, &call).await {
            Adaptation::Success(outcome) => {
                return Ok(Invoked {
                    outcome,
                    call,
                    adapted: attempt > 0,
                })
            }
            Adaptation::RetryWithPromotion(next) => {
                table = next;
                mode = effective_mode(invocation.mode, cache.get(invocation.procedure).as_deref());
            }
            Adaptation::Fatal(e) => return Err(e),
        }
    }
    Err(GatewayError::Internal(format!(
        "adaptation loop for {} ended without a verdict",
        invocation.procedure
    )))
}
