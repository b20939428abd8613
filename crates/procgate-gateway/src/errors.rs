//! Error classification for the procgate engine
//!
//! This module turns a [`GatewayError`] into everything needed to answer the
//! client:
//! - HTTP status and a user-facing message with an optional hint
//! - A category label for logs and metrics
//! - Diagnostic detail (call text, allocation size) shown only when enabled

use http::StatusCode;
use procgate_common::GatewayError;
use std::fmt;

/// Error category for classification and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed request, upload or arguments
    Request,
    /// Procedure missing, excluded or given wrong arguments
    Procedure,
    /// Backend raised an application error
    Backend,
    /// Credentials rejected
    Auth,
    /// Pool or memory limits
    Resource,
    /// Session or client connection lost
    Connection,
    /// Internal/unknown errors
    Internal,
}

impl ErrorCategory {
    pub fn label(self) -> &'static str {
        match self {
            ErrorCategory::Request => "request",
            ErrorCategory::Procedure => "procedure",
            ErrorCategory::Backend => "backend",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified error with all information needed for an error response
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    /// Stable code from [`GatewayError::code`]
    pub code: &'static str,
    pub category: ErrorCategory,
    pub status: StatusCode,
    /// User-friendly message
    pub message: String,
    /// Optional hint for the user
    pub hint: Option<String>,
    /// Diagnostic detail, only rendered when diagnostics are enabled
    pub detail: Option<String>,
    /// Original raw error (for logging)
    pub raw_error: String,
}

impl ClassifiedError {
    pub fn new(
        error: &GatewayError,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: error.code(),
            category,
            status: error.status(),
            message: message.into(),
            hint: None,
            detail: None,
            raw_error: error.to_string(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Format for user display (includes hint if present)
    pub fn user_message(&self) -> String {
        let mut msg = self.message.clone();
        if let Some(ref hint) = self.hint {
            msg.push_str("\nHINT: ");
            msg.push_str(hint);
        }
        msg
    }

    /// Body of the error page
    pub fn render_page(&self, diagnostics: bool) -> String {
        let mut page = format!(
            "{} {}\n\n{}\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("Error"),
            self.user_message()
        );
        if diagnostics {
            page.push_str("\nCODE: ");
            page.push_str(self.code);
            page.push('\n');
            if let Some(ref detail) = self.detail {
                page.push_str("DETAIL: ");
                page.push_str(detail);
                page.push('\n');
            }
            page.push_str("ERROR: ");
            page.push_str(&sanitize(&self.raw_error));
            page.push('\n');
        }
        page
    }
}

/// Classify an engine error into a structured error response
pub fn classify_error(error: &GatewayError) -> ClassifiedError {
    match error {
        GatewayError::Backend {
            code,
            message,
            call_text,
        } => {
            let classified = classify_backend_message(error, *code, message);
            match call_text {
                Some(text) => classified.with_detail(format!("Call: {}", text)),
                None => classified,
            }
        }
        GatewayError::ShapeMismatchFatal { procedure, .. } => ClassifiedError::new(
            error,
            ErrorCategory::Procedure,
            format!("Arguments do not match the signature of {}", procedure),
        )
        .with_hint("Check argument names and whether repeated arguments are declared as arrays."),
        GatewayError::ShapeMismatch { procedure, .. } => ClassifiedError::new(
            error,
            ErrorCategory::Procedure,
            format!("Arguments do not match the signature of {}", procedure),
        ),
        GatewayError::Forbidden(what) => ClassifiedError::new(
            error,
            ErrorCategory::Procedure,
            format!("Access to {} is not allowed", what),
        ),
        GatewayError::NotFound(what) => {
            ClassifiedError::new(error, ErrorCategory::Procedure, format!("{} was not found", what))
        }
        GatewayError::Auth { message, .. } => {
            ClassifiedError::new(error, ErrorCategory::Auth, "Authentication failed")
                .with_detail(message.clone())
        }
        GatewayError::PoolExhausted { location, .. } => ClassifiedError::new(
            error,
            ErrorCategory::Resource,
            format!("Location {} is busy", location),
        )
        .with_hint("All backend sessions are in use. Retry the request shortly."),
        GatewayError::OutOfMemory { size } => {
            ClassifiedError::new(error, ErrorCategory::Resource, "Request exceeded available memory")
                .with_detail(format!("Failed allocation of {} bytes", size))
        }
        GatewayError::PayloadTooLarge { limit, .. } => ClassifiedError::new(
            error,
            ErrorCategory::Request,
            format!("Request body exceeds the limit of {} bytes", limit),
        ),
        GatewayError::TooManyArguments { limit, .. } => ClassifiedError::new(
            error,
            ErrorCategory::Request,
            format!("Too many arguments, at most {} are accepted", limit),
        ),
        GatewayError::StreamingFormat(message) => {
            ClassifiedError::new(error, ErrorCategory::Request, "Malformed upload")
                .with_detail(message.clone())
        }
        GatewayError::Encoding(message) => {
            ClassifiedError::new(error, ErrorCategory::Request, "Malformed request arguments")
                .with_detail(message.clone())
        }
        GatewayError::RangeNotSatisfiable { length } => ClassifiedError::new(
            error,
            ErrorCategory::Request,
            format!("Requested range lies outside the {} byte document", length),
        ),
        GatewayError::Transport(message) => {
            ClassifiedError::new(error, ErrorCategory::Connection, "Request could not be read")
                .with_detail(message.clone())
        }
        GatewayError::StaleConnection(_) => ClassifiedError::new(
            error,
            ErrorCategory::Connection,
            "Connection to the backend was lost",
        )
        .with_hint("Retry the request."),
        GatewayError::Config(_)
        | GatewayError::Io(_)
        | GatewayError::Internal(_) => {
            ClassifiedError::new(error, ErrorCategory::Internal, "Internal gateway error")
        }
    }
}

/// Classify a backend-raised error by its message text
fn classify_backend_message(error: &GatewayError, code: i32, message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();
    let core = extract_core_message(message);

    if lower.contains("must be declared")
        || lower.contains("does not exist")
        || lower.contains("not found")
    {
        return ClassifiedError::new(error, ErrorCategory::Procedure, core)
            .with_hint("Verify the procedure name in the URL.");
    }

    if lower.contains("wrong number or types of arguments") {
        return ClassifiedError::new(error, ErrorCategory::Procedure, core)
            .with_hint("Check the argument names sent with the request.");
    }

    if lower.contains("insufficient privileges") || lower.contains("permission denied") {
        return ClassifiedError::new(error, ErrorCategory::Auth, core)
            .with_hint("The session user may not execute this procedure.");
    }

    if lower.contains("out of memory") || lower.contains("memory limit") {
        return ClassifiedError::new(error, ErrorCategory::Resource, core);
    }

    let classified = ClassifiedError::new(error, ErrorCategory::Backend, core);
    if code != 0 {
        classified.with_hint(format!("Backend error code {}", code))
    } else {
        classified
    }
}

/// Extract the core message from a verbose backend error string
fn extract_core_message(error: &str) -> String {
    // Keep the first line; the rest is usually a backend stack trace
    let mut msg = error.lines().next().unwrap_or("").trim().to_string();

    if msg.len() > 500 {
        let mut cut = 497;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        msg = format!("{}...", &msg[..cut]);
    }
    msg
}

/// Strip control characters except newlines and tabs
fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}
