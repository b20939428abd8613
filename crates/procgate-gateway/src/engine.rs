//! Gateway engine
//!
//! Runs one request against a location:
//!
//! ```text
//! path -> procedure -> arguments -> pool acquire -> connect
//!      -> before statement -> environment -> invoke (describe-and-retry)
//!      -> after statement -> page | rowset | document -> commit -> release
//! ```
//!
//! A reused pooled session that turns out to be dead is replaced once and the
//! call repeated. A recoverable authentication failure is retried once with
//! the request's own Basic credentials, then answered with a challenge. Any
//! failure rolls back before the slot is released.

use crate::binder::args::collect_into;
use crate::binder::{
    self, resolve_procedure, validate_procedure, ArgumentTable, CallDescriptor, CallMode, DescribeEntry, Invocation,
};
use crate::driver::BackendDriver;
use crate::errors::{classify_error, ErrorCategory};
use crate::location::{open_registry, BackendSession, LocationContext};
use crate::metrics;
use crate::output::{send_page, send_rowset, PageOptions};
use crate::pool::{SharedPoolRegistry, SlotLease};
use crate::stream::{
    boundary_from_content_type, check_declared_length, read_form_body, receive_multipart, send_lob, ByteRange,
    CacheSink, CacheStore, Download, FileSink, LobSink, MemorySink, RoutingSink,
};
use crate::transport::{Environment, HeaderMode, Transport};
use http::StatusCode;
use procgate_common::config::{AuthMode, OutputMode, UploadSettings, UploadTarget};
use procgate_common::{Credentials, GatewayError, LocationConfig, Result};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Lease<S> = SlotLease<BackendSession<S>>;

/// Request arguments gathered before the call
#[derive(Debug)]
enum Arguments {
    Ready(ArgumentTable),
    /// Multipart body still unread; files are routed by the procedure's
    /// declared argument types, which needs a session
    Deferred { table: ArgumentTable, boundary: String },
    /// The body went into large objects of a session that failed
    Consumed,
}

impl Arguments {
    /// Whether the call can be repeated on a fresh session
    fn is_replayable(&self) -> bool {
        !matches!(self, Arguments::Consumed)
    }
}

struct CallRequest {
    procedure: String,
    mode: CallMode,
    environment: Environment,
}

/// What a successful call left for the lease
#[derive(Debug, Default)]
struct Served {
    affinity: Option<String>,
}

/// Request engine over a backend driver and its configured locations
pub struct Engine<D: BackendDriver> {
    driver: Arc<D>,
    locations: HashMap<String, Arc<LocationContext<D::Session>>>,
    registry: Option<Arc<SharedPoolRegistry>>,
}

impl<D: BackendDriver> Engine<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            locations: HashMap::new(),
            registry: None,
        }
    }

    /// Share `registry` between all locations added afterwards
    pub fn with_registry(mut self, registry: Arc<SharedPoolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Configure a location from `config`
    pub fn add_location(&mut self, config: LocationConfig) -> Result<()> {
        if self.locations.contains_key(&config.name) {
            return Err(GatewayError::Config(format!(
                "location '{}' is configured twice",
                config.name
            )));
        }
        if self.registry.is_none() {
            self.registry = open_registry(&config.registry)?;
        }
        let ctx = LocationContext::new(config, self.registry.clone())?;
        self.insert_location(ctx);
        Ok(())
    }

    /// Add a prepared location context
    pub fn insert_location(&mut self, ctx: LocationContext<D::Session>) {
        self.locations.insert(ctx.name().to_string(), Arc::new(ctx));
    }

    pub fn location(&self, name: &str) -> Option<&Arc<LocationContext<D::Session>>> {
        self.locations.get(name)
    }

    pub fn location_names(&self) -> impl Iterator<Item = &str> {
        self.locations.keys().map(String::as_str)
    }

    /// Largest request body any location accepts
    pub fn max_upload_bytes(&self) -> u64 {
        self.locations
            .values()
            .map(|ctx| ctx.config.upload.max_upload_bytes)
            .max()
            .unwrap_or(UploadSettings::default().max_upload_bytes)
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Serve one request for `location`
    ///
    /// Failures become error responses; `Err` means the transport itself
    /// failed and no complete response could be written.
    pub async fn handle<T: Transport + ?Sized>(&self, location: &str, transport: &mut T) -> Result<()> {
        let started = Instant::now();
        let Some(ctx) = self.locations.get(location).cloned() else {
            let err = GatewayError::NotFound(format!("location '{}'", location));
            return self.respond_error(None, transport, err).await;
        };

        let result = self.serve(&ctx, transport).await;
        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(()) => {
                metrics::record_request(ctx.name(), "success", elapsed);
                Ok(())
            }
            Err(e) => {
                metrics::record_request(ctx.name(), classify_error(&e).category.label(), elapsed);
                self.respond_error(Some(&*ctx), transport, e).await
            }
        }
    }

    async fn serve<T: Transport + ?Sized>(
        &self,
        ctx: &LocationContext<D::Session>,
        transport: &mut T,
    ) -> Result<()> {
        let config = &ctx.config;
        let environment = transport.environment().clone();
        let path = environment.path_info().trim_start_matches('/').to_string();

        if path.contains('/') {
            return match &ctx.cache {
                Some(cache) => self.serve_cached_file(ctx, cache.as_ref(), &path, transport).await,
                None => Err(GatewayError::NotFound(format!("/{}", path))),
            };
        }

        let requested = if path.is_empty() {
            config
                .default_procedure
                .clone()
                .ok_or_else(|| GatewayError::NotFound("no procedure requested".into()))?
        } else {
            path
        };
        let (procedure, mode) = resolve_procedure(&requested, config.call_mode);
        validate_procedure(&procedure, &config.excluded_prefixes)?;

        let mut credentials = credentials_for(config, &environment)?;
        let mut args = self.prepare_arguments(ctx, transport, mode).await?;

        let key = if config.pool.session_affinity {
            environment.cookie(&config.pool.affinity_cookie).map(str::to_string)
        } else {
            None
        };
        let request = CallRequest {
            procedure,
            mode,
            environment,
        };
        let mut lease = ctx.pool.acquire(key.as_deref()).await?;

        let mut stale_retried = false;
        let mut auth_retried = false;
        let result = loop {
            let attempt = match self.ensure_session(&mut lease, &credentials).await {
                Ok(session) => self.run_call(ctx, session, transport, &request, &mut args).await,
                Err(e) => Err(e),
            };
            let error = match attempt {
                Ok(served) => break Ok(served),
                Err(e) => e,
            };

            if let Some(held) = lease.session_mut() {
                if let Err(e) = self.driver.rollback(&mut held.session).await {
                    debug!(location = %ctx.name(), "Rollback failed: {}", e);
                }
            }

            let replayable = !transport.is_committed() && args.is_replayable();
            if replayable && !stale_retried && error.is_retryable_on_stale() && lease.is_reused() {
                stale_retried = true;
                metrics::record_stale_retry(ctx.name());
                warn!(
                    location = %ctx.name(),
                    procedure = %request.procedure,
                    "Pooled session is stale, reconnecting: {}",
                    error
                );
                self.discard_session(&mut lease).await;
                continue;
            }
            if replayable && !auth_retried && matches!(error, GatewayError::Auth { recoverable: true, .. }) {
                let fresh = basic_credentials(config, &request.environment).filter(|c| *c != credentials);
                if let Some(fresh) = fresh {
                    auth_retried = true;
                    info!(
                        location = %ctx.name(),
                        user = %fresh.username,
                        "Retrying with request credentials"
                    );
                    credentials = fresh;
                    self.discard_session(&mut lease).await;
                    continue;
                }
            }
            break Err(error);
        };

        match result {
            Ok(served) => {
                let mut succeeded = true;
                if let (Some(reset), Some(held)) = (&config.statements.reset, lease.session_mut()) {
                    let call = CallDescriptor::statement(reset.clone(), Vec::new());
                    if let Err(e) = self.driver.execute(&mut held.session, &call).await {
                        warn!(location = %ctx.name(), "Reset statement failed, dropping session: {}", e);
                        succeeded = false;
                    }
                }
                if let Some(key) = served.affinity {
                    lease.set_affinity((!key.is_empty()).then_some(key));
                }
                self.release(ctx, lease, succeeded).await;
                Ok(())
            }
            Err(e) => {
                self.release(ctx, lease, false).await;
                Err(e)
            }
        }
    }

    /// Gather query and body arguments that do not need a session
    async fn prepare_arguments<T: Transport + ?Sized>(
        &self,
        ctx: &LocationContext<D::Session>,
        transport: &mut T,
        mode: CallMode,
    ) -> Result<Arguments> {
        let upload = &ctx.config.upload;
        let mut table = ArgumentTable::new();
        collect_into(&mut table, transport.environment().query_string(), mode)?;

        let content_type = transport.environment().content_type().unwrap_or("").to_string();
        let media = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match media.as_str() {
            "multipart/form-data" => {
                let boundary = boundary_from_content_type(&content_type)?;
                check_declared_length(transport, upload)?;
                if upload.target == UploadTarget::FileCache && ctx.cache.is_none() {
                    return Err(GatewayError::Config(format!(
                        "location '{}' has no file cache",
                        ctx.name()
                    )));
                }
                return Ok(Arguments::Deferred { table, boundary });
            }
            "application/x-www-form-urlencoded" => {
                let body = read_form_body(transport, upload).await?;
                let text = std::str::from_utf8(&body)
                    .map_err(|e| GatewayError::Encoding(format!("request body is not UTF-8: {}", e)))?;
                collect_into(&mut table, text.trim_end_matches(&['\r', '\n'][..]), mode)?;
            }
            _ => {}
        }
        Ok(Arguments::Ready(table))
    }

    /// Make sure the lease holds a session connected as `credentials`
    async fn ensure_session<'l>(
        &self,
        lease: &'l mut Lease<D::Session>,
        credentials: &Credentials,
    ) -> Result<&'l mut D::Session> {
        let other_user = lease
            .session_mut()
            .map_or(false, |held| held.username != credentials.username);
        if lease.affinity_replaced() || other_user {
            debug!(other_user, "Replacing pooled session");
            self.discard_session(lease).await;
        }
        if !lease.has_session() {
            let session = self.driver.connect(credentials).await?;
            lease.set_session(BackendSession {
                session,
                username: credentials.username.clone(),
            });
        }
        lease
            .session_mut()
            .map(|held| &mut held.session)
            .ok_or_else(|| GatewayError::internal("lease holds no session after connect"))
    }

    /// One attempt at the call and its response, committed on success
    async fn run_call<T: Transport + ?Sized>(
        &self,
        ctx: &LocationContext<D::Session>,
        session: &mut D::Session,
        transport: &mut T,
        request: &CallRequest,
        args: &mut Arguments,
    ) -> Result<Served> {
        let config = &ctx.config;
        let driver = self.driver.as_ref();

        if let Some(before) = &config.statements.before {
            driver
                .execute(session, &CallDescriptor::statement(before.clone(), Vec::new()))
                .await?;
        }

        // Described before the body is read so a stale session fails while
        // the request can still be repeated
        let shapes = match args {
            Arguments::Deferred { .. } if config.upload.target != UploadTarget::LargeObject => {
                Some(self.argument_shapes(ctx, session, &request.procedure).await?)
            }
            _ => None,
        };

        let table = match std::mem::replace(args, Arguments::Consumed) {
            Arguments::Ready(table) => {
                *args = Arguments::Ready(table.clone());
                table
            }
            Arguments::Deferred { mut table, boundary } => {
                let upload = &config.upload;
                let shapes = shapes.unwrap_or_default();
                let fallback: Option<Box<dyn FileSink + '_>> = match upload.target {
                    UploadTarget::Memory => Some(Box::new(MemorySink::new(upload.memory_threshold))),
                    UploadTarget::FileCache => {
                        let cache = ctx.cache.as_ref().ok_or_else(|| {
                            GatewayError::Config(format!("location '{}' has no file cache", ctx.name()))
                        })?;
                        Some(Box::new(CacheSink::new(cache.as_ref())))
                    }
                    UploadTarget::LargeObject => None,
                };
                let lob = LobSink::new(driver, session, upload.lob_piece_size);
                let mut sink = RoutingSink::new(lob, fallback, &shapes, request.mode);
                receive_multipart(
                    transport,
                    &boundary,
                    upload,
                    upload.max_header_bytes,
                    request.mode,
                    &mut table,
                    &mut sink,
                )
                .await?;
                if !sink.wrote_large_objects() {
                    // Nothing of the upload lives in the session
                    *args = Arguments::Ready(table.clone());
                }
                table
            }
            Arguments::Consumed => {
                return Err(GatewayError::internal("request body was already consumed"));
            }
        };

        if let Some(text) = &config.statements.environment {
            let call = binder::environment_call(text, &request.environment)?;
            driver.execute(session, &call).await?;
        }

        let rowset = config.output.mode == OutputMode::Rowset;
        let invocation = Invocation {
            procedure: &request.procedure,
            mode: request.mode,
            settings: &config.bind,
            cursor: rowset.then_some(config.rowset.cursor_argument.as_str()),
        };
        let invoked = match binder::invoke(driver, session, &ctx.describe, &invocation, table).await {
            Ok(invoked) => invoked,
            Err(e) => {
                if matches!(e, GatewayError::ShapeMismatchFatal { .. }) && !config.bind.strict {
                    metrics::record_adaptation(ctx.name(), false);
                }
                return Err(e);
            }
        };
        if invoked.adapted {
            metrics::record_adaptation(ctx.name(), true);
        }

        if let Some(after) = &config.statements.after {
            driver
                .execute(session, &CallDescriptor::statement(after.clone(), Vec::new()))
                .await?;
        }

        let outcome = invoked.outcome;
        let mut served = Served::default();
        if let Some(document) = outcome.document {
            let content_type = document
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            send_lob(
                driver,
                session,
                transport,
                Download {
                    locator: &document.locator,
                    content_type,
                    file_name: document.file_name.as_deref(),
                    range: request.environment.get("HTTP_RANGE"),
                    piece_size: config.output.download_piece_size,
                },
            )
            .await?;
        } else if let Some(cursor) = outcome.cursor {
            send_rowset(driver, session, transport, cursor, &config.rowset, &config.output).await?;
        } else if rowset {
            return Err(GatewayError::backend(
                0,
                format!("{} returned no cursor", request.procedure),
                Some(invoked.call.text.clone()),
            ));
        } else {
            let page = send_page(
                driver,
                session,
                transport,
                PageOptions {
                    output: &config.output,
                    charset: &config.charset,
                    affinity_cookie: config
                        .pool
                        .session_affinity
                        .then_some(config.pool.affinity_cookie.as_str()),
                },
            )
            .await?;
            served.affinity = page.affinity;
        }

        driver.commit(session).await?;
        debug!(
            location = %ctx.name(),
            procedure = %request.procedure,
            adapted = invoked.adapted,
            "Call completed"
        );
        Ok(served)
    }

    /// Learned argument shapes of `procedure`, describing it when unknown
    async fn argument_shapes(
        &self,
        ctx: &LocationContext<D::Session>,
        session: &mut D::Session,
        procedure: &str,
    ) -> Result<Arc<DescribeEntry>> {
        if let Some(entry) = ctx.describe.get(procedure) {
            return Ok(entry);
        }
        let signature = self.driver.describe(session, procedure).await?;
        Ok(ctx.describe.merge(procedure, DescribeEntry::from_signature(&signature)))
    }

    /// Stream a file from the location's cache
    async fn serve_cached_file<T: Transport + ?Sized>(
        &self,
        ctx: &LocationContext<D::Session>,
        cache: &dyn CacheStore,
        logical: &str,
        transport: &mut T,
    ) -> Result<()> {
        let not_found = || GatewayError::NotFound(format!("/{}", logical));
        let path = cache.map_logical_to_physical(logical).ok_or_else(not_found)?;
        let mut file = cache.open_cached_file(&path).await?.ok_or_else(not_found)?;
        let length = file.metadata().await?.len();
        let range = match transport.environment().get("HTTP_RANGE") {
            Some(header) => ByteRange::parse(header, length)?,
            None => None,
        };

        let (start, count) = match range {
            Some(range) => {
                transport.write_status(StatusCode::PARTIAL_CONTENT, None).await?;
                transport
                    .write_header("Content-Range", &range.content_range(length), HeaderMode::Replace)
                    .await?;
                (range.start, range.len())
            }
            None => {
                transport.write_status(StatusCode::OK, None).await?;
                (0, length)
            }
        };
        transport
            .write_header("Content-Length", &count.to_string(), HeaderMode::Replace)
            .await?;
        transport
            .write_header("Content-Type", content_type_for(&path), HeaderMode::Replace)
            .await?;
        transport
            .write_header("Accept-Ranges", "bytes", HeaderMode::Replace)
            .await?;

        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        let mut buf = vec![0u8; ctx.config.output.download_piece_size.max(1)];
        let mut remaining = count;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            transport.write_body(&buf[..n]).await?;
            remaining -= n as u64;
        }
        transport.flush().await?;
        metrics::record_download_bytes("file_cache", count - remaining);
        debug!(location = %ctx.name(), path = %path.display(), bytes = count - remaining, "Cached file sent");
        Ok(())
    }

    /// Write the error response for `error`
    async fn respond_error<T: Transport + ?Sized>(
        &self,
        ctx: Option<&LocationContext<D::Session>>,
        transport: &mut T,
        error: GatewayError,
    ) -> Result<()> {
        let classified = classify_error(&error);
        let location = ctx.map(|c| c.name()).unwrap_or("-");
        match classified.category {
            ErrorCategory::Request | ErrorCategory::Procedure | ErrorCategory::Auth => {
                warn!(location, code = classified.code, "Request failed: {}", classified.raw_error)
            }
            _ => error!(location, code = classified.code, "Request failed: {}", classified.raw_error),
        }

        if transport.is_committed() {
            // Part of the response is out; all that is left is to stop
            return if error.is_transport() { Err(error) } else { Ok(()) };
        }

        let diagnostics = ctx.map_or(false, |c| c.config.diagnostics);
        let redirect = ctx.and_then(|c| c.config.error_redirect_url.as_deref());
        match (&error, redirect) {
            (GatewayError::Auth { .. }, _) => {
                let challenge = match ctx {
                    Some(c) => c.realm.challenge(c.name()),
                    None => format!("Basic realm=\"{}\"", location),
                };
                transport.write_status(StatusCode::UNAUTHORIZED, None).await?;
                transport
                    .write_header("WWW-Authenticate", &challenge, HeaderMode::Replace)
                    .await?;
            }
            (GatewayError::RangeNotSatisfiable { length }, _) => {
                transport.write_status(classified.status, None).await?;
                transport
                    .write_header("Content-Range", &format!("bytes */{}", length), HeaderMode::Replace)
                    .await?;
            }
            (_, Some(url)) => {
                transport.write_status(StatusCode::FOUND, None).await?;
                transport.write_header("Location", url, HeaderMode::Replace).await?;
                transport.write_header("Content-Length", "0", HeaderMode::Replace).await?;
                transport.flush().await?;
                return Ok(());
            }
            _ => transport.write_status(classified.status, None).await?,
        }

        let content_type = ctx.map_or("text/plain", |c| c.config.output.error_content_type.as_str());
        let page = classified.render_page(diagnostics);
        transport
            .write_header("Content-Type", content_type, HeaderMode::Replace)
            .await?;
        transport
            .write_header("Content-Length", &page.len().to_string(), HeaderMode::Replace)
            .await?;
        transport.write_body(page.as_bytes()).await?;
        transport.flush().await
    }

    async fn discard_session(&self, lease: &mut Lease<D::Session>) {
        if let Some(old) = lease.take_session() {
            self.driver.disconnect(old.session).await;
        }
    }

    async fn release(&self, ctx: &LocationContext<D::Session>, lease: Lease<D::Session>, succeeded: bool) {
        if let Some(leftover) = ctx.pool.release(lease, succeeded) {
            self.driver.disconnect(leftover.session).await;
        }
    }

    /// Close sessions idle beyond each location's timeout, and any session
    /// left behind by a dropped lease
    pub async fn purge_idle(&self) -> usize {
        let mut purged = 0;
        for ctx in self.locations.values() {
            purged += self.purge_location(ctx).await;
        }
        purged
    }

    async fn purge_location(&self, ctx: &LocationContext<D::Session>) -> usize {
        let max_idle = Duration::from_secs(ctx.config.pool.idle_timeout_secs);
        for orphan in ctx.pool.take_orphans() {
            self.driver.disconnect(orphan.session).await;
        }
        let mut purged = 0;
        for held in ctx.pool.purge(max_idle) {
            self.driver.disconnect(held.session).await;
            purged += 1;
        }
        purged
    }

    /// Start a background purger for every location whose
    /// `pool.purge_interval_secs` is not 0; abort the handles to stop them
    pub fn spawn_purgers(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut purgers = Vec::new();
        for ctx in self.locations.values() {
            let secs = ctx.config.pool.purge_interval_secs;
            if secs == 0 {
                debug!(location = %ctx.name(), "Idle purger disabled");
                continue;
            }
            let engine = Arc::clone(&self);
            let ctx = Arc::clone(ctx);
            purgers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(secs));
                // The first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let purged = engine.purge_location(&ctx).await;
                    if purged > 0 {
                        debug!(location = %ctx.name(), purged, "Idle purge pass");
                    }
                }
            }));
        }
        purgers
    }

    /// Close every pooled session of every location
    pub async fn shutdown(&self) {
        for ctx in self.locations.values() {
            for held in ctx.pool.shutdown().into_iter().chain(ctx.pool.take_orphans()) {
                self.driver.disconnect(held.session).await;
            }
        }
        info!("Engine shut down");
    }
}

/// Backend credentials for a request
fn credentials_for(config: &LocationConfig, environment: &Environment) -> Result<Credentials> {
    match config.auth_mode {
        AuthMode::Static => Ok(Credentials::new(
            config.username.clone().unwrap_or_default(),
            config.password.clone().unwrap_or_default(),
        )
        .with_connect_string(config.connect_string.clone())),
        AuthMode::Basic => {
            let header = environment.get("HTTP_AUTHORIZATION").ok_or_else(|| GatewayError::Auth {
                message: "credentials required".into(),
                recoverable: false,
            })?;
            Ok(Credentials::from_basic_header(header)?.with_connect_string(config.connect_string.clone()))
        }
    }
}

/// Credentials from the request's Basic authorization header, if any
fn basic_credentials(config: &LocationConfig, environment: &Environment) -> Option<Credentials> {
    let header = environment.get("HTTP_AUTHORIZATION")?;
    Credentials::from_basic_header(header)
        .ok()
        .map(|c| c.with_connect_string(config.connect_string.clone()))
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "text/xml",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
