//! procgate Gateway
//!
//! Serves HTTP requests by invoking stored procedures in a relational
//! backend:
//! - Pooled backend sessions, shared-memory slot registry
//! - Argument binding with describe-and-retry on shape mismatch
//! - Multipart uploads into memory, large objects or a file cache
//! - Header/body reassembly of procedure output, CSV/JSON/XML rowsets
//! - Large-object downloads with byte ranges
//!
//! The backend itself is reached through [`driver::BackendDriver`] and the
//! client through [`transport::Transport`].

pub mod binder;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod http_api;
pub mod location;
pub mod metrics;
pub mod output;
pub mod pool;
pub mod stream;
pub mod telemetry;
pub mod transport;

pub use driver::BackendDriver;
pub use engine::Engine;
pub use location::LocationContext;
pub use transport::{BufferedTransport, Environment, Transport};
