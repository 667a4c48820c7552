//! Shared building blocks for the shader compile server.
//!
//! - [`protocol`]: request/response framing over any async stream
//! - [`request`]: XML job documents
//! - [`hash`]: 128-bit content hashes and the `HashStop`-aware request key
//! - [`types`]: job states, protocol versions, job kinds
//! - [`config`]: `config.ini` parsing
//! - [`logging`]: tracing subscriber setup
//! - [`testing`]: structured test logging helpers

pub mod config;
pub mod hash;
pub mod logging;
pub mod protocol;
pub mod request;
pub mod testing;
pub mod types;

pub use hash::{HASH_STOP_MARKER, Hash128, request_hash};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use protocol::{ProtocolError, Response};
pub use request::{Request, RequestBuilder, RequestError, RequiredAttribute};
pub use types::{JobState, JobStatus, JobType, ProtocolVersion};
