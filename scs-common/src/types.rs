//! Common types shared by the compile server and its clients.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a job as reported to the client in the response state byte.
///
/// The discriminants are the wire values. Clients distinguish success,
/// cache hit and failure purely by this ordinal, so the order is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobState {
    None = 0,
    Done = 1,
    JobNotFound = 2,
    CacheHit = 3,
    Error = 4,
    ErrorCompile = 5,
    ErrorCompress = 6,
    ErrorFileIo = 7,
    ErrorInvalidProfile = 8,
    ErrorInvalidPlatform = 9,
    ErrorInvalidProgram = 10,
    ErrorInvalidEntry = 11,
    ErrorInvalidCompileFlags = 12,
    ErrorInvalidShaderRequestLine = 13,
}

impl JobState {
    pub const ALL: [JobState; 14] = [
        JobState::None,
        JobState::Done,
        JobState::JobNotFound,
        JobState::CacheHit,
        JobState::Error,
        JobState::ErrorCompile,
        JobState::ErrorCompress,
        JobState::ErrorFileIo,
        JobState::ErrorInvalidProfile,
        JobState::ErrorInvalidPlatform,
        JobState::ErrorInvalidProgram,
        JobState::ErrorInvalidEntry,
        JobState::ErrorInvalidCompileFlags,
        JobState::ErrorInvalidShaderRequestLine,
    ];

    /// Wire byte for this state.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Decode a wire byte, `None` for values outside the known range.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    /// Whether this state is one of the error states.
    pub fn is_error(self) -> bool {
        self >= JobState::Error
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Done => "DONE",
            Self::JobNotFound => "JOBNOTFOUND",
            Self::CacheHit => "CACHEHIT",
            Self::Error => "ERROR",
            Self::ErrorCompile => "ERROR_COMPILE",
            Self::ErrorCompress => "ERROR_COMPRESS",
            Self::ErrorFileIo => "ERROR_FILEIO",
            Self::ErrorInvalidProfile => "ERROR_INVALID_PROFILE",
            Self::ErrorInvalidPlatform => "ERROR_INVALID_PLATFORM",
            Self::ErrorInvalidProgram => "ERROR_INVALID_PROGRAM",
            Self::ErrorInvalidEntry => "ERROR_INVALID_ENTRY",
            Self::ErrorInvalidCompileFlags => "ERROR_INVALID_COMPILEFLAGS",
            Self::ErrorInvalidShaderRequestLine => "ERROR_INVALID_SHADERREQUESTLINE",
        };
        f.write_str(name)
    }
}

/// State holder that only escalates in severity.
///
/// Once an error state has been recorded, only another error state may
/// replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    state: JobState,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: JobState::None,
        }
    }
}

impl JobStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new state, subject to the escalation rule.
    pub fn set(&mut self, state: JobState) {
        if self.state < JobState::Error || state >= JobState::Error {
            self.state = state;
        }
    }

    pub fn get(&self) -> JobState {
        self.state
    }
}

/// Protocol revision negotiated through the request's `Version` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Legacy: no job type, always compile, 4-byte response header.
    V1,
    /// Explicit job type, 5-byte response header (length + state).
    V2,
    /// As `V2`, plus the server waits for the peer to close first.
    V2_1,
}

impl ProtocolVersion {
    /// Parse the `Version` attribute; an absent attribute means `V1`.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        match value.map(str::trim) {
            None | Some("") | Some("1") | Some("1.0") => Some(Self::V1),
            Some("2") | Some("2.0") => Some(Self::V2),
            Some("2.1") => Some(Self::V2_1),
            Some(_) => None,
        }
    }

    /// Whether the response header carries the state byte.
    pub fn has_state_byte(self) -> bool {
        !matches!(self, Self::V1)
    }

    /// Whether the request body is hashed only up to the `HashStop` marker.
    pub fn uses_hash_stop(self) -> bool {
        !matches!(self, Self::V1)
    }

    /// Whether the server waits for the client's shutdown acknowledgment.
    pub fn awaits_peer_shutdown(self) -> bool {
        matches!(self, Self::V2_1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2.0",
            Self::V2_1 => "2.1",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    /// Record a shader permutation request line.
    RequestLine,
    /// Compile a shader program.
    Compile,
}

impl JobType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "RequestLine" => Some(Self::RequestLine),
            "Compile" => Some(Self::Compile),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestLine => "RequestLine",
            Self::Compile => "Compile",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
