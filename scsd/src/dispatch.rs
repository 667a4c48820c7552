//! Job execution: request line recording and the compile pipeline.
//!
//! Compile path, in order:
//!
//! 1. request hash (`HashStop` aware)
//! 2. cache lookup, answered as CACHEHIT without running anything
//! 3. overflow forwarding when more than `FallbackTreshold` local compiles
//!    are in flight and peers are configured
//! 4. local compile under a compile slot, output compressed with zstd
//! 5. cache insert unless the job or the server disables caching

use scs_common::{JobState, JobType, Request, request_hash};
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::error_log::{AddOutcome, CompilerError};
use crate::executor::{CompileFailure, CompileInput};

const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Compile(#[from] CompileFailure),

    #[error("failed to compress compiler output: {0}")]
    Compress(#[source] std::io::Error),

    #[error("compile task failed: {0}")]
    Task(String),

    #[error("server is shutting down")]
    ShuttingDown,
}

impl JobError {
    /// State reported to the client.
    pub fn state(&self) -> JobState {
        match self {
            Self::Compile(failure) => failure.state(),
            Self::Compress(_) => JobState::ErrorCompress,
            Self::Task(_) | Self::ShuttingDown => JobState::Error,
        }
    }

    /// Error text sent as the response payload.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Self::Compile(failure) => match failure.stderr() {
                Some(stderr) if !stderr.trim().is_empty() => stderr.as_bytes().to_vec(),
                _ => failure.to_string().into_bytes(),
            },
            other => other.to_string().into_bytes(),
        }
    }
}

/// A finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub state: JobState,
    pub payload: Vec<u8>,
}

impl JobOutcome {
    fn new(state: JobState, payload: Vec<u8>) -> Self {
        Self { state, payload }
    }
}

/// Run a parsed request.
pub async fn execute(
    ctx: &ServerContext,
    request: &Request,
    peer: IpAddr,
) -> Result<JobOutcome, JobError> {
    match request.job_type {
        JobType::RequestLine => execute_request_line(ctx, request),
        JobType::Compile => execute_compile(ctx, request, peer).await,
    }
}

/// Record a request line in its shader list.
pub fn execute_request_line(
    ctx: &ServerContext,
    request: &Request,
) -> Result<JobOutcome, JobError> {
    ctx.shader_lists
        .add(&request.project, &request.platform, &request.request_line);
    Ok(JobOutcome::new(JobState::Done, Vec::new()))
}

pub async fn execute_compile(
    ctx: &ServerContext,
    request: &Request,
    peer: IpAddr,
) -> Result<JobOutcome, JobError> {
    let hash = request_hash(&request.raw, request.version);
    let caching = ctx.config.caching;
    let store = caching && request.caching;

    if caching && let Some(bytes) = ctx.cache.lookup(&hash) {
        ctx.stats.record_cache_hit();
        debug!(%hash, %peer, "cache hit");
        return Ok(JobOutcome::new(JobState::CacheHit, bytes.to_vec()));
    }

    if !ctx.fallback.is_empty() && ctx.stats.active() > ctx.config.fallback_threshold {
        match ctx.fallback.forward(&request.raw, request.version).await {
            Ok(forwarded) => {
                ctx.stats.record_forwarded();
                info!(%hash, peer = %forwarded.peer, "job compiled by fallback server");
                if store && forwarded.confirmed {
                    ctx.cache.insert(hash, forwarded.payload.clone());
                } else if store {
                    debug!(%hash, "unconfirmed v1 result, not cached");
                }
                return Ok(JobOutcome::new(JobState::Done, forwarded.payload));
            }
            Err(err) => debug!(%hash, "forwarding failed, compiling locally: {err}"),
        }
    }

    let bytes = match compile_locally(ctx, request).await {
        Ok(bytes) => bytes,
        Err(JobError::Compile(failure)) => {
            if let Some(stderr) = failure.stderr() {
                record_compile_error(ctx, request, peer, stderr).await;
            }
            return Err(JobError::Compile(failure));
        }
        Err(err) => return Err(err),
    };

    if store {
        ctx.cache.insert(hash, bytes.clone());
    }
    Ok(JobOutcome::new(JobState::Done, bytes))
}

/// Compile and compress on a blocking thread.
///
/// The job counts as active from here on, including time spent waiting for
/// a compile slot, so the fallback threshold sees queued work.
async fn compile_locally(ctx: &ServerContext, request: &Request) -> Result<Vec<u8>, JobError> {
    if !ctx.compiler.supports(&request.platform) {
        return Err(CompileFailure::UnsupportedPlatform(request.platform.clone()).into());
    }
    let guard = ctx.stats.track();
    let _permit = ctx
        .compile_slots
        .acquire()
        .await
        .map_err(|_| JobError::ShuttingDown)?;

    let compiler = ctx.compiler.clone();
    let input = CompileInput::from_request(request);
    let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, JobError> {
        let output = compiler.compile(&input)?;
        zstd::bulk::compress(&output, COMPRESSION_LEVEL).map_err(JobError::Compress)
    })
    .await
    .map_err(|err| JobError::Task(err.to_string()))??;

    debug!(
        platform = %request.platform,
        entry = %request.entry,
        elapsed_ms = guard.elapsed().as_millis() as u64,
        bytes = bytes.len(),
        "compiled"
    );
    guard.succeeded();
    Ok(bytes)
}

async fn record_compile_error(ctx: &ServerContext, request: &Request, peer: IpAddr, stderr: &str) {
    let mut error =
        CompilerError::new(request, peer, stderr, ctx.config.error_context_lines);
    if ctx.config.print_errors {
        warn!(
            platform = %error.platform,
            shader = %error.shader,
            entry = %error.entry,
            %peer,
            "compile failed:\n{}",
            error.summary()
        );
    }

    if !ctx.errors.contains(&error.hash) {
        let dir = ctx.config.error_dir();
        let source = request.program.clone();
        let dumped = tokio::task::spawn_blocking(move || {
            if let Err(err) = error.dump_source(&dir, &source) {
                warn!(dir = %dir.display(), "failed to dump shader source: {err}");
            }
            error
        })
        .await;
        error = match dumped {
            Ok(error) => error,
            Err(err) => {
                warn!("source dump task failed: {err}");
                return;
            }
        };
    }

    if let AddOutcome::Duplicate { count } = ctx.errors.add(error) {
        debug!(count, "duplicate compile error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeCompiler, compile_doc, test_config, test_context};
    use scs_common::{ProtocolVersion, RequestBuilder};

    const PEER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    fn parse(raw: Vec<u8>) -> Request {
        Request::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn second_identical_request_is_a_cache_hit() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let compiler = FakeCompiler::succeeding(b"DXBC-bytecode");
        let ctx = test_context(test_config(dir.path()), compiler.clone());
        let request = parse(compile_doc(ProtocolVersion::V2).caching(true).build());

        let first = execute(&ctx, &request, PEER).await.unwrap();
        assert_eq!(first.state, JobState::Done);
        assert_eq!(zstd::decode_all(&first.payload[..]).unwrap(), b"DXBC-bytecode");
        assert_eq!(ctx.cache.stats().entries, 1);

        let second = execute(&ctx, &request, PEER).await.unwrap();
        assert_eq!(second.state, JobState::CacheHit);
        assert_eq!(second.payload, first.payload);
        assert_eq!(compiler.calls(), 1);
        assert_eq!(ctx.stats.snapshot().cache_hits, 1);
    }

    #[tokio::test]
    async fn trailer_differences_still_hit_the_cache() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let compiler = FakeCompiler::succeeding(b"bytes");
        let ctx = test_context(test_config(dir.path()), compiler.clone());
        let a = parse(compile_doc(ProtocolVersion::V2_1).tags("a").build());
        let b = parse(compile_doc(ProtocolVersion::V2_1).tags("b").build());
        execute(&ctx, &a, PEER).await.unwrap();
        let hit = execute(&ctx, &b, PEER).await.unwrap();
        assert_eq!(hit.state, JobState::CacheHit);
        assert_eq!(compiler.calls(), 1);
    }

    #[tokio::test]
    async fn caching_zero_skips_the_insert() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let compiler = FakeCompiler::succeeding(b"bytes");
        let ctx = test_context(test_config(dir.path()), compiler.clone());
        let request = parse(compile_doc(ProtocolVersion::V2).caching(false).build());
        execute(&ctx, &request, PEER).await.unwrap();
        let again = execute(&ctx, &request, PEER).await.unwrap();
        assert_eq!(again.state, JobState::Done);
        assert_eq!(compiler.calls(), 2);
        assert_eq!(ctx.cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn server_wide_caching_off_never_looks_up() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.caching = false;
        let compiler = FakeCompiler::succeeding(b"bytes");
        let ctx = test_context(config, compiler.clone());
        let request = parse(compile_doc(ProtocolVersion::V1).build());
        execute(&ctx, &request, PEER).await.unwrap();
        execute(&ctx, &request, PEER).await.unwrap();
        assert_eq!(compiler.calls(), 2);
        let stats = ctx.cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (0, 0, 0));
    }

    #[tokio::test]
    async fn compile_failure_is_logged_and_dumped() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let compiler = FakeCompiler::failing(
            "/srv/Temp/job-1/shader.fx(3,12): error X3004: undeclared identifier 'undefinedThing'\n",
        );
        let ctx = test_context(test_config(dir.path()), compiler);
        let request = parse(compile_doc(ProtocolVersion::V2).build());

        let err = execute(&ctx, &request, PEER).await.unwrap_err();
        assert_eq!(err.state(), JobState::ErrorCompile);
        assert!(String::from_utf8(err.payload()).unwrap().contains("X3004"));
        assert_eq!(ctx.errors.len(), 1);
        assert_eq!(std::fs::read_dir(dir.path().join("Error")).unwrap().count(), 1);
        assert_eq!(ctx.cache.stats().entries, 0);
        assert_eq!(ctx.stats.snapshot().failed, 1);

        // The duplicate is counted, not dumped again.
        execute(&ctx, &request, PEER).await.unwrap_err();
        assert_eq!(ctx.errors.len(), 1);
        assert_eq!(std::fs::read_dir(dir.path().join("Error")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn unknown_platform_is_rejected() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(test_config(dir.path()), FakeCompiler::succeeding(b"x"));
        let request = parse(compile_doc(ProtocolVersion::V2).platform("DURANGO").build());
        let err = execute(&ctx, &request, PEER).await.unwrap_err();
        assert_eq!(err.state(), JobState::ErrorInvalidPlatform);
        assert!(ctx.errors.is_empty());
        assert_eq!(ctx.stats.snapshot().failed, 0);
    }

    #[tokio::test]
    async fn unreachable_fallback_falls_through_to_local_compile() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_peer = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = test_config(dir.path());
        config.fallback_servers = vec![dead_peer];
        config.fallback_threshold = 0;
        let compiler = FakeCompiler::succeeding(b"local");
        let ctx = test_context(config, compiler.clone());
        let _busy = ctx.stats.track();

        let request = parse(compile_doc(ProtocolVersion::V2).build());
        let outcome = execute(&ctx, &request, PEER).await.unwrap();
        assert_eq!(outcome.state, JobState::Done);
        assert_eq!(zstd::decode_all(&outcome.payload[..]).unwrap(), b"local");
        assert_eq!(compiler.calls(), 1);
        assert_eq!(ctx.stats.snapshot().forwarded, 0);
    }

    #[tokio::test]
    async fn below_threshold_never_forwards() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.fallback_servers = vec!["192.0.2.1:61453".to_string()];
        let compiler = FakeCompiler::succeeding(b"local");
        let ctx = test_context(config, compiler.clone());
        let request = parse(compile_doc(ProtocolVersion::V2).build());
        execute(&ctx, &request, PEER).await.unwrap();
        assert_eq!(compiler.calls(), 1);
    }

    #[tokio::test]
    async fn request_line_is_recorded() {
        let _guard = scs_common::test_guard!();
        let dir = tempfile::tempdir().unwrap();
        let compiler = FakeCompiler::succeeding(b"x");
        let ctx = test_context(test_config(dir.path()), compiler.clone());
        let request = parse(
            RequestBuilder::request_line(ProtocolVersion::V2, "<2>Illum@Main(%A)")
                .platform("PC")
                .project("Game")
                .build(),
        );
        let outcome = execute(&ctx, &request, PEER).await.unwrap();
        assert_eq!(outcome, JobOutcome::new(JobState::Done, Vec::new()));
        assert_eq!(ctx.shader_lists.pending_lines(), 1);
        assert_eq!(compiler.calls(), 0);
    }
}
