//! Native compiler invocation.
//!
//! Each job gets a private directory under `TempDir` holding the source and
//! the compiler output. The directory is removed when the job finishes, on
//! every path, because it lives in a [`tempfile::TempDir`] guard.

use scs_common::{JobState, Request};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{CompilerSpec, ServerConfig};

const SOURCE_FILE: &str = "shader.fx";
const OUTPUT_FILE: &str = "shader.bin";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a compiler needs for one job, owned so it can move onto a
/// blocking thread.
#[derive(Debug, Clone)]
pub struct CompileInput {
    pub platform: String,
    pub profile: String,
    pub entry: String,
    pub compile_flags: String,
    pub source: String,
}

impl CompileInput {
    pub fn from_request(request: &Request) -> Self {
        Self {
            platform: request.platform.clone(),
            profile: request.profile.clone(),
            entry: request.entry.clone(),
            compile_flags: request.compile_flags.clone(),
            source: request.program.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileFailure {
    #[error("no compiler configured for platform '{0}'")]
    UnsupportedPlatform(String),

    #[error("failed to start {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler exited with {status}")]
    Exit { status: String, stderr: String },

    #[error("compiler still running after {0:?}, killed")]
    Timeout(Duration),

    #[error("compiler file I/O: {0}")]
    FileIo(#[from] std::io::Error),
}

impl CompileFailure {
    pub fn state(&self) -> JobState {
        match self {
            Self::UnsupportedPlatform(_) => JobState::ErrorInvalidPlatform,
            Self::Spawn { .. } | Self::Exit { .. } | Self::Timeout(_) => JobState::ErrorCompile,
            Self::FileIo(_) => JobState::ErrorFileIo,
        }
    }

    /// Compiler diagnostics, when the compiler got far enough to produce any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Exit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// A shader compiler. Implementations block; callers run them on
/// `spawn_blocking`.
pub trait Compiler: Send + Sync {
    fn supports(&self, platform: &str) -> bool;

    fn compile(&self, input: &CompileInput) -> Result<Vec<u8>, CompileFailure>;
}

/// Runs the configured executable for the job's platform.
#[derive(Debug, Clone)]
pub struct ProcessCompiler {
    compilers: BTreeMap<String, CompilerSpec>,
    temp_root: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessCompiler {
    pub fn new(
        compilers: BTreeMap<String, CompilerSpec>,
        temp_root: impl Into<PathBuf>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            compilers,
            temp_root: temp_root.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.compilers.clone(),
            config.temp_dir.clone(),
            config.compile_timeout,
        )
    }

    fn spec(&self, platform: &str) -> Option<&CompilerSpec> {
        self.compilers.get(platform).or_else(|| {
            self.compilers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(platform))
                .map(|(_, spec)| spec)
        })
    }

    fn expand_args(
        spec: &CompilerSpec,
        input: &CompileInput,
        source: &Path,
        output: &Path,
    ) -> Vec<String> {
        let source = source.to_string_lossy();
        let output = output.to_string_lossy();
        spec.args
            .iter()
            .map(|arg| {
                arg.replace("%profile%", &input.profile)
                    .replace("%entry%", &input.entry)
                    .replace("%flags%", &input.compile_flags)
                    .replace("%in%", &source)
                    .replace("%out%", &output)
            })
            .filter(|arg| !arg.is_empty())
            .collect()
    }

    fn run(
        &self,
        spec: &CompilerSpec,
        args: &[String],
        workdir: &Path,
    ) -> Result<(ExitStatus, String), CompileFailure> {
        let mut child = Command::new(&spec.executable)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CompileFailure::Spawn {
                executable: spec.executable.clone(),
                source,
            })?;

        // Drained on its own thread so a chatty compiler cannot fill the pipe.
        let drain = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(limit) = self.timeout
                && started.elapsed() >= limit
            {
                warn!(executable = %spec.executable.display(), ?limit, "compile timed out");
                let _ = child.kill();
                let _ = child.wait();
                return Err(CompileFailure::Timeout(limit));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stderr = drain
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok((status, stderr))
    }
}

impl Compiler for ProcessCompiler {
    fn supports(&self, platform: &str) -> bool {
        self.spec(platform).is_some()
    }

    fn compile(&self, input: &CompileInput) -> Result<Vec<u8>, CompileFailure> {
        let spec = self
            .spec(&input.platform)
            .ok_or_else(|| CompileFailure::UnsupportedPlatform(input.platform.clone()))?;

        fs::create_dir_all(&self.temp_root)?;
        let workdir = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.temp_root)?;
        let source = workdir.path().join(SOURCE_FILE);
        let output = workdir.path().join(OUTPUT_FILE);
        fs::write(&source, input.source.as_bytes())?;

        let args = Self::expand_args(spec, input, &source, &output);
        debug!(
            platform = %input.platform,
            executable = %spec.executable.display(),
            ?args,
            "running compiler"
        );

        let (status, stderr) = self.run(spec, &args, workdir.path())?;
        if !status.success() {
            return Err(CompileFailure::Exit {
                status: status.to_string(),
                stderr,
            });
        }
        Ok(fs::read(&output)?)
    }
}
