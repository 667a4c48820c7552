//! Shared fixtures for the server's unit tests.

use scs_common::{ProtocolVersion, RequestBuilder};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cache::CompileCache;
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::executor::{CompileFailure, CompileInput, Compiler};
use crate::mailer::RecordingMailer;

/// Compiler double that counts invocations.
pub struct FakeCompiler {
    calls: AtomicUsize,
    output: Vec<u8>,
    stderr: Option<String>,
}

impl FakeCompiler {
    pub fn succeeding(output: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            output: output.to_vec(),
            stderr: None,
        })
    }

    pub fn failing(stderr: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            output: Vec::new(),
            stderr: Some(stderr.to_string()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compiler for FakeCompiler {
    fn supports(&self, platform: &str) -> bool {
        platform == "PC"
    }

    fn compile(&self, input: &CompileInput) -> Result<Vec<u8>, CompileFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports(&input.platform) {
            return Err(CompileFailure::UnsupportedPlatform(input.platform.clone()));
        }
        match &self.stderr {
            Some(stderr) => Err(CompileFailure::Exit {
                status: "exit status: 1".to_string(),
                stderr: stderr.clone(),
            }),
            None => Ok(self.output.clone()),
        }
    }
}

pub fn test_config(root: &Path) -> ServerConfig {
    ServerConfig::new(root)
}

pub fn test_context(config: ServerConfig, compiler: Arc<FakeCompiler>) -> ServerContext {
    ServerContext::with_parts(
        config,
        CompileCache::in_memory(),
        compiler,
        Arc::new(RecordingMailer::default()),
    )
}

pub fn compile_doc(version: ProtocolVersion) -> RequestBuilder {
    RequestBuilder::compile(version)
        .profile("ps_5_0")
        .program("float4 main() : SV_Target\n{\n    return undefinedThing;\n}\n")
        .entry("main")
        .compile_flags("0")
        .platform("PC")
        .shader_request("<1>Illum@Main(%DIFFUSE)")
        .project("Game")
}
