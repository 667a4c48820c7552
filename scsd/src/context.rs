//! Shared server state handed to every connection task.
//!
//! Everything lives behind `Arc`s so several servers (tests spin up two to
//! exercise forwarding) can share a process without global state.

use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::cache::CompileCache;
use crate::config::ServerConfig;
use crate::error_log::ErrorLog;
use crate::executor::{Compiler, ProcessCompiler};
use crate::fallback::FallbackRouter;
use crate::mailer::{self, ErrorMailer};
use crate::shader_list::ShaderListStore;
use crate::stats::CompileStats;

#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub cache: Arc<CompileCache>,
    pub errors: Arc<ErrorLog>,
    pub shader_lists: Arc<ShaderListStore>,
    pub stats: Arc<CompileStats>,
    pub fallback: Arc<FallbackRouter>,
    pub compiler: Arc<dyn Compiler>,
    /// Bounds concurrent local compiles.
    pub compile_slots: Arc<Semaphore>,
    pub mailer: Arc<dyn ErrorMailer>,
    /// Error report being mailed, if any. Outlives the maintenance task so
    /// shutdown can wait for it.
    pub report: Arc<Mutex<Option<JoinHandle<()>>>>,
    pub started_at: Instant,
}

impl ServerContext {
    /// Context with the process compiler and the configured mailer.
    pub fn new(config: ServerConfig, cache: CompileCache) -> Self {
        let compiler = Arc::new(ProcessCompiler::from_config(&config));
        let mailer: Arc<dyn ErrorMailer> = Arc::from(mailer::from_config(&config));
        Self::with_parts(config, cache, compiler, mailer)
    }

    pub fn with_parts(
        config: ServerConfig,
        cache: CompileCache,
        compiler: Arc<dyn Compiler>,
        mailer: Arc<dyn ErrorMailer>,
    ) -> Self {
        let errors = ErrorLog::new(
            config.dedupe_errors,
            config.mail_interval,
            config.max_error_log,
        );
        let fallback = FallbackRouter::new(config.fallback_servers.clone());
        let slots = config.max_concurrent_compiles.max(1);
        Self {
            cache: Arc::new(cache),
            errors: Arc::new(errors),
            shader_lists: Arc::new(ShaderListStore::new()),
            stats: Arc::new(CompileStats::new()),
            fallback: Arc::new(fallback),
            compiler,
            compile_slots: Arc::new(Semaphore::new(slots)),
            mailer,
            report: Arc::new(Mutex::new(None)),
            started_at: Instant::now(),
            config: Arc::new(config),
        }
    }
}
