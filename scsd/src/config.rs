//! Server configuration.
//!
//! Settings come from `config.ini` in the server root; CLI flags override a
//! few of them after loading.

use scs_common::config::{IniDocument, IniError, IniReader};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 61453;
const DEFAULT_MAIL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_FALLBACK_THRESHOLD: u64 = 16;
const DEFAULT_MAX_ERROR_LOG: usize = 150;
const DEFAULT_ERROR_CONTEXT_LINES: usize = 2;
const DEFAULT_SHADER_LIST_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Ini(#[from] IniError),

    #[error("invalid configuration:\n{}", .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Invalid(Vec<IniError>),
}

/// How to invoke the compiler for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilerSpec {
    pub executable: PathBuf,
    /// Argument template; `%profile%`, `%entry%`, `%flags%`, `%in%` and
    /// `%out%` are substituted per job.
    pub args: Vec<String>,
}

impl CompilerSpec {
    /// Parse `"<exe> <arg> <arg>..."`.
    pub fn parse(command: &str, root: &Path) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let exe = PathBuf::from(parts.next()?);
        let executable = if exe.is_relative() && exe.components().count() > 1 {
            root.join(exe)
        } else {
            exe
        };
        Some(Self {
            executable,
            args: parts.map(str::to_string).collect(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Directory holding `Cache/`, `Error/`, `ShaderList/`, `Temp/` and `pid.txt`.
    pub root: PathBuf,
    pub port: u16,
    /// Recipient of compile error reports; reports are only logged when unset.
    pub mail_error: Option<String>,
    pub mail_server: Option<String>,
    pub mail_from: String,
    /// Quiet period after the newest error before a report is sent.
    pub mail_interval: Duration,
    pub temp_dir: PathBuf,
    pub caching: bool,
    pub print_errors: bool,
    pub dedupe_errors: bool,
    /// Peers as `host:port`.
    pub fallback_servers: Vec<String>,
    /// Local compiles in flight above which jobs are forwarded.
    pub fallback_threshold: u64,
    /// `None` waits for the compiler indefinitely.
    pub compile_timeout: Option<Duration>,
    pub max_concurrent_compiles: usize,
    pub max_error_log: usize,
    pub error_context_lines: usize,
    pub shader_list_interval: Duration,
    pub compilers: BTreeMap<String, CompilerSpec>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ServerConfig {
    /// Defaults for a server rooted at `root` (no compilers configured).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            temp_dir: root.join("Temp"),
            root,
            port: DEFAULT_PORT,
            mail_error: None,
            mail_server: None,
            mail_from: "shader-compile-server@localhost".to_string(),
            mail_interval: DEFAULT_MAIL_INTERVAL,
            caching: true,
            print_errors: true,
            dedupe_errors: true,
            fallback_servers: Vec::new(),
            fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
            compile_timeout: None,
            max_concurrent_compiles: default_parallelism(),
            max_error_log: DEFAULT_MAX_ERROR_LOG,
            error_context_lines: DEFAULT_ERROR_CONTEXT_LINES,
            shader_list_interval: DEFAULT_SHADER_LIST_INTERVAL,
            compilers: BTreeMap::new(),
        }
    }

    /// Build from a parsed document; every bad value is reported at once.
    pub fn from_ini(doc: &IniDocument, root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::new(root);
        let mut reader = IniReader::new(doc);

        config.port = reader.get_u16("port", config.port);
        config.mail_error = reader.get_opt_string("MailError");
        config.mail_server = reader.get_opt_string("MailServer");
        if let Some(from) = reader.get_opt_string("MailFrom") {
            config.mail_from = from;
        }
        config.mail_interval = reader.get_secs("MailInterval", config.mail_interval);
        if let Some(temp) = reader.get_opt_string("TempDir") {
            config.temp_dir = config.root.join(temp);
        }
        config.caching = reader.get_bool("Caching", config.caching);
        config.print_errors = reader.get_bool("PrintErrors", config.print_errors);
        config.dedupe_errors = reader.get_bool("DedupeErrors", config.dedupe_errors);

        let port = config.port;
        config.fallback_servers = reader
            .get_list("FallbackServer", &[';'])
            .into_iter()
            .map(|host| {
                if host.contains(':') {
                    host
                } else {
                    format!("{host}:{port}")
                }
            })
            .collect();
        config.fallback_threshold = reader.get_u64_any(
            &["FallbackTreshold", "FallbackThreshold"],
            config.fallback_threshold,
        );

        let timeout = reader.get_u64("CompileTimeout", 0);
        config.compile_timeout = (timeout > 0).then(|| Duration::from_secs(timeout));
        config.max_concurrent_compiles = reader
            .get_u64("MaxConcurrentCompiles", config.max_concurrent_compiles as u64)
            .max(1) as usize;
        config.max_error_log = reader.get_u64("MaxErrorLog", config.max_error_log as u64) as usize;
        config.error_context_lines =
            reader.get_u64("ErrorContextLines", config.error_context_lines as u64) as usize;
        config.shader_list_interval =
            reader.get_secs("ShaderListInterval", config.shader_list_interval);

        for entry in doc.section("Compilers") {
            match CompilerSpec::parse(&entry.value, &config.root) {
                Some(spec) => {
                    config.compilers.insert(entry.key.clone(), spec);
                }
                None => reader.reject(&entry.key, "compiler command line", &entry.value),
            }
        }

        let errors = reader.take_errors();
        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        Ok(config)
    }

    /// Load `path`, or defaults when it does not exist.
    pub fn load(path: &Path, root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::new(root));
        }
        let doc = IniDocument::load(path)?;
        Self::from_ini(&doc, root)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("Cache")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.root.join("Error")
    }

    pub fn shader_list_dir(&self) -> PathBuf {
        self.root.join("ShaderList")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("pid.txt")
    }

    /// Whether mail delivery is fully configured.
    pub fn mail_enabled(&self) -> bool {
        self.mail_error.is_some() && self.mail_server.is_some()
    }
}
