//! Structured test logging.
//!
//! Tests open a [`TestGuard`] through [`test_guard!`](crate::test_guard) and
//! get START/PASS/FAIL entries written as JSONL under `target/test-logs/`.
//! Logging is opt-in: set `SCS_TEST_LOGGING=1` (enabled by default when `CI`
//! is set).

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;
use tracing_subscriber::prelude::*;

/// Test execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Verify,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Level comes from `SCS_TEST_LOG_LEVEL` (default `info`).
pub fn init_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let level = std::env::var("SCS_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "scsd={level},scs_common={level},test={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// A structured log entry for test execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLogEntry {
    pub timestamp: String,
    pub test_name: String,
    pub phase: TestPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TestLogEntry {
    pub fn new(test_name: &str, phase: TestPhase, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            test_name: test_name.to_string(),
            phase,
            message: message.into(),
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

fn test_log_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir).join("test-logs");
    }
    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target.join("test-logs");
        }
        if !cwd.pop() {
            return PathBuf::from("target/test-logs");
        }
    }
}

/// Zero-boilerplate test logger that records pass/fail on drop.
pub struct TestGuard {
    test_name: String,
    start_time: Instant,
    log_file: Option<Mutex<std::fs::File>>,
    enabled: bool,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        let enabled = Self::is_enabled();
        let log_file = if enabled {
            init_test_logging();
            let dir = test_log_dir();
            let safe_name = test_name.replace("::", "_").replace(['/', '\\'], "_");
            std::fs::create_dir_all(&dir)
                .and_then(|_| std::fs::File::create(dir.join(format!("{safe_name}.jsonl"))))
                .ok()
                .map(Mutex::new)
        } else {
            None
        };

        let guard = Self {
            test_name: test_name.to_string(),
            start_time: Instant::now(),
            log_file,
            enabled,
        };
        guard.log(TestPhase::Setup, "TEST START");
        guard
    }

    fn is_enabled() -> bool {
        match std::env::var("SCS_TEST_LOGGING").as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => std::env::var("CI").is_ok(),
        }
    }

    /// Log a message during test execution.
    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        if !self.enabled {
            return;
        }
        let duration_ms = self.start_time.elapsed().as_millis() as u64;
        let entry = TestLogEntry::new(&self.test_name, phase, message).with_duration(duration_ms);

        if let Some(file) = &self.log_file
            && let Ok(mut f) = file.lock()
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let _ = writeln!(f, "{json}");
        }

        tracing::info!(
            target: "test",
            test = %self.test_name,
            phase = %entry.phase,
            duration_ms = entry.duration_ms,
            "{}",
            entry.message
        );
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.log(TestPhase::Verify, "TEST FAIL");
        } else {
            self.log(TestPhase::Verify, "TEST PASS");
        }
    }
}

/// Create a [`TestGuard`] named after the enclosing test function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let mut name = name.strip_suffix("::_f").unwrap_or(name);
        // async tests nest the marker fn inside a closure
        while let Some(outer) = name.strip_suffix("::{{closure}}") {
            name = outer;
        }
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}
