//! Compiler error aggregation.
//!
//! Failed compiles become [`CompilerError`] records that are moved into the
//! [`ErrorLog`]. Records that describe the same problem (same shader, same
//! messages, any client, any temp path) collapse into one entry with a
//! duplicate counter. The maintenance task drains the log into mail reports
//! once it has been quiet for `MailInterval` or has grown past `MaxErrorLog`.

use chrono::{DateTime, Utc};
use regex::Regex;
use scs_common::{Hash128, Request};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::shader_list::split_request_counter;

/// Stands in for the per-job source path in stored messages.
const SOURCE_PLACEHOLDER: &str = "<source>";

/// `file(line[,col][-col]) : message`
static LOCATED_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>.*?)\((?P<line>\d+)(?:,\d+)?(?:-\d+)?\)\s*:\s*(?P<msg>.*)$")
        .expect("static regex")
});

/// Any path through a per-job work directory (`.../job-XXXX/...`).
static JOB_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[^\s'"()]*job-[^/\\\s'"()]+[/\\][^\s'"():,]*"#).expect("static regex")
});

fn strip_job_paths(message: &str) -> String {
    JOB_PATH.replace_all(message, SOURCE_PLACEHOLDER).into_owned()
}

/// One diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLine {
    /// 1-based source line; 0 when the compiler gave no location.
    pub line: u32,
    pub message: String,
}

/// Parse compiler stderr into sorted error lines.
pub fn parse_errors(stderr: &str) -> Vec<ErrorLine> {
    let mut out = Vec::new();
    for raw in stderr.lines() {
        let text = raw.trim();
        if !text.to_ascii_lowercase().contains("error") {
            continue;
        }
        match LOCATED_ERROR.captures(text) {
            Some(caps) => {
                let file = caps.name("file").map_or("", |m| m.as_str()).trim();
                let mut message = caps.name("msg").map_or("", |m| m.as_str()).to_string();
                if !file.is_empty() {
                    message = message.replace(file, SOURCE_PLACEHOLDER);
                }
                out.push(ErrorLine {
                    line: caps["line"].parse().unwrap_or(0),
                    message: strip_job_paths(&message),
                });
            }
            None => out.push(ErrorLine {
                line: 0,
                message: strip_job_paths(text),
            }),
        }
    }
    out.sort_by_key(|e| e.line);
    out
}

/// Source lines around each located error, `>` marking the error line.
pub fn context_excerpt(source: &str, errors: &[ErrorLine], radius: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let wanted: BTreeSet<u32> = errors.iter().map(|e| e.line).filter(|&l| l > 0).collect();
    let mut out = String::new();
    let mut last_printed = 0usize;

    for &target in &wanted {
        let target = target as usize;
        if target > lines.len() {
            continue;
        }
        let first = target.saturating_sub(radius).max(1).max(last_printed + 1);
        let last = (target + radius).min(lines.len());
        if first > last {
            continue;
        }
        if last_printed != 0 && first > last_printed + 1 {
            out.push_str("     ...\n");
        }
        for n in first..=last {
            let marker = if n == target { '>' } else { ' ' };
            let _ = writeln!(out, "{marker}{n:>5}| {}", lines[n - 1]);
        }
        last_printed = last;
    }
    out
}

/// Shader name from a request line: `<3>Illum@Common_ZPass(%A)` gives
/// `Illum@Common_ZPass`.
pub fn shader_identity(request_line: &str) -> String {
    let (_, body) = split_request_counter(request_line);
    body.split('(').next().unwrap_or("").trim().to_string()
}

/// A failed compile, as stored in the error log.
#[derive(Debug, Clone)]
pub struct CompilerError {
    pub entry: String,
    pub shader: String,
    pub errors: Vec<ErrorLine>,
    pub context: String,
    pub platform: String,
    pub project: String,
    pub tags: String,
    pub profile: String,
    pub request_line: String,
    pub ccs: Vec<String>,
    /// Occurrences, including the first.
    pub duplicates: u32,
    pub ips: BTreeSet<IpAddr>,
    pub hash: Hash128,
    pub source_dump: Option<PathBuf>,
    pub first_seen: DateTime<Utc>,
}

impl CompilerError {
    pub fn new(request: &Request, peer: IpAddr, stderr: &str, context_lines: usize) -> Self {
        let mut errors = parse_errors(stderr);
        if errors.is_empty() {
            // Nothing matched; keep the raw text so the report is not empty.
            let text = stderr.trim();
            errors.push(ErrorLine {
                line: 0,
                message: if text.is_empty() {
                    "compiler failed without diagnostics".to_string()
                } else {
                    text.to_string()
                },
            });
        }
        let context = context_excerpt(&request.program, &errors, context_lines);
        let shader = match shader_identity(&request.request_line) {
            s if s.is_empty() => request.entry.clone(),
            s => s,
        };
        let hash = dedup_hash(request, &errors);

        Self {
            entry: request.entry.clone(),
            shader,
            errors,
            context,
            platform: request.platform.clone(),
            project: request.project.clone(),
            tags: request.tags.clone(),
            profile: request.profile.clone(),
            request_line: request.request_line.clone(),
            ccs: request.email_ccs.clone(),
            duplicates: 1,
            ips: BTreeSet::from([peer]),
            hash,
            source_dump: None,
            first_seen: Utc::now(),
        }
    }

    /// Error lines only, as printed in the server log.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for e in &self.errors {
            if e.line > 0 {
                let _ = writeln!(out, "({}): {}", e.line, e.message);
            } else {
                let _ = writeln!(out, "{}", e.message);
            }
        }
        out
    }

    /// Write the shader source to `dir` for inspection and attachment.
    pub fn dump_source(&mut self, dir: &Path, source: &str) -> io::Result<&Path> {
        fs::create_dir_all(dir)?;
        let name = format!(
            "{}_{}_{}.fx",
            self.first_seen.format("%Y%m%d-%H%M%S"),
            self.platform,
            &self.hash.to_hex()[..12]
        );
        let path = dir.join(name);
        fs::write(&path, source)?;
        Ok(self.source_dump.insert(path).as_path())
    }
}

/// Hash identifying "the same error". Client IP and request line stay out of
/// it; temp paths were already replaced by the placeholder.
fn dedup_hash(request: &Request, errors: &[ErrorLine]) -> Hash128 {
    let mut hasher = blake3::Hasher::new();
    for field in [
        SOURCE_PLACEHOLDER,
        request.platform.as_str(),
        request.project.as_str(),
        request.entry.as_str(),
        request.tags.as_str(),
        request.profile.as_str(),
    ] {
        hasher.update(field.as_bytes());
        hasher.update(&[0]);
    }
    for e in errors {
        hasher.update(&e.line.to_le_bytes());
        hasher.update(e.message.as_bytes());
        hasher.update(&[0]);
    }
    Hash128::from_hasher(&hasher)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Queued,
    Duplicate { count: u32 },
}

#[derive(Default)]
struct LogInner {
    entries: Vec<CompilerError>,
    index: HashMap<Hash128, usize>,
    last_added: Option<Instant>,
}

impl LogInner {
    fn merge(&mut self, error: CompilerError, dedupe: bool) -> AddOutcome {
        if dedupe && let Some(&idx) = self.index.get(&error.hash) {
            let existing = &mut self.entries[idx];
            existing.duplicates = existing.duplicates.saturating_add(error.duplicates);
            existing.ips.extend(error.ips);
            if existing.source_dump.is_none() {
                existing.source_dump = error.source_dump;
            }
            return AddOutcome::Duplicate {
                count: existing.duplicates,
            };
        }
        self.index.insert(error.hash, self.entries.len());
        self.entries.push(error);
        AddOutcome::Queued
    }
}

/// Pending compiler errors awaiting a report.
pub struct ErrorLog {
    inner: Mutex<LogInner>,
    flushing: AtomicBool,
    dedupe: bool,
    mail_interval: Duration,
    max_entries: usize,
}

impl ErrorLog {
    pub fn new(dedupe: bool, mail_interval: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner::default()),
            flushing: AtomicBool::new(false),
            dedupe,
            mail_interval,
            max_entries,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an error with this hash is already queued.
    pub fn contains(&self, hash: &Hash128) -> bool {
        self.dedupe && self.lock().index.contains_key(hash)
    }

    pub fn add(&self, error: CompilerError) -> AddOutcome {
        let mut inner = self.lock();
        inner.last_added = Some(Instant::now());
        inner.merge(error, self.dedupe)
    }

    /// Put back entries whose report was not delivered.
    ///
    /// They merge with anything queued since by hash. The quiet-period timer
    /// is only started when the log was idle, so the retry waits a full
    /// `MailInterval`.
    pub fn requeue(&self, entries: Vec<CompilerError>) {
        if entries.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.last_added.get_or_insert_with(Instant::now);
        for error in entries {
            inner.merge(error, self.dedupe);
        }
    }

    /// Whether a report is due at `now`.
    pub fn should_flush(&self, now: Instant) -> bool {
        if self.flushing.load(Ordering::Acquire) {
            return false;
        }
        let inner = self.lock();
        if inner.entries.is_empty() {
            return false;
        }
        inner.entries.len() > self.max_entries
            || inner
                .last_added
                .is_some_and(|t| now.saturating_duration_since(t) >= self.mail_interval)
    }

    /// Take every queued entry when a report is due and none is in flight.
    ///
    /// The log refuses further batches until the returned batch is dropped.
    pub fn take_batch(self: &Arc<Self>, now: Instant) -> Option<ErrorBatch> {
        if !self.should_flush(now) {
            return None;
        }
        self.take_all()
    }

    /// Take every queued entry regardless of timing (shutdown path).
    pub fn take_all(self: &Arc<Self>) -> Option<ErrorBatch> {
        if self.is_empty() {
            return None;
        }
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let mut inner = self.lock();
        inner.index.clear();
        inner.last_added = None;
        let entries = std::mem::take(&mut inner.entries);
        Some(ErrorBatch {
            log: Arc::clone(self),
            entries,
        })
    }
}

/// Entries removed from the log for one report.
pub struct ErrorBatch {
    log: Arc<ErrorLog>,
    pub entries: Vec<CompilerError>,
}

impl ErrorBatch {
    pub fn groups(&self) -> Vec<MailGroup<'_>> {
        group_for_mail(&self.entries)
    }

    /// Return undelivered entries to the log they came from.
    pub fn requeue(&self, entries: Vec<CompilerError>) {
        self.log.requeue(entries);
    }
}

impl Drop for ErrorBatch {
    fn drop(&mut self) {
        self.log.flushing.store(false, Ordering::Release);
    }
}

/// Adjacent errors sharing platform, shader and CC list; one mail each.
#[derive(Debug)]
pub struct MailGroup<'a> {
    pub platform: &'a str,
    pub shader: &'a str,
    pub ccs: &'a [String],
    pub entries: Vec<&'a CompilerError>,
}

pub fn group_for_mail(entries: &[CompilerError]) -> Vec<MailGroup<'_>> {
    let mut groups: Vec<MailGroup<'_>> = Vec::new();
    for entry in entries {
        if let Some(group) = groups.last_mut()
            && group.platform == entry.platform
            && group.shader == entry.shader
            && group.ccs == entry.ccs.as_slice()
        {
            group.entries.push(entry);
            continue;
        }
        groups.push(MailGroup {
            platform: &entry.platform,
            shader: &entry.shader,
            ccs: &entry.ccs,
            entries: vec![entry],
        });
    }
    groups
}

impl MailGroup<'_> {
    pub fn subject(&self) -> String {
        let count: u32 = self.entries.iter().map(|e| e.duplicates).sum();
        format!(
            "[ShaderCompileServer] {count} compile error(s): {} {}",
            self.platform, self.shader
        )
    }

    pub fn body(&self) -> String {
        let mut out = String::new();
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push_str("\n----------------------------------------\n\n");
            }
            let ips: Vec<String> = e.ips.iter().map(ToString::to_string).collect();
            let _ = writeln!(out, "Shader:    {}", e.shader);
            let _ = writeln!(out, "Entry:     {}", e.entry);
            let _ = writeln!(out, "Platform:  {}", e.platform);
            let _ = writeln!(out, "Profile:   {}", e.profile);
            if !e.project.is_empty() {
                let _ = writeln!(out, "Project:   {}", e.project);
            }
            if !e.tags.is_empty() {
                let _ = writeln!(out, "Tags:      {}", e.tags);
            }
            if !e.request_line.is_empty() {
                let _ = writeln!(out, "Request:   {}", e.request_line);
            }
            let _ = writeln!(out, "Clients:   {} ({} occurrence(s))", ips.join(", "), e.duplicates);
            let _ = writeln!(out, "First seen: {}", e.first_seen.to_rfc3339());
            out.push('\n');
            out.push_str(&e.summary());
            if !e.context.is_empty() {
                out.push('\n');
                out.push_str(&e.context);
            }
        }
        out
    }

    /// Dumped sources to attach.
    pub fn attachments(&self) -> Vec<&Path> {
        self.entries
            .iter()
            .filter_map(|e| e.source_dump.as_deref())
            .collect()
    }
}
