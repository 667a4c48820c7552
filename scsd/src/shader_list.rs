//! Per-project, per-platform shader request lists.
//!
//! Clients report every shader permutation they request as a "request line"
//! such as `<3>Illum@Common_ZPass(%DIFFUSE)`. The leading `<n>` is a use
//! counter; lines are keyed without it and counts accumulate. Each
//! `(project, platform)` pair maps to `ShaderList/<project>_<platform>.txt`
//! with one `<count>line` per row.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Split `<n>rest` into `(n, rest)`. Lines without a counter count once.
pub fn split_request_counter(line: &str) -> (u64, &str) {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix('<')
        && let Some((count, body)) = rest.split_once('>')
        && let Ok(count) = count.trim().parse::<u64>()
    {
        return (count.max(1), body.trim());
    }
    (1, trimmed)
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "Default".to_string()
    } else {
        cleaned
    }
}

/// File holding the list for one project/platform pair.
pub fn list_path(dir: &Path, project: &str, platform: &str) -> PathBuf {
    dir.join(format!("{}_{}.txt", sanitize(project), sanitize(platform)))
}

/// Counters come from clients and saturate instead of wrapping.
fn bump(counts: &mut BTreeMap<String, u64>, line: String, count: u64) {
    let slot = counts.entry(line).or_insert(0);
    *slot = slot.saturating_add(count);
}

fn parse_list(text: &str) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let (count, body) = split_request_counter(line);
        bump(&mut counts, body.to_string(), count);
    }
    counts
}

fn render_list(counts: &BTreeMap<String, u64>) -> String {
    let mut out = String::new();
    for (line, count) in counts {
        out.push('<');
        out.push_str(&count.to_string());
        out.push('>');
        out.push_str(line);
        out.push('\n');
    }
    out
}

type ListKey = (String, String);

/// Request lines accumulated since the last flush.
#[derive(Default)]
pub struct ShaderListStore {
    pending: Mutex<HashMap<ListKey, BTreeMap<String, u64>>>,
}

impl ShaderListStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ListKey, BTreeMap<String, u64>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, project: &str, platform: &str, request_line: &str) {
        let (count, body) = split_request_counter(request_line);
        if body.is_empty() {
            return;
        }
        let mut pending = self.lock();
        let counts = pending
            .entry((project.to_string(), platform.to_string()))
            .or_default();
        bump(counts, body.to_string(), count);
    }

    /// Number of distinct lines waiting to be written.
    pub fn pending_lines(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    /// Merge pending counts into the list files under `dir`.
    ///
    /// Each file is rewritten through a temp file and a rename. Lists that
    /// fail to write are kept for the next flush. Returns the number of files
    /// written.
    pub fn flush(&self, dir: &Path) -> io::Result<usize> {
        let batch = std::mem::take(&mut *self.lock());
        if batch.is_empty() {
            return Ok(0);
        }
        fs::create_dir_all(dir)?;

        let mut written = 0;
        let mut first_error = None;
        for ((project, platform), counts) in batch {
            let path = list_path(dir, &project, &platform);
            match merge_into(&path, &counts) {
                Ok(()) => {
                    written += 1;
                    debug!(path = %path.display(), lines = counts.len(), "shader list updated");
                }
                Err(err) => {
                    warn!(path = %path.display(), "shader list write failed: {err}");
                    let mut pending = self.lock();
                    let slot = pending.entry((project, platform)).or_default();
                    for (line, count) in counts {
                        bump(slot, line, count);
                    }
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }
}

fn merge_into(path: &Path, counts: &BTreeMap<String, u64>) -> io::Result<()> {
    let mut merged = match fs::read_to_string(path) {
        Ok(text) => parse_list(&text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
        Err(err) => return Err(err),
    };
    for (line, count) in counts {
        bump(&mut merged, line.clone(), *count);
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(render_list(&merged).as_bytes())?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
