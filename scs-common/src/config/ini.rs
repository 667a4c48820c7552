//! `config.ini` parsing with typed, error-collecting accessors.
//!
//! Grammar, one statement per line:
//!
//! ```text
//! -- comment            (also `;` and `#`)
//! [Group]
//! key = "value"         (quotes optional)
//! ```
//!
//! Keys are matched case-insensitively. Lookups without a section search the
//! whole document, so plain settings may live in any group.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while reading a configuration file.
#[derive(Debug, Error)]
pub enum IniError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: expected `key = value`, got '{text}'")]
    Syntax { line: usize, text: String },

    #[error("line {line}: unterminated section header '{text}'")]
    Section { line: usize, text: String },

    #[error("invalid value for {key}: expected {expected}, got '{value}'")]
    InvalidValue {
        key: String,
        expected: String,
        value: String,
    },
}

/// One `key = value` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniEntry {
    pub section: Option<String>,
    pub key: String,
    pub value: String,
    pub line: usize,
}

/// A parsed configuration document.
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    entries: Vec<IniEntry>,
}

fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    let bytes = line.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quote = !in_quote,
            b'-' if !in_quote && bytes.get(idx + 1) == Some(&b'-') => return &line[..idx],
            b';' | b'#' if !in_quote => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

impl IniDocument {
    /// Parse document text.
    pub fn parse(text: &str) -> Result<Self, IniError> {
        let mut entries = Vec::new();
        let mut section: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let Some(name) = rest.strip_suffix(']') else {
                    return Err(IniError::Section {
                        line: line_no,
                        text: line.to_string(),
                    });
                };
                let name = name.trim();
                section = (!name.is_empty()).then(|| name.to_string());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(IniError::Syntax {
                    line: line_no,
                    text: line.to_string(),
                });
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(IniError::Syntax {
                    line: line_no,
                    text: line.to_string(),
                });
            }
            entries.push(IniEntry {
                section: section.clone(),
                key: key.to_string(),
                value: unquote(value).to_string(),
                line: line_no,
            });
        }

        Ok(Self { entries })
    }

    /// Read and parse a file.
    pub fn load(path: &Path) -> Result<Self, IniError> {
        let text = std::fs::read_to_string(path).map_err(|source| IniError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Last value for `key` in any section.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.key.eq_ignore_ascii_case(key))
            .map(|e| e.value.as_str())
    }

    /// All entries of one section, in file order.
    pub fn section<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a IniEntry> + 'a {
        self.entries.iter().filter(move |e| {
            e.section
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(name))
        })
    }
}

/// Typed accessor over an [`IniDocument`].
///
/// Collects errors during lookups so all issues can be reported at once; a
/// bad value falls back to the default.
pub struct IniReader<'a> {
    doc: &'a IniDocument,
    errors: Vec<IniError>,
}

impl<'a> IniReader<'a> {
    pub fn new(doc: &'a IniDocument) -> Self {
        Self {
            doc,
            errors: Vec::new(),
        }
    }

    pub fn take_errors(&mut self) -> Vec<IniError> {
        std::mem::take(&mut self.errors)
    }

    /// Record a value rejected by caller-side validation.
    pub fn reject(&mut self, key: &str, expected: &str, value: &str) {
        self.errors.push(IniError::InvalidValue {
            key: key.to_string(),
            expected: expected.to_string(),
            value: value.to_string(),
        });
    }

    /// First present key among `keys` (for accepted alternate spellings).
    fn lookup(&self, keys: &[&str]) -> Option<(String, &'a str)> {
        keys.iter()
            .find_map(|k| self.doc.get(k).map(|v| (k.to_string(), v)))
    }

    pub fn get_opt_string(&mut self, key: &str) -> Option<String> {
        self.doc
            .get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Accepts: 1, true, yes, on / 0, false, no, off.
    pub fn get_bool(&mut self, key: &str, default: bool) -> bool {
        let Some(value) = self.doc.get(key) else {
            return default;
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                self.errors.push(IniError::InvalidValue {
                    key: key.to_string(),
                    expected: "boolean (1/0/true/false)".to_string(),
                    value: value.to_string(),
                });
                default
            }
        }
    }

    pub fn get_u64_any(&mut self, keys: &[&str], default: u64) -> u64 {
        let Some((key, value)) = self.lookup(keys) else {
            return default;
        };
        match value.trim().parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                self.errors.push(IniError::InvalidValue {
                    key,
                    expected: "unsigned integer".to_string(),
                    value: value.to_string(),
                });
                default
            }
        }
    }

    pub fn get_u64(&mut self, key: &str, default: u64) -> u64 {
        self.get_u64_any(&[key], default)
    }

    pub fn get_u16(&mut self, key: &str, default: u16) -> u16 {
        let value = self.get_u64(key, u64::from(default));
        match u16::try_from(value) {
            Ok(v) => v,
            Err(_) => {
                self.errors.push(IniError::InvalidValue {
                    key: key.to_string(),
                    expected: "integer in 0..=65535".to_string(),
                    value: value.to_string(),
                });
                default
            }
        }
    }

    /// Whole seconds.
    pub fn get_secs(&mut self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.get_u64(key, default.as_secs()))
    }

    /// Separated list; empty items dropped.
    pub fn get_list(&mut self, key: &str, separators: &[char]) -> Vec<String> {
        self.doc
            .get(key)
            .map(|v| {
                v.split(separators)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
