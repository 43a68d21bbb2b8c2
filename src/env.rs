//! Environment resolution: merges OS env, env files, manager-wide globals,
//! and spec-level env, then expands `${VAR}` references.
//!
//! Adapted from `systemg::config::{EnvConfig::merge, expand_env_vars,
//! load_env_file}`, but deliberately diverges where the teacher panics: a
//! missing `${VAR}` reference or a malformed env-file line there is either
//! silently skipped or a `panic!`; here both are recoverable
//! [`crate::error::EngineError::EnvFileParse`] values, since the engine must
//! never crash a caller over a malformed input file.

use std::collections::HashMap;
use std::path::Path;

use crate::error::EngineError;

/// Maximum number of `${VAR}` substitution passes before giving up, to
/// prevent infinite expansion cycles (spec §4.3: "fixed maximum
/// substitution depth").
const MAX_SUBSTITUTION_DEPTH: usize = 8;

/// Resolves the final `KEY=VALUE` environment for a spawned child.
#[derive(Debug, Default, Clone)]
pub struct EnvResolver {
    /// Whether the host process's own environment is included, lowest
    /// precedence.
    pub use_os_env: bool,
    /// Ordered env files, later files win over earlier ones.
    pub env_files: Vec<String>,
    /// Manager-wide globals, applied after env files.
    pub global_env: Vec<String>,
    /// Spec-level overrides, highest precedence.
    pub spec_env: Vec<String>,
}

impl EnvResolver {
    /// Merge every layer (later wins) and expand `${VAR}` references.
    /// Returns a deduplicated, order-stable list of `KEY=VALUE` strings.
    pub fn resolve(&self) -> Result<Vec<String>, EngineError> {
        let mut merged: HashMap<String, String> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        let mut push = |merged: &mut HashMap<String, String>, order: &mut Vec<String>, line: &str| -> Result<(), EngineError> {
            let (key, value) = split_kv(line)
                .ok_or_else(|| EngineError::EnvFileParse(format!("malformed entry '{line}'")))?;
            if key.is_empty() {
                return Err(EngineError::EnvFileParse(format!(
                    "empty key in entry '{line}'"
                )));
            }
            if !merged.contains_key(&key) {
                order.push(key.clone());
            }
            merged.insert(key, value);
            Ok(())
        };

        if self.use_os_env {
            for (k, v) in std::env::vars() {
                if !merged.contains_key(&k) {
                    order.push(k.clone());
                }
                merged.insert(k, v);
            }
        }

        for path in &self.env_files {
            for line in parse_env_file(Path::new(path))? {
                push(&mut merged, &mut order, &line)?;
            }
        }

        for line in &self.global_env {
            push(&mut merged, &mut order, line)?;
        }

        for line in &self.spec_env {
            push(&mut merged, &mut order, line)?;
        }

        expand_all(&mut merged)?;

        Ok(order
            .into_iter()
            .map(|k| {
                let v = merged.get(&k).cloned().unwrap_or_default();
                format!("{k}={v}")
            })
            .collect())
    }
}

/// Splits a `KEY=VALUE` line, stripping one layer of surrounding quotes
/// from the value. Returns `None` if there is no `=`.
fn split_kv(line: &str) -> Option<(String, String)> {
    let idx = line.find('=')?;
    let key = line[..idx].trim().to_string();
    let mut value = line[idx + 1..].trim().to_string();
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            value = value[1..value.len() - 1].to_string();
        }
    }
    Some((key, value))
}

/// Reads an env file: `KEY=VALUE` lines, `#` comments, blank lines
/// skipped. A line with content but no `=` is `EnvFileParse`.
fn parse_env_file(path: &Path) -> Result<Vec<String>, EngineError> {
    let contents = std::fs::read_to_string(path)?;
    let mut lines = Vec::new();
    for raw in contents.lines() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if !trimmed.contains('=') {
            return Err(EngineError::EnvFileParse(format!(
                "{}: malformed line '{trimmed}'",
                path.display()
            )));
        }
        lines.push(trimmed.to_string());
    }
    Ok(lines)
}

/// Expands `${VAR}`/`$VAR` references in every value against the current
/// merged map, left to right, up to [`MAX_SUBSTITUTION_DEPTH`] passes.
fn expand_all(merged: &mut HashMap<String, String>) -> Result<(), EngineError> {
    for _ in 0..MAX_SUBSTITUTION_DEPTH {
        let mut changed = false;
        let keys: Vec<String> = merged.keys().cloned().collect();
        for key in keys {
            let current = merged.get(&key).cloned().unwrap_or_default();
            let expanded = expand_once(&current, merged);
            if expanded != current {
                merged.insert(key, expanded);
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
    }
    Ok(())
}

/// One left-to-right pass expanding `${VAR}` references found in `input`
/// against `env`. Unresolved references are left verbatim (no panic).
fn expand_once(input: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                if let Some(value) = env.get(name) {
                    out.push_str(value);
                } else {
                    out.push_str(&input[i..i + 2 + end + 1]);
                }
                i += 2 + end + 1;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}
