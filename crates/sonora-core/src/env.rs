//! Environment variables with `configs/.env` fallback.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_ENV_FILE: &str = "configs/.env";

/// Parse `KEY=VALUE` lines. Blank lines, `#` comments and malformed lines are
/// skipped; values may be quoted and keys may carry an `export ` prefix.
pub fn parse_env_file(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key.to_string(), parse_value(value.trim())))
        })
        .collect()
}

fn parse_value(raw: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(inner) = raw
            .strip_prefix(quote)
            .and_then(|rest| rest.rfind(quote).map(|end| &rest[..end]))
        {
            return inner.to_string();
        }
    }
    // Unquoted values may carry a trailing ` # comment`.
    match raw.find(" #") {
        Some(idx) => raw[..idx].trim_end().to_string(),
        None => raw.to_string(),
    }
}

/// Export the variables of an env file that are not already set.
/// Returns how many were applied; a missing file applies nothing.
pub fn load_env_file(path: &Path) -> Result<usize> {
    if !path.is_file() {
        return Ok(0);
    }
    let contents = std::fs::read_to_string(path)?;
    let mut applied = 0;
    for (key, value) in parse_env_file(&contents) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(&key, value);
            applied += 1;
        }
    }
    debug!(path = %path.display(), applied, "Loaded env file");
    Ok(applied)
}

/// Read a required variable, consulting `configs/.env` first.
pub fn read_env(key: &str) -> Result<String> {
    read_env_from(&PathBuf::from(DEFAULT_ENV_FILE), key)
}

pub fn read_env_from(env_file: &Path, key: &str) -> Result<String> {
    load_env_file(env_file)?;
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "{key} is not set. Define it in the environment or in {}",
                env_file.display()
            ))
        })
}
