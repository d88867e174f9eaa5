//! Environment variable resolver
//!
//! Handles `${VAR}` and `${VAR:-default}` against an environment snapshot
//! taken once at startup. The live process environment is never consulted
//! here, so resolution is deterministic for a given snapshot.

use crate::{ConfigError, Result};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static VAR_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok());

fn pattern() -> Result<&'static Regex> {
    VAR_PATTERN
        .as_ref()
        .ok_or_else(|| ConfigError::ValidationError("variable pattern failed to compile".into()))
}

/// Resolve every variable in `input`
///
/// A variable set to the empty string counts as set. All missing variables
/// without a default are reported together.
pub fn resolve_string(input: &str, env: &BTreeMap<String, String>) -> Result<String> {
    let mut missing = Vec::new();
    let resolved = pattern()?.replace_all(input, |cap: &Captures<'_>| {
        let name = &cap[1];
        match (env.get(name), cap.get(2)) {
            (Some(value), _) => value.clone(),
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::EnvVarNotFound(missing.join(", ")));
    }
    Ok(resolved.into_owned())
}

/// Resolve an optional value
pub fn resolve_option(
    input: Option<&str>,
    env: &BTreeMap<String, String>,
) -> Result<Option<String>> {
    input.map(|value| resolve_string(value, env)).transpose()
}

/// Resolve every element of a list
pub fn resolve_all(input: &[String], env: &BTreeMap<String, String>) -> Result<Vec<String>> {
    input.iter().map(|value| resolve_string(value, env)).collect()
}

/// Names of the variables `input` references, with or without defaults
pub fn find_references(input: &str) -> BTreeSet<String> {
    let Ok(pattern) = pattern() else {
        return BTreeSet::new();
    };
    pattern
        .captures_iter(input)
        .map(|cap| cap[1].to_string())
        .collect()
}
