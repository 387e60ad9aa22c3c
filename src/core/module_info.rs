//! Terminal module manifest model - parsed from a module's `module.prop`

use std::collections::HashMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Manifest file every module directory must contain
pub const MODULE_PROP: &str = "module.prop";

/// Version code used when `versionCode` is absent or not numeric
pub const UNKNOWN_VERSION_CODE: i64 = -1;

/// Errors that can occur while reading a module manifest
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Module id is null or empty")]
    MissingId,

    #[error("Module id '{0}' is not a valid directory name")]
    InvalidId(String),

    #[error("Manifest is not valid UTF-8")]
    InvalidEncoding,
}

/// Metadata of one terminal module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    /// Unique id, also the module's directory name
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub version_code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_json: Option<String>,
    /// Derived from the absence of the `disable` sentinel, recomputed on every read
    #[serde(default)]
    pub enabled: bool,
}

impl ModuleInfo {
    /// Parse manifest bytes into a module description.
    ///
    /// The returned value always has `enabled == false`; callers that read from disk
    /// fill it in from the sentinel file.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ManifestError::InvalidEncoding)?;
        let mut props = parse_properties(text);

        let id = props.remove("id").unwrap_or_default();
        if id.is_empty() {
            return Err(ManifestError::MissingId);
        }
        if !is_valid_module_id(&id) {
            return Err(ManifestError::InvalidId(id));
        }

        let version_code = props
            .remove("versionCode")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(UNKNOWN_VERSION_CODE);

        Ok(Self {
            id,
            name: props.remove("name"),
            version: props.remove("version"),
            version_code,
            author: props.remove("author"),
            description: props.remove("description"),
            update_json: props.remove("updateJson"),
            enabled: false,
        })
    }

    /// Human readable summary lines, printed while installing
    pub fn summary_lines(&self) -> Vec<String> {
        let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "null".to_string());
        vec![
            format!("moduleId: {}", self.id),
            format!("moduleName: {}", show(&self.name)),
            format!("version: {}", show(&self.version)),
            format!("versionCode: {}", self.version_code),
            format!("author: {}", show(&self.author)),
            format!("description: {}", show(&self.description)),
        ]
    }
}

fn module_id_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("Invalid module id regex"))
}

/// A module id doubles as a directory name, so it must be one plain path component
pub fn is_valid_module_id(id: &str) -> bool {
    id != "." && id != ".." && module_id_regex().is_match(id)
}

/// Parse `key=value` / `key:value` lines.
///
/// Supports `#` and `!` comments, trailing-backslash continuation lines and the
/// escapes `\t`, `\n`, `\r`, `\\` and `\uXXXX`. Later keys override earlier ones.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    let mut lines = text.lines();

    while let Some(raw) = lines.next() {
        let mut logical = raw.trim_start().to_string();
        if logical.is_empty() || logical.starts_with('#') || logical.starts_with('!') {
            continue;
        }
        while ends_with_continuation(&logical) {
            logical.pop();
            match lines.next() {
                Some(next) => logical.push_str(next.trim_start()),
                None => break,
            }
        }

        let (key, value) = split_key_value(&logical);
        props.insert(unescape(key), unescape(value));
    }

    props
}

/// An odd number of trailing backslashes continues the line
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

fn split_key_value(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => {
                return (line[..i].trim_end(), line[i + 1..].trim_start());
            }
            c if c.is_whitespace() => {
                let rest = line[i..].trim_start();
                let rest = rest
                    .strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
                    .unwrap_or(rest);
                return (&line[..i], rest.trim_start());
            }
            _ => {}
        }
    }
    (line, "")
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\x0c'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
