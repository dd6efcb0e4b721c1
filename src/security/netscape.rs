//! Netscape `cookies.txt`, the format the extractor reads and writes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const HEADER: &str = "# Netscape HTTP Cookie File\n# This is a generated file! Do not edit.\n\n";
const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    /// Unix seconds; 0 for a session cookie.
    pub expires: i64,
    pub name: String,
    pub value: String,
    pub http_only: bool,
}

impl Cookie {
    pub fn key(&self) -> (String, String, String) {
        (self.domain.to_ascii_lowercase(), self.path.clone(), self.name.clone())
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires > 0 && self.expires < now
    }
}

/// Parses a cookies file. Comments, blank lines and malformed rows are skipped.
pub fn parse(text: &str) -> Vec<Cookie> {
    text.lines().filter_map(parse_row).collect()
}

fn parse_row(line: &str) -> Option<Cookie> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (line, http_only) = match line.strip_prefix(HTTP_ONLY_PREFIX) {
        Some(rest) => (rest, true),
        None => (line, false),
    };
    if line.trim().is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 6 {
        log::debug!("[COOKIES] Skipping malformed row with {} fields", fields.len());
        return None;
    }

    let domain = fields[0].trim();
    let name = fields[5].trim();
    if domain.is_empty() || name.is_empty() {
        return None;
    }

    Some(Cookie {
        domain: domain.to_string(),
        include_subdomains: fields[1].eq_ignore_ascii_case("TRUE"),
        path: fields[2].to_string(),
        secure: fields[3].eq_ignore_ascii_case("TRUE"),
        expires: fields[4].trim().parse::<f64>().map(|v| v as i64).unwrap_or(0),
        name: name.to_string(),
        value: fields.get(6).map(|v| v.to_string()).unwrap_or_default(),
        http_only,
    })
}

pub fn serialize(cookies: &[Cookie]) -> String {
    let mut out = String::from(HEADER);
    for cookie in cookies {
        if cookie.http_only {
            out.push_str(HTTP_ONLY_PREFIX);
        }
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            cookie.domain,
            bool_field(cookie.include_subdomains),
            cookie.path,
            bool_field(cookie.secure),
            cookie.expires,
            cookie.name,
            cookie.value
        ));
    }
    out
}

/// Union of both sets keyed by (domain, path, name); `incoming` wins on conflict.
pub fn merge(existing: Vec<Cookie>, incoming: Vec<Cookie>) -> Vec<Cookie> {
    let mut merged: BTreeMap<(String, String, String), Cookie> = BTreeMap::new();
    for cookie in existing.into_iter().chain(incoming) {
        merged.insert(cookie.key(), cookie);
    }
    merged.into_values().collect()
}

fn bool_field(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}
