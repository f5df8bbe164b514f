// src/network/sanitize.rs — Redaction of sensitive request material
//
// Applied to every record before it leaves the tap: query parameters,
// headers, and body fields whose names match the configured token sets
// are replaced with a redaction marker; oversized bodies are truncated.

use serde_json::Value;
use std::collections::HashMap;

use crate::infra::config::NetworkConfig;

pub const REDACTED: &str = "[REDACTED]";
const TRUNCATION_MARKER: &str = "...[truncated]";

pub struct Sanitizer {
    params: Vec<String>,
    headers: Vec<String>,
    body_fields: Vec<String>,
    max_body_size: usize,
}

impl Sanitizer {
    pub fn from_config(config: &NetworkConfig) -> Self {
        let lower = |list: &[String]| list.iter().map(|t| t.to_lowercase()).collect();
        Self {
            params: lower(&config.sanitize_params),
            headers: lower(&config.sanitize_headers),
            body_fields: lower(&config.sanitize_body_fields),
            max_body_size: config.max_body_size,
        }
    }

    fn param_matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.params.iter().any(|token| name.contains(token))
    }

    fn header_matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.headers.iter().any(|token| name == *token)
    }

    fn body_field_matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.body_fields.iter().any(|token| name.contains(token))
    }

    /// Redact matching query parameter values, re-serializing the URL. A
    /// URL that fails to parse passes through unchanged.
    pub fn sanitize_url(&self, url: &str) -> String {
        let Ok(mut parsed) = reqwest::Url::parse(url) else {
            return url.to_string();
        };
        if parsed.query().is_none() {
            return url.to_string();
        }

        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| {
                let value = if self.param_matches(&k) {
                    REDACTED.to_string()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), value)
            })
            .collect();

        parsed.query_pairs_mut().clear().extend_pairs(pairs);
        parsed.to_string()
    }

    /// Lowercase header keys, replacing values of sensitive headers.
    pub fn sanitize_headers(&self, headers: &[(String, String)]) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(k, v)| {
                let key = k.to_lowercase();
                let value = if self.header_matches(&key) {
                    REDACTED.to_string()
                } else {
                    v.clone()
                };
                (key, value)
            })
            .collect()
    }

    /// Redact a request or response body.
    ///
    /// Oversized bodies are truncated before any parsing. JSON text is
    /// parsed and redacted recursively; form-encoded pairs and multipart
    /// entries are redacted per field; anything else passes through as a
    /// plain string.
    pub fn sanitize_body(&self, body: &str) -> Value {
        if body.len() > self.max_body_size {
            let truncated = truncate_on_char_boundary(body, self.max_body_size);
            return Value::String(format!("{truncated}{TRUNCATION_MARKER}"));
        }

        if let Ok(mut parsed) = serde_json::from_str::<Value>(body) {
            if parsed.is_object() || parsed.is_array() {
                self.redact_json(&mut parsed);
                return parsed;
            }
        }

        if looks_form_encoded(body) {
            return Value::String(self.sanitize_form_encoded(body));
        }

        if body.contains("Content-Disposition: form-data;") {
            return Value::String(self.sanitize_multipart(body));
        }

        Value::String(body.to_string())
    }

    fn redact_json(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.body_field_matches(key) {
                        *child = Value::String(REDACTED.to_string());
                    } else {
                        self.redact_json(child);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact_json(item);
                }
            }
            _ => {}
        }
    }

    fn sanitize_form_encoded(&self, body: &str) -> String {
        body.split('&')
            .map(|pair| match pair.split_once('=') {
                Some((name, _)) if self.body_field_matches(name) => {
                    format!("{name}={REDACTED}")
                }
                _ => pair.to_string(),
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Redact the value lines that follow a matching multipart field name.
    fn sanitize_multipart(&self, body: &str) -> String {
        let mut out = Vec::new();
        let mut redacting = false;
        for line in body.lines() {
            if let Some(name) = multipart_field_name(line) {
                redacting = self.body_field_matches(name);
                out.push(line.to_string());
            } else if line.starts_with("--") {
                redacting = false;
                out.push(line.to_string());
            } else if redacting && !line.is_empty() {
                out.push(REDACTED.to_string());
            } else {
                out.push(line.to_string());
            }
        }
        out.join("\n")
    }
}

/// Cut a captured body at the largest character boundary not past
/// `max_len` bytes, so truncation never splits a multi-byte character.
fn truncate_on_char_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let cut = (0..=max_len)
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0);
    &s[..cut]
}

fn looks_form_encoded(body: &str) -> bool {
    !body.contains('\n')
        && body.contains('=')
        && body
            .split('&')
            .all(|pair| pair.split_once('=').is_some_and(|(k, _)| !k.is_empty()))
}

fn multipart_field_name(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("Content-Disposition: form-data;")?;
    let start = rest.find("name=\"")? + "name=\"".len();
    let end = rest[start..].find('"')? + start;
    Some(&rest[start..end])
}
