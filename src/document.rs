//! Mock documents and directive lines.
//!
//! A rendered mock file is plain text where some lines carry metadata:
//!
//! ```text
//! # Returns a single user          -> description
//! > GET /users/:id                 -> documented input
//! < @status 201                    -> documented output, sets the status
//! < @header X-Request-Id: abc      -> documented output, adds a header
//! < @static avatar.png             -> documented output, serve _static/avatar.png
//! {"id": 1}                        -> body
//! ```
//!
//! A directive line is its prefix character followed by one space. All
//! directive lines are removed from the body.

use crate::config::ValidationPolicy;
use crate::error::RenderError;
use serde::Serialize;
use tracing::warn;

const DESCRIPTION_PREFIX: &str = "# ";
const INPUT_PREFIX: &str = "> ";
const OUTPUT_PREFIX: &str = "< ";

/// Parsed mock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MockDocument {
    pub description: Vec<String>,
    pub input: Vec<String>,
    pub output: Vec<String>,
    pub response: MockResponse,
}

/// Response described by a mock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MockResponse {
    pub status: u16,
    /// Headers in directive order
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Path below `_static/` to serve instead of the body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_asset: Option<String>,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: String::new(),
            static_asset: None,
        }
    }
}

impl MockResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing an existing one with the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }
}

/// Response-shaping directive found on an output line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    Status(u16),
    Header(String, String),
    Static(String),
}

impl MockDocument {
    /// Split expanded template text into directives and body.
    pub fn parse(text: &str, policy: ValidationPolicy) -> Result<Self, RenderError> {
        let mut doc = MockDocument {
            description: Vec::new(),
            input: Vec::new(),
            output: Vec::new(),
            response: MockResponse::default(),
        };
        let mut body = String::with_capacity(text.len());
        // Empty lines directly after a prefixed line belong to that line
        let mut after_prefixed = false;

        for line in text.split_inclusive('\n') {
            let was_after_prefixed = after_prefixed;
            after_prefixed = true;
            if was_after_prefixed && line.trim_end_matches(['\r', '\n']).is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix(DESCRIPTION_PREFIX) {
                doc.description.push(rest.trim_end().to_string());
            } else if let Some(rest) = line.strip_prefix(INPUT_PREFIX) {
                doc.input.push(rest.trim_end().to_string());
            } else if let Some(rest) = line.strip_prefix(OUTPUT_PREFIX) {
                let rest = rest.trim_end();
                doc.output.push(rest.to_string());
                match parse_directive(rest) {
                    Ok(None) => {}
                    Ok(Some(directive)) => doc.apply(directive),
                    Err(reason) if policy == ValidationPolicy::Strict => {
                        return Err(RenderError::Directive {
                            line: line.trim_end().to_string(),
                            reason,
                        });
                    }
                    Err(reason) => {
                        warn!(line = line.trim_end(), reason = %reason, "Ignoring malformed directive");
                    }
                }
            } else {
                after_prefixed = false;
                body.push_str(line);
            }
        }

        doc.response.body = body.trim_end().to_string();
        Ok(doc)
    }

    fn apply(&mut self, directive: Directive) {
        match directive {
            Directive::Status(status) => self.response.status = status,
            Directive::Header(name, value) => self.response.set_header(&name, &value),
            Directive::Static(path) => self.response.static_asset = Some(path),
        }
    }
}

/// Interpret the text of an output line.
///
/// Lines not starting with `@` are plain documentation.
fn parse_directive(text: &str) -> Result<Option<Directive>, String> {
    let Some(text) = text.strip_prefix('@') else {
        return Ok(None);
    };
    let (keyword, value) = text.split_once(' ').unwrap_or((text, ""));
    let value = value.trim();

    match keyword {
        "status" => {
            let status: u16 = value
                .parse()
                .map_err(|_| format!("status '{}' is not a number", value))?;
            if !(100..=599).contains(&status) {
                return Err(format!("status {} out of range", status));
            }
            Ok(Some(Directive::Status(status)))
        }
        "header" => {
            let (name, value) = value
                .split_once(':')
                .ok_or_else(|| "header needs 'Name: value'".to_string())?;
            let name = name.trim();
            if name.is_empty() || !name.bytes().all(is_token_byte) {
                return Err(format!("invalid header name '{}'", name));
            }
            Ok(Some(Directive::Header(name.to_string(), value.trim().to_string())))
        }
        "static" => {
            if value.is_empty() {
                return Err("static needs a path".to_string());
            }
            Ok(Some(Directive::Static(value.to_string())))
        }
        other => Err(format!("unknown directive '@{}'", other)),
    }
}

/// RFC 7230 token characters.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
