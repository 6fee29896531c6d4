//! Route pattern compilation.
//!
//! A route pattern is a request path with typed placeholders, e.g.
//! `/users/:id/files/:path:any`. Compiling it yields an anchored regex, the
//! parameter names in capture order, a display form and the on-disk file path
//! template every matching request resolves to.

use crate::config::ValidationPolicy;
use crate::error::RouteCompileError;
use regex::Regex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::warn;

/// Placeholder syntax: `:name` optionally followed by `:kind`.
static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER_REGEX.get_or_init(|| {
        Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)(?::([a-z]+))?")
            .expect("placeholder regex is valid")
    })
}

/// Character class a placeholder may capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaceholderKind {
    /// Anything but a slash
    #[default]
    Segment,
    /// ASCII letters and digits
    Alnum,
    /// Anything, slashes included
    Any,
    /// ASCII letters
    Alpha,
    /// ASCII digits
    Num,
}

impl PlaceholderKind {
    /// Regex fragment matching one or more characters of this kind.
    pub fn pattern(self) -> &'static str {
        match self {
            PlaceholderKind::Segment => "[^/]+",
            PlaceholderKind::Alnum => "[0-9a-zA-Z]+",
            PlaceholderKind::Any => ".+",
            PlaceholderKind::Alpha => "[a-zA-Z]+",
            PlaceholderKind::Num => "[0-9]+",
        }
    }
}

impl FromStr for PlaceholderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "segment" => Ok(PlaceholderKind::Segment),
            "alnum" => Ok(PlaceholderKind::Alnum),
            "any" => Ok(PlaceholderKind::Any),
            "alpha" => Ok(PlaceholderKind::Alpha),
            "num" => Ok(PlaceholderKind::Num),
            _ => Err(()),
        }
    }
}

/// A compiled route.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    /// Pattern as written in the config
    pub raw_pattern: String,
    /// Parameter names in capture-group order
    pub param_names: Vec<String>,
    /// Anchored matcher for request paths
    pub matcher: Regex,
    /// Pattern with every placeholder shown as `*`
    pub display_pattern: String,
    /// Pattern with every placeholder replaced by its bare name
    pub file_path_template: String,
}

impl RouteSpec {
    /// Compile a raw route pattern.
    ///
    /// Unknown matcher kinds fail under [`ValidationPolicy::Strict`] and fall
    /// back to `segment` under [`ValidationPolicy::Lenient`].
    pub fn compile(raw: &str, policy: ValidationPolicy) -> Result<Self, RouteCompileError> {
        let mut param_names = Vec::new();
        let mut expr = String::from("^");
        let mut display = String::new();
        let mut file_path = String::new();
        let mut last = 0;

        for caps in placeholder_regex().captures_iter(raw) {
            let whole = caps.get(0).expect("group 0 always present");
            let name = &caps[1];
            let literal = &raw[last..whole.start()];

            let kind = match caps.get(2) {
                None => PlaceholderKind::Segment,
                Some(kind) => match kind.as_str().parse() {
                    Ok(kind) => kind,
                    Err(()) if policy == ValidationPolicy::Strict => {
                        return Err(RouteCompileError::UnknownMatcher {
                            pattern: raw.to_string(),
                            param: name.to_string(),
                            kind: kind.as_str().to_string(),
                        });
                    }
                    Err(()) => {
                        warn!(
                            route = raw,
                            param = name,
                            kind = kind.as_str(),
                            "Unknown placeholder matcher, using segment"
                        );
                        PlaceholderKind::Segment
                    }
                },
            };

            expr.push_str(&regex::escape(literal));
            expr.push('(');
            expr.push_str(kind.pattern());
            expr.push(')');

            display.push_str(literal);
            display.push('*');

            file_path.push_str(literal);
            file_path.push_str(name);

            param_names.push(name.to_string());
            last = whole.end();
        }

        let tail = &raw[last..];
        expr.push_str(&regex::escape(tail));
        expr.push('$');
        display.push_str(tail);
        file_path.push_str(tail);

        let matcher = Regex::new(&expr).map_err(|source| RouteCompileError::Regex {
            pattern: raw.to_string(),
            source,
        })?;

        Ok(Self {
            raw_pattern: raw.to_string(),
            param_names,
            matcher,
            display_pattern: display,
            file_path_template: file_path,
        })
    }

    /// Match a request path, returning the extracted parameters.
    pub fn captures(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.matcher.captures(path)?;
        let params = self
            .param_names
            .iter()
            .zip(caps.iter().skip(1))
            .filter_map(|(name, m)| m.map(|m| (name.clone(), m.as_str().to_string())))
            .collect();
        Some(params)
    }

    /// Display pattern with each `*` replaced by `:name`, in parameter order.
    pub fn documented_pattern(&self) -> String {
        let mut out = self.display_pattern.clone();
        for name in &self.param_names {
            if let Some(pos) = out.find('*') {
                out.replace_range(pos..pos + 1, &format!(":{}", name));
            }
        }
        out
    }
}
