//! Template rendering for mock files.
//!
//! Mock files are Handlebars templates. The request is exposed as `params`,
//! `query`, `headers`, `method` and `path`; config variables as `vars`.
//! `{{load "name" key=value}}` renders `_templates/name.json` with the
//! caller's params extended by the given values and inserts its body.
//!
//! Every render gets its own context value and nested loads receive a copy,
//! so renders never observe each other's parameters.

use crate::config::{Config, ConfigStore, ValidationPolicy};
use crate::document::MockDocument;
use crate::error::RenderError;
use crate::resolver::{is_traversal, RequestDescriptor};
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderErrorReason,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Directory below the mock root holding `load`-able templates.
pub const TEMPLATES_DIR: &str = "_templates";

/// Nesting limit for `load`, guards against templates loading themselves.
const MAX_LOAD_DEPTH: usize = 16;

/// Why a file is being rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Answering a request; template errors are logged
    Response,
    /// Building the documentation listing; template errors are silent
    Documentation,
}

/// Data visible to a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateContext {
    /// Route parameters, extended by `load` arguments
    pub params: Map<String, Value>,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    /// Config `variables`
    pub vars: Map<String, Value>,
    pub method: String,
    pub path: String,
    #[serde(rename = "_render", default)]
    meta: RenderMeta,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct RenderMeta {
    depth: usize,
    strict: bool,
    quiet: bool,
}

impl TemplateContext {
    /// Context for a request and the parameters its route extracted.
    pub fn for_request(request: &RequestDescriptor, params: &HashMap<String, String>) -> Self {
        Self {
            params: params
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
            query: request.query.clone(),
            headers: request.headers.clone(),
            vars: Map::new(),
            method: request.method.clone(),
            path: request.path.clone(),
            meta: RenderMeta::default(),
        }
    }

    /// Set the shared template variables.
    pub fn with_vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    /// Copy of this context for a nested template, params extended by `extra`.
    fn nested(&self, extra: Map<String, Value>) -> Self {
        let mut child = self.clone();
        child.params.extend(extra);
        child.meta.depth += 1;
        child
    }
}

/// Renders mock files into [`MockDocument`]s.
pub struct TemplateRenderer {
    handlebars: Handlebars<'static>,
    store: Arc<ConfigStore>,
}

impl TemplateRenderer {
    /// Create a renderer for mocks below `root`.
    pub fn new(store: Arc<ConfigStore>, root: impl AsRef<Path>) -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper(
            "load",
            Box::new(LoadHelper {
                templates_dir: root.as_ref().join(TEMPLATES_DIR),
            }),
        );
        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Mock bodies are JSON, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars, store }
    }

    /// Render `file` for a request, using the current config's variables and
    /// validation policy.
    pub fn render(
        &self,
        file: &Path,
        request: &RequestDescriptor,
        params: &HashMap<String, String>,
        mode: RenderMode,
    ) -> Result<MockDocument, RenderError> {
        self.render_for(&self.store.get(), file, request, params, mode)
    }

    /// Render `file` for a request against a given config snapshot.
    pub fn render_for(
        &self,
        config: &Config,
        file: &Path,
        request: &RequestDescriptor,
        params: &HashMap<String, String>,
        mode: RenderMode,
    ) -> Result<MockDocument, RenderError> {
        let ctx = TemplateContext::for_request(request, params).with_vars(config.variables.clone());
        self.render_with(file, ctx, config.validation, mode)
    }

    /// Render `file` with an explicit context.
    pub fn render_with(
        &self,
        file: &Path,
        mut ctx: TemplateContext,
        policy: ValidationPolicy,
        mode: RenderMode,
    ) -> Result<MockDocument, RenderError> {
        ctx.meta = RenderMeta {
            depth: 0,
            strict: policy == ValidationPolicy::Strict,
            quiet: mode == RenderMode::Documentation,
        };

        let source = std::fs::read_to_string(file).map_err(|source| RenderError::Io {
            path: file.to_path_buf(),
            source,
        })?;

        let expanded = match self.handlebars.render_template(&source, &ctx) {
            Ok(text) => text,
            Err(e) => {
                if mode == RenderMode::Response {
                    warn!(file = %file.display(), error = %e, "Template error, serving unrendered text");
                }
                source
            }
        };

        let doc = MockDocument::parse(&expanded, policy)?;
        debug!(
            file = %file.display(),
            status = doc.response.status,
            bytes = doc.response.body.len(),
            "Rendered mock"
        );
        Ok(doc)
    }
}

/// `{{load "name" key=value}}`; an object as second parameter is merged too.
struct LoadHelper {
    templates_dir: PathBuf,
}

impl LoadHelper {
    fn template_path(&self, name: &str) -> Result<PathBuf, RenderErrorReason> {
        if name.is_empty() || is_traversal(name) {
            return Err(RenderErrorReason::Other(format!("invalid template name '{}'", name)));
        }
        Ok(self.templates_dir.join(format!("{}.json", name)))
    }
}

impl HelperDef for LoadHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let name = h
            .param(0)
            .and_then(|v| v.value().as_str())
            .ok_or(RenderErrorReason::ParamNotFoundForIndex("load", 0))?;

        let parent: TemplateContext =
            serde_json::from_value(ctx.data().clone()).map_err(RenderErrorReason::from)?;
        if parent.meta.depth >= MAX_LOAD_DEPTH {
            return Err(RenderErrorReason::Other(format!(
                "template '{}' nested deeper than {}",
                name, MAX_LOAD_DEPTH
            ))
            .into());
        }

        let mut extra = Map::new();
        if let Some(object) = h.param(1).and_then(|v| v.value().as_object()) {
            extra.extend(object.clone());
        }
        for (key, value) in h.hash() {
            extra.insert(key.to_string(), value.value().clone());
        }
        let child = parent.nested(extra);

        let path = self.template_path(name)?;
        let source = std::fs::read_to_string(&path).map_err(|e| {
            RenderErrorReason::Other(format!("failed to read template {}: {}", path.display(), e))
        })?;

        let expanded = match r.render_template(&source, &child) {
            Ok(text) => text,
            Err(e) => {
                if !child.meta.quiet {
                    warn!(template = %path.display(), error = %e, "Template error, inserting unrendered text");
                }
                source
            }
        };

        let policy = if child.meta.strict {
            ValidationPolicy::Strict
        } else {
            ValidationPolicy::Lenient
        };
        let doc = MockDocument::parse(&expanded, policy)
            .map_err(|e| RenderErrorReason::Other(e.to_string()))?;

        out.write(&doc.response.body)?;
        Ok(())
    }
}

// Custom Handlebars helpers

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value().clone()).unwrap_or(Value::Null);
    // Strings holding JSON are re-serialized, anything else is serialized as is
    let value = match value {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    };
    out.write(&serde_json::to_string_pretty(&value).unwrap_or_default())?;
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let uuid = format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffffffffffff,
    );
    out.write(&uuid)?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::Utc;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    out.write(&Utc::now().format(format).to_string())?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);
    if max < min {
        return Err(RenderErrorReason::Other(format!("random: {} > {}", min, max)).into());
    }

    let value = rand::thread_rng().gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(Value::String(_)) | Some(Value::Null) | None => out.write(default)?,
        Some(v) => out.write(&v.to_string())?,
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}
