//! API documentation listing.
//!
//! Every mock file `<path>_<method>.json` below the root documents one call.
//! Files are rendered in documentation mode so template errors stay quiet.

use crate::config::Config;
use crate::resolver::{resolve_with, RequestDescriptor};
use crate::template::{RenderMode, TemplateContext, TemplateRenderer};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Methods recognised in mock file names, in listing order.
const METHODS: &[&str] = &["get", "post", "put", "delete", "patch"];

/// One documented call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallDoc {
    pub method: String,
    pub path: String,
    pub description: Vec<String>,
    pub input: Vec<String>,
    pub output: Vec<String>,
    pub response: String,
}

/// Build the documentation for every mock file below `root`.
pub fn collect(config: &Config, root: &Path, renderer: &TemplateRenderer) -> Vec<CallDoc> {
    let mut files = Vec::new();
    walk(root, &mut files);

    let mut calls: Vec<CallDoc> = files
        .iter()
        .filter_map(|file| document(config, root, renderer, file))
        .collect();

    calls.sort_by(|a, b| {
        a.path
            .cmp(&b.path)
            .then_with(|| method_weight(&a.method).cmp(&method_weight(&b.method)))
    });
    calls
}

fn document(config: &Config, root: &Path, renderer: &TemplateRenderer, file: &Path) -> Option<CallDoc> {
    let relative = file.strip_prefix(root).ok()?.to_str()?;
    let (method, base) = split_mock_name(relative)?;
    let request_path = format!("/{}", base.replace('\\', "/"));

    let location = resolve_with(config, root, method, &request_path);
    let (path, params) = match &location.matched_route {
        Some(route) => {
            let params = route
                .param_names
                .iter()
                .map(|name| (name.clone(), "1".to_string()))
                .collect();
            (route.documented_pattern(), params)
        }
        None => (request_path.clone(), location.params.clone()),
    };

    let request = RequestDescriptor::new(&method.to_uppercase(), &request_path, None);
    let ctx = TemplateContext::for_request(&request, &params).with_vars(config.variables.clone());
    let doc = match renderer.render_with(file, ctx, config.validation, RenderMode::Documentation) {
        Ok(doc) => doc,
        Err(e) => {
            debug!(file = %file.display(), error = %e, "Skipping undocumentable mock");
            return None;
        }
    };

    Some(CallDoc {
        method: method.to_uppercase(),
        path,
        description: doc.description,
        input: doc.input,
        output: doc.output,
        response: doc.response.body,
    })
}

/// `users/id_get.json` → (`get`, `users/id`).
fn split_mock_name(relative: &str) -> Option<(&'static str, &str)> {
    let stem = relative.strip_suffix(".json")?;
    let (base, method) = stem.rsplit_once('_')?;
    let method = METHODS.iter().copied().find(|m| *m == method)?;
    Some((method, base))
}

fn method_weight(method: &str) -> usize {
    METHODS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(method))
        .unwrap_or(usize::MAX)
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => walk(&path, files),
            Ok(t) if t.is_file() => files.push(path),
            _ => {}
        }
    }
}
