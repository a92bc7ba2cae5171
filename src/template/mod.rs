//! Template model: YAML decoding, compilation and execution entry
//! points.
//!
//! A template is immutable after [`Template::compile`]; execution never
//! mutates it and per-execution state lives on the
//! [`ScanContext`](crate::scan::ScanContext).

pub mod executor;
pub mod payloads;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::dsl::{self, VariableMap};
use crate::error::{CompileError, TemplateError};
use crate::http::HttpRequest;
use crate::network::NetworkRequest;
use crate::scan::{ResultEvent, ScanContext};

/// Severity attached to a template's findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    #[default]
    Info,
    #[serde(other)]
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
            Severity::Unknown => "unknown",
        }
    }
}

/// `reference:` accepts a single string or a list and round-trips to a
/// list.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
        Empty(()),
    }

    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::One(s) => vec![s],
        StringOrList::Many(list) => list,
        StringOrList::Empty(()) => Vec::new(),
    })
}

/// Descriptive template metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateInfo {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(default)]
    pub severity: Severity,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, deserialize_with = "string_or_list", skip_serializing_if = "Vec::is_empty")]
    pub reference: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vendor: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tags: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zombie: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_yaml::Value>,
}

/// A declarative probe: metadata, once-evaluated variables and an
/// ordered list of HTTP and/or network request blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,

    /// Advisory flag: the probe is noisy or intrusive
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub opsec: bool,

    #[serde(default)]
    pub info: TemplateInfo,

    /// Named expressions evaluated once at template start
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub variables: serde_yaml::Mapping,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpRequest>,

    /// Legacy alias for `http:`; folded into it at compile time
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<HttpRequest>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkRequest>,

    /// Short-circuits the executor on the first matching request
    #[serde(rename = "stop-at-first-match", default)]
    pub stop_at_first_match: bool,

    // Cosmetic fields for upstream consumers; no engine semantics.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fingers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chains: Vec<String>,

    /// Sum over requests of the payload iteration length
    #[serde(skip)]
    pub total_requests: usize,

    #[serde(skip)]
    compiled: bool,
}

impl Template {
    /// Decodes a template from YAML. Unknown fields are ignored.
    pub fn from_yaml(yaml: &str) -> Result<Self, TemplateError> {
        let template: Template =
            serde_yaml::from_str(yaml).map_err(|e| TemplateError::Schema(e.to_string()))?;
        if template.id.trim().is_empty() {
            return Err(TemplateError::Schema("template id is empty".to_string()));
        }
        Ok(template)
    }

    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    /// Comma-separated tags as a list.
    pub fn tags(&self) -> Vec<&str> {
        self.info
            .tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Validates and freezes the template: folds the legacy request
    /// list, canonicalizes payloads, compiles regexes and expressions,
    /// and resolves every variable reference.
    pub fn compile(&mut self) -> Result<(), TemplateError> {
        if self.compiled {
            return Err(CompileError::AlreadyCompiled.into());
        }

        if self.http.is_empty() && !self.requests.is_empty() {
            self.http = std::mem::take(&mut self.requests);
        }

        let mut known: BTreeSet<String> = executor::BUILTIN_NAMES
            .iter()
            .map(|n| n.to_string())
            .collect();

        for (name, value) in &self.variables {
            let name = yaml_key(name);
            check_variable_expression(&name, value, &known)?;
            known.insert(name);
        }

        self.total_requests = 0;
        for request in &mut self.http {
            let published = request.compile(&known)?;
            known.extend(published);
            self.total_requests += request.total_requests();
        }
        for request in &mut self.network {
            let published = request.compile(&known)?;
            known.extend(published);
            self.total_requests += 1;
        }

        self.compiled = true;
        Ok(())
    }

    /// Runs the compiled template against one target with a fresh scan
    /// context. `extra` values are bound before template variables.
    pub async fn execute(
        &self,
        target: &str,
        extra: Option<VariableMap>,
    ) -> Result<Vec<ResultEvent>, TemplateError> {
        let ctx = ScanContext::new(target, extra);
        self.execute_with_context(&ctx, target).await
    }

    /// Runs against a caller-owned context (custom client, proxy,
    /// hooks, cancellation).
    pub async fn execute_with_context(
        &self,
        ctx: &ScanContext,
        target: &str,
    ) -> Result<Vec<ResultEvent>, TemplateError> {
        executor::execute(self, ctx, target).await
    }
}

/// Template variable values must be evaluatable: either a complete
/// expression over already-declared names, a string with resolvable
/// placeholders, or a plain literal.
fn check_variable_expression(
    name: &str,
    value: &serde_yaml::Value,
    known: &BTreeSet<String>,
) -> Result<(), CompileError> {
    let Some(text) = value.as_str() else {
        // Numbers and booleans are literals.
        return Ok(());
    };

    if dsl::has_placeholders(text) {
        for ident in dsl::placeholder_identifiers(text) {
            if !known.iter().any(|k| k.eq_ignore_ascii_case(&ident)) {
                return Err(CompileError::UnresolvedVariable {
                    name: ident,
                    context: format!("variable '{}'", name),
                });
            }
        }
    }
    Ok(())
}

pub(crate) fn yaml_key(value: &serde_yaml::Value) -> String {
    value.as_str().map(str::to_string).unwrap_or_else(|| {
        serde_yaml::to_string(value)
            .unwrap_or_default()
            .trim()
            .to_string()
    })
}

/// Loads every `.yaml`/`.yml` under `dir`, recursively. Files that fail
/// to decode are skipped with a warning so one bad template cannot sink
/// the batch.
pub fn load_templates_from_dir(dir: &Path) -> Result<Vec<Template>> {
    let mut templates = Vec::new();
    if !dir.exists() {
        return Ok(templates);
    }
    load_recursive(dir, &mut templates)?;
    Ok(templates)
}

fn load_recursive(dir: &Path, templates: &mut Vec<Template>) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            load_recursive(&path, templates)?;
        } else if path
            .extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml")
        {
            match Template::from_file(&path) {
                Ok(template) => templates.push(template),
                Err(e) => tracing::warn!("skipping template {}: {}", path.display(), e),
            }
        }
    }
    Ok(())
}
