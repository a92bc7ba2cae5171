//! HTTP request blocks: the serde model and its compiled form.
//!
//! Execution lives in [`runner`]; client construction in [`client`];
//! raw request parsing for the unsafe path in [`raw`].

pub mod client;
pub mod raw;
mod runner;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::dsl;
use crate::error::CompileError;
use crate::operators::Operators;
use crate::template::payloads::{AttackStrategy, PayloadGenerator};

/// One HTTP interaction of a template: either a list of path suffixes
/// with an implicit method, or a list of raw request templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Path suffixes resolved against the target; absolute URLs pass
    /// through untouched
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,

    /// Raw request templates (request line, headers, body)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Payload name to list of alternatives, in declaration order
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub payloads: serde_yaml::Mapping,

    #[serde(default)]
    pub attack: AttackStrategy,

    /// Advisory parallelism for payload iteration; dispatch stays
    /// sequential until extraction-dependency analysis lands
    #[serde(default, skip_serializing_if = "is_zero")]
    pub threads: usize,

    #[serde(rename = "iterate-all", default)]
    pub iterate_all: bool,

    #[serde(rename = "stop-at-first-match", default)]
    pub stop_at_first_match: bool,

    /// Dispatch `race_count` identical copies concurrently and evaluate
    /// every response
    #[serde(default)]
    pub race: bool,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub race_count: usize,

    #[serde(rename = "cookie-reuse", default)]
    pub cookie_reuse: bool,

    #[serde(default)]
    pub redirects: bool,

    #[serde(rename = "max-redirects", default)]
    pub max_redirects: usize,

    /// Send the raw form literally: no header normalization, no
    /// automatic Host or Content-Length
    #[serde(rename = "unsafe", default)]
    pub unsafe_raw: bool,

    #[serde(flatten)]
    pub operators: Operators,

    #[serde(skip)]
    pub(crate) generator: PayloadGenerator,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl HttpRequest {
    /// Compiles payload lists, operators and placeholder references.
    ///
    /// `known` is the variable universe visible to this request; the
    /// returned set is the names this request publishes for later ones.
    pub fn compile(&mut self, known: &BTreeSet<String>) -> Result<BTreeSet<String>, CompileError> {
        if self.path.is_empty() && self.raw.is_empty() {
            return Err(CompileError::EmptyRequest);
        }

        self.generator = PayloadGenerator::new(&self.payloads, self.attack, self.iterate_all)?;

        let mut scope: BTreeSet<String> = known.clone();
        scope.extend(self.generator.names().iter().cloned());

        self.check_placeholders(&scope)?;
        self.operators.compile(&scope)?;

        Ok(self.operators.extractor_names().map(str::to_string).collect())
    }

    /// Placeholders in paths, raw templates, body and headers must
    /// reference declared names; runtime expansion can still fail when a
    /// prior extractor produced nothing.
    fn check_placeholders(&self, known: &BTreeSet<String>) -> Result<(), CompileError> {
        let mut templated: Vec<&str> = Vec::new();
        templated.extend(self.path.iter().map(String::as_str));
        templated.extend(self.raw.iter().map(String::as_str));
        if let Some(body) = &self.body {
            templated.push(body);
        }
        for (name, value) in &self.headers {
            templated.push(name);
            templated.push(value);
        }

        for text in templated {
            for ident in dsl::placeholder_identifiers(text) {
                let resolved = known.iter().any(|k| k.eq_ignore_ascii_case(&ident));
                if !resolved {
                    return Err(CompileError::UnresolvedVariable {
                        name: ident,
                        context: format!("placeholder in '{}'", text.trim()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Size of the payload iteration sequence (1 with no payloads).
    pub fn total_requests(&self) -> usize {
        self.generator.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtins() -> BTreeSet<String> {
        ["BaseURL", "Hostname", "Host", "Port", "Scheme", "Path", "RootURL"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn compiles_minimal_request() {
        let yaml = r#"
method: GET
path:
  - "{{BaseURL}}/"
matchers:
  - type: status
    status: [200]
"#;
        let mut req: HttpRequest = serde_yaml::from_str(yaml).unwrap();
        let published = req.compile(&builtins()).unwrap();
        assert!(published.is_empty());
        assert_eq!(req.total_requests(), 1);
    }

    #[test]
    fn payload_names_resolve_in_placeholders() {
        let yaml = r#"
path:
  - "{{BaseURL}}/{{dir}}"
payloads:
  dir: [admin, backup]
matchers:
  - type: status
    status: [200]
"#;
        let mut req: HttpRequest = serde_yaml::from_str(yaml).unwrap();
        req.compile(&builtins()).unwrap();
        assert_eq!(req.total_requests(), 2);
    }

    #[test]
    fn unresolved_placeholder_fails_compile() {
        let yaml = r#"
path:
  - "{{BaseURL}}/{{whoops}}"
matchers:
  - type: status
    status: [200]
"#;
        let mut req: HttpRequest = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            req.compile(&builtins()),
            Err(CompileError::UnresolvedVariable { name, .. }) if name == "whoops"
        ));
    }

    #[test]
    fn request_without_paths_or_raw_fails_compile() {
        let mut req: HttpRequest = serde_yaml::from_str("method: GET").unwrap();
        assert!(matches!(
            req.compile(&builtins()),
            Err(CompileError::EmptyRequest)
        ));
    }

    #[test]
    fn published_extractor_names_are_returned() {
        let yaml = r#"
path:
  - "{{BaseURL}}/"
extractors:
  - type: regex
    name: token
    regex: ['token=(\w+)']
    group: 1
"#;
        let mut req: HttpRequest = serde_yaml::from_str(yaml).unwrap();
        let published = req.compile(&builtins()).unwrap();
        assert!(published.contains("token"));
    }
}
