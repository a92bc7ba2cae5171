//! Per-request event records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dsl::Value;
use crate::template::Severity;

/// Free-form per-request record populated by a runner: raw request and
/// response, status, headers, body, duration, host, extracted values and
/// any `error`/`warning` keys.
#[derive(Debug, Clone, Default)]
pub struct InternalEvent {
    data: BTreeMap<String, Value>,
}

impl InternalEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_int())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// Copies every entry into an evaluation scope so DSL matchers can
    /// reference response fields by name.
    pub fn bind_into(&self, vars: &mut crate::dsl::VariableMap) {
        for (key, value) in &self.data {
            vars.set(key.clone(), value.clone());
        }
    }
}

/// User-visible outcome of a matched request.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEvent {
    /// Stable template id
    pub template_id: String,
    /// Template display name
    pub template_name: String,
    pub severity: Severity,
    /// Name of the matcher that fired, when it carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matcher_name: Option<String>,
    pub host: String,
    /// Full URL (or host:port endpoint) the match occurred at
    pub matched_at: String,
    /// Named extractor outputs, `internal: true` values excluded
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extracted_results: BTreeMap<String, Vec<String>>,
    /// Free-form metadata copied from the template info block
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_yaml::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Template metadata runners need to mint result events, plus the
/// visible extracted values accumulated over the execution so far.
#[derive(Debug)]
pub struct ResultContext {
    pub template_id: String,
    pub template_name: String,
    pub severity: Severity,
    pub metadata: BTreeMap<String, serde_yaml::Value>,
    pub host: String,
    accumulated: parking_lot::Mutex<BTreeMap<String, Vec<String>>>,
}

impl ResultContext {
    pub fn new(
        template_id: String,
        template_name: String,
        severity: Severity,
        metadata: BTreeMap<String, serde_yaml::Value>,
        host: String,
    ) -> Self {
        Self {
            template_id,
            template_name,
            severity,
            metadata,
            host,
            accumulated: parking_lot::Mutex::new(BTreeMap::new()),
        }
    }

    /// Folds a request's visible named extracts into the running set so
    /// they appear on every later result event of this execution.
    /// Internal extracts must never pass through here.
    pub fn absorb(&self, extracts: &BTreeMap<String, Vec<String>>) {
        if extracts.is_empty() {
            return;
        }
        let mut accumulated = self.accumulated.lock();
        for (name, values) in extracts {
            let entry = accumulated.entry(name.clone()).or_default();
            for value in values {
                if !entry.contains(value) {
                    entry.push(value.clone());
                }
            }
        }
    }

    /// Mints a result carrying the accumulated extractions plus any
    /// values specific to this event.
    pub fn result(
        &self,
        matched_at: impl Into<String>,
        matcher_name: Option<String>,
        event_extracts: BTreeMap<String, Vec<String>>,
    ) -> ResultEvent {
        let mut extracted_results = self.accumulated.lock().clone();
        for (name, values) in event_extracts {
            let entry = extracted_results.entry(name).or_default();
            for value in values {
                if !entry.contains(&value) {
                    entry.push(value);
                }
            }
        }

        ResultEvent {
            template_id: self.template_id.clone(),
            template_name: self.template_name.clone(),
            severity: self.severity,
            matcher_name,
            host: self.host.clone(),
            matched_at: matched_at.into(),
            extracted_results,
            metadata: self.metadata.clone(),
            timestamp: Utc::now(),
        }
    }
}

impl ResultEvent {
    /// One-line human-readable rendering used by the driver.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "[{}] [{}] {}",
            self.template_id,
            self.severity.as_str(),
            self.matched_at
        );
        if let Some(name) = &self.matcher_name {
            out.push_str(&format!(" (matcher: {})", name));
        }
        if !self.extracted_results.is_empty() {
            let parts: Vec<String> = self
                .extracted_results
                .iter()
                .map(|(k, v)| format!("{}={}", k, v.join(",")))
                .collect();
            out.push_str(&format!(" [{}]", parts.join(" ")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bindings_flow_into_scope() {
        let mut event = InternalEvent::new();
        event.set("status_code", Value::Int(200));
        event.set("body", Value::from("hello"));

        let mut vars = crate::dsl::VariableMap::new();
        event.bind_into(&mut vars);

        assert_eq!(vars.get("status_code"), Some(&Value::Int(200)));
        assert_eq!(vars.get("body"), Some(&Value::from("hello")));
    }

    #[test]
    fn result_summary_includes_extractions() {
        let mut extracted = BTreeMap::new();
        extracted.insert("version".to_string(), vec!["2.4".to_string()]);

        let event = ResultEvent {
            template_id: "apache-detect".into(),
            template_name: "Apache".into(),
            severity: Severity::Info,
            matcher_name: Some("word".into()),
            host: "example.com".into(),
            matched_at: "http://example.com/".into(),
            extracted_results: extracted,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        };

        let line = event.summary();
        assert!(line.contains("apache-detect"));
        assert!(line.contains("version=2.4"));
    }
}
