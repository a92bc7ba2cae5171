//! Operators block: the matchers + extractors + condition bundle
//! attached to a request.

pub mod extractor;
pub mod matcher;

pub use extractor::{Extractor, ExtractorType};
pub use matcher::{Matcher, MatcherType};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::dsl::{Value, VariableMap};
use crate::error::CompileError;
use crate::scan::InternalEvent;

/// Aggregation over a list of needles or matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    And,
    #[default]
    Or,
}

impl Condition {
    pub fn aggregate(&self, outcomes: impl Iterator<Item = bool>) -> bool {
        match self {
            Condition::And => {
                let mut any = false;
                for outcome in outcomes {
                    if !outcome {
                        return false;
                    }
                    any = true;
                }
                any
            }
            Condition::Or => outcomes.into_iter().any(|o| o),
        }
    }
}

/// Response component a matcher or extractor reads.
///
/// HTTP events expose `body`, `header`, `all` and `raw`; network events
/// expose `data` and `raw` (with `body` aliased to the collected data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Part {
    #[default]
    Body,
    Header,
    All,
    Raw,
    Data,
}

/// Resolves the selected part to text against an event.
pub(crate) fn part_text(event: &InternalEvent, part: Part) -> String {
    let field = |key: &str| {
        event
            .get(key)
            .map(|v| v.to_string())
            .unwrap_or_default()
    };
    match part {
        Part::Body => field("body"),
        Part::Header => field("all_headers"),
        Part::Data => field("data"),
        Part::Raw => {
            let raw = field("response");
            if raw.is_empty() {
                field("data")
            } else {
                raw
            }
        }
        Part::All => format!("{}\n\n{}", field("all_headers"), field("body")),
    }
}

/// Byte view of the selected part, preferring the raw byte record where
/// one exists (binary matchers must see unmangled bytes).
pub(crate) fn part_bytes(event: &InternalEvent, part: Part) -> Vec<u8> {
    if matches!(part, Part::Raw | Part::Data | Part::Body) {
        if let Some(Value::Bytes(raw)) = event.get("raw") {
            if matches!(part, Part::Raw) {
                return raw.clone();
            }
        }
    }
    if matches!(part, Part::Body | Part::Data) {
        if let Some(Value::Bytes(bytes)) = event.get(match part {
            Part::Body => "body",
            _ => "data",
        }) {
            return bytes.clone();
        }
    }
    part_text(event, part).into_bytes()
}

/// Event field names DSL expressions may reference in addition to the
/// declared template universe.
pub(crate) fn event_field_names() -> BTreeSet<String> {
    [
        "body",
        "all_headers",
        "header",
        "raw",
        "response",
        "request",
        "data",
        "status_code",
        "content_length",
        "duration",
        "host",
        "matched_at",
        "error",
        "warning",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Outcome of running an operators block over one event.
#[derive(Debug, Clone, Default)]
pub struct OperatorResult {
    /// Matchers-condition aggregation over the matcher outcomes
    pub matched: bool,
    /// Names of the matchers that fired
    pub matcher_names: Vec<String>,
    /// Named extractor outputs visible in result events
    pub extracts: BTreeMap<String, Vec<String>>,
    /// Named extractor outputs flagged `internal: true`; these flow into
    /// later requests but never into a result event
    pub internal: BTreeMap<String, Vec<String>>,
    /// Output of extractors without a name; result-visible only
    pub anonymous: Vec<String>,
}

impl OperatorResult {
    /// All named values, internal included, for binding into the
    /// execution scope.
    pub fn named_values(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.extracts.iter().chain(self.internal.iter())
    }
}

/// Matchers, extractors and the matchers-condition of one request block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Operators {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<Matcher>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extractors: Vec<Extractor>,

    #[serde(rename = "matchers-condition", default)]
    pub matchers_condition: Condition,
}

impl Operators {
    /// Compiles children and validates their DSL references against the
    /// declared variable universe.
    pub fn compile(&mut self, known: &BTreeSet<String>) -> Result<(), CompileError> {
        for matcher in &mut self.matchers {
            matcher.compile(known)?;
        }
        for extractor in &mut self.extractors {
            extractor.compile(known)?;
        }
        Ok(())
    }

    /// Extractor names this block publishes into the variable map.
    pub fn extractor_names(&self) -> impl Iterator<Item = &str> {
        self.extractors
            .iter()
            .filter_map(|e| e.name.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty() && self.extractors.is_empty()
    }

    /// Runs matchers under the block condition, then extractors when the
    /// event matched (or unconditionally when the block has no matchers).
    pub fn execute(&self, event: &InternalEvent, vars: &VariableMap) -> OperatorResult {
        let mut result = OperatorResult::default();

        if !self.matchers.is_empty() {
            let outcomes: Vec<(Option<&str>, bool)> = self
                .matchers
                .iter()
                .map(|m| (m.name.as_deref(), m.matches(event, vars)))
                .collect();

            result.matched = self
                .matchers_condition
                .aggregate(outcomes.iter().map(|(_, m)| *m));

            result.matcher_names = outcomes
                .iter()
                .filter(|(_, m)| *m)
                .filter_map(|(n, _)| n.map(str::to_string))
                .collect();
        }

        if result.matched || self.matchers.is_empty() {
            for extractor in &self.extractors {
                let values = extractor.extract(event, vars);
                if values.is_empty() {
                    continue;
                }
                match (&extractor.name, extractor.internal) {
                    (Some(name), true) => {
                        result.internal.entry(name.clone()).or_default().extend(values)
                    }
                    (Some(name), false) => {
                        result.extracts.entry(name.clone()).or_default().extend(values)
                    }
                    (None, _) => result.anonymous.extend(values),
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(body: &str, status: i64) -> InternalEvent {
        let mut event = InternalEvent::new();
        event.set("body", Value::from(body));
        event.set("status_code", Value::Int(status));
        event.set("all_headers", Value::from("Server: test"));
        event
    }

    fn word_matcher(word: &str) -> Matcher {
        serde_yaml::from_str(&format!("type: word\nwords: [\"{}\"]", word)).unwrap()
    }

    #[test]
    fn condition_aggregation() {
        assert!(Condition::And.aggregate([true, true].into_iter()));
        assert!(!Condition::And.aggregate([true, false].into_iter()));
        // An empty AND has nothing to assert and must not match.
        assert!(!Condition::And.aggregate(std::iter::empty()));
        assert!(Condition::Or.aggregate([false, true].into_iter()));
        assert!(!Condition::Or.aggregate(std::iter::empty()));
    }

    #[test]
    fn matchers_condition_and_requires_all() {
        let mut ops = Operators {
            matchers: vec![word_matcher("alpha"), word_matcher("beta")],
            extractors: Vec::new(),
            matchers_condition: Condition::And,
        };
        ops.compile(&BTreeSet::new()).unwrap();

        let vars = VariableMap::new();
        assert!(ops.execute(&event("alpha beta", 200), &vars).matched);
        assert!(!ops.execute(&event("alpha only", 200), &vars).matched);

        ops.matchers_condition = Condition::Or;
        assert!(ops.execute(&event("alpha only", 200), &vars).matched);
    }

    #[test]
    fn internal_extracts_stay_out_of_visible_set() {
        let yaml = r#"
matchers:
  - type: word
    words: ["token"]
extractors:
  - type: regex
    name: session
    internal: true
    regex: ['token=(\w+)']
    group: 1
"#;
        let mut ops: Operators = serde_yaml::from_str(yaml).unwrap();
        ops.compile(&BTreeSet::new()).unwrap();

        let result = ops.execute(&event("token=abc123", 200), &VariableMap::new());
        assert!(result.matched);
        assert!(result.extracts.is_empty());
        assert_eq!(result.internal["session"], vec!["abc123".to_string()]);
        // Named values still flow into the scope for later requests.
        let names: Vec<&String> = result.named_values().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["session"]);
    }

    #[test]
    fn extractors_without_matchers_run_unconditionally() {
        let yaml = r#"
extractors:
  - type: regex
    name: version
    regex: ['Apache/([\d.]+)']
    group: 1
"#;
        let mut ops: Operators = serde_yaml::from_str(yaml).unwrap();
        ops.compile(&BTreeSet::new()).unwrap();

        let result = ops.execute(&event("Server: Apache/2.4.41", 200), &VariableMap::new());
        // No matchers: the block does not claim a match, extraction still runs.
        assert!(!result.matched);
        assert_eq!(result.extracts["version"], vec!["2.4.41".to_string()]);
    }

    #[test]
    fn part_resolution() {
        let ev = event("the body", 200);
        assert_eq!(part_text(&ev, Part::Body), "the body");
        assert_eq!(part_text(&ev, Part::Header), "Server: test");
        assert!(part_text(&ev, Part::All).contains("the body"));
        assert!(part_text(&ev, Part::All).contains("Server: test"));
    }
}
