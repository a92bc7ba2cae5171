//! Matcher execution against response events.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{part_bytes, part_text, Condition, Part};
use crate::dsl::{self, Expr, VariableMap};
use crate::error::CompileError;
use crate::scan::InternalEvent;

/// Predicate kind over a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherType {
    /// Response status is one of the listed integers
    Status,
    /// A needle string appears in the selected part
    Word,
    /// A compiled pattern finds a match in the selected part
    Regex,
    /// A hex-decoded byte sequence occurs in the selected part
    Binary,
    /// A DSL expression evaluates truthy in the current scope
    Dsl,
    /// The byte length of the selected part equals a listed integer
    Size,
}

/// A single predicate over a response. A request aggregates its matchers
/// under the block's `matchers-condition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matcher {
    #[serde(rename = "type")]
    pub matcher_type: MatcherType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub part: Part,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<u16>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub size: Vec<usize>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regex: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binary: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dsl: Vec<String>,

    /// Aggregation across this matcher's own needle list
    #[serde(default)]
    pub condition: Condition,

    /// Inverts the outcome
    #[serde(default)]
    pub negative: bool,

    #[serde(rename = "case-insensitive", default)]
    pub case_insensitive: bool,

    #[serde(skip)]
    compiled: Compiled,
}

#[derive(Debug, Clone, Default)]
struct Compiled {
    regexes: Vec<Regex>,
    binary: Vec<Vec<u8>>,
    exprs: Vec<Expr>,
}

impl Matcher {
    /// Compiles regexes, hex literals and DSL expressions once.
    ///
    /// `known` is the declared variable universe; response event fields
    /// (`body`, `status_code`, ...) are always in scope on top of it.
    pub fn compile(&mut self, known: &BTreeSet<String>) -> Result<(), CompileError> {
        let mut known = known.clone();
        known.extend(super::event_field_names());
        let known = &known;

        self.compiled.regexes.clear();
        for pattern in &self.regex {
            let effective = if self.case_insensitive && !pattern.contains("(?i)") {
                format!("(?i){}", pattern)
            } else {
                pattern.clone()
            };
            let compiled = Regex::new(&effective).map_err(|e| CompileError::InvalidRegex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            self.compiled.regexes.push(compiled);
        }

        self.compiled.binary.clear();
        for hex in &self.binary {
            let bytes = dsl::functions::hex_decode(hex)
                .ok_or_else(|| CompileError::InvalidHex(hex.clone()))?;
            self.compiled.binary.push(bytes);
        }

        self.compiled.exprs.clear();
        for expr in &self.dsl {
            self.compiled.exprs.push(dsl::compile_expression(expr, known)?);
        }

        // Needle words may carry {{payload}} placeholders resolved per
        // dispatch; the names must still be declared.
        for word in &self.words {
            for ident in dsl::placeholder_identifiers(word) {
                if !known.iter().any(|k| k.eq_ignore_ascii_case(&ident)) {
                    return Err(CompileError::UnresolvedVariable {
                        name: ident,
                        context: format!("word matcher needle '{}'", word),
                    });
                }
            }
        }

        Ok(())
    }

    /// Evaluates this matcher against one event. DSL evaluation errors
    /// are a non-match, never a failure.
    pub fn matches(&self, event: &InternalEvent, vars: &VariableMap) -> bool {
        let outcome = match self.matcher_type {
            MatcherType::Status => self.match_status(event),
            MatcherType::Size => self.match_size(event),
            MatcherType::Word => self.match_words(event, vars),
            MatcherType::Regex => self.match_regex(event),
            MatcherType::Binary => self.match_binary(event),
            MatcherType::Dsl => self.match_dsl(event, vars),
        };
        outcome != self.negative
    }

    fn match_status(&self, event: &InternalEvent) -> bool {
        let Some(status) = event.get_int("status_code") else {
            return false;
        };
        self.status.iter().any(|s| i64::from(*s) == status)
    }

    fn match_size(&self, event: &InternalEvent) -> bool {
        let len = part_bytes(event, self.part).len();
        self.size.iter().any(|s| *s == len)
    }

    fn match_words(&self, event: &InternalEvent, vars: &VariableMap) -> bool {
        if self.words.is_empty() {
            return false;
        }
        let text = part_text(event, self.part);
        let haystack = if self.case_insensitive {
            text.to_lowercase()
        } else {
            text
        };
        self.condition.aggregate(self.words.iter().map(|word| {
            // Payload-bearing needles resolve against the dispatch scope.
            let needle = match dsl::expand(word, vars) {
                Ok(expanded) => expanded,
                Err(_) => word.clone(),
            };
            if self.case_insensitive {
                haystack.contains(&needle.to_lowercase())
            } else {
                haystack.contains(&needle)
            }
        }))
    }

    fn match_regex(&self, event: &InternalEvent) -> bool {
        if self.compiled.regexes.is_empty() {
            return false;
        }
        let text = part_text(event, self.part);
        self.condition
            .aggregate(self.compiled.regexes.iter().map(|re| re.is_match(&text)))
    }

    fn match_binary(&self, event: &InternalEvent) -> bool {
        if self.compiled.binary.is_empty() {
            return false;
        }
        let haystack = part_bytes(event, self.part);
        self.condition.aggregate(
            self.compiled
                .binary
                .iter()
                .map(|needle| contains_subsequence(&haystack, needle)),
        )
    }

    fn match_dsl(&self, event: &InternalEvent, vars: &VariableMap) -> bool {
        if self.compiled.exprs.is_empty() {
            return false;
        }
        let mut scope = vars.clone();
        event.bind_into(&mut scope);
        self.condition
            .aggregate(self.compiled.exprs.iter().map(|expr| {
                match dsl::evaluate(expr, &scope) {
                    Ok(value) => value.truthy(),
                    Err(e) => {
                        tracing::debug!("dsl matcher evaluation failed: {}", e);
                        false
                    }
                }
            }))
    }
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::Value;

    fn compiled(yaml: &str) -> Matcher {
        let mut matcher: Matcher = serde_yaml::from_str(yaml).unwrap();
        matcher.compile(&BTreeSet::new()).unwrap();
        matcher
    }

    fn event(body: &str, status: i64) -> InternalEvent {
        let mut event = InternalEvent::new();
        event.set("body", Value::from(body));
        event.set("status_code", Value::Int(status));
        event.set("all_headers", Value::from("Server: Apache/2.4\nX-Test: 1"));
        event
    }

    #[test]
    fn status_matcher() {
        let m = compiled("type: status\nstatus: [200, 302]");
        assert!(m.matches(&event("", 200), &VariableMap::new()));
        assert!(m.matches(&event("", 302), &VariableMap::new()));
        assert!(!m.matches(&event("", 404), &VariableMap::new()));
    }

    #[test]
    fn word_matcher_conditions() {
        let m = compiled("type: word\nwords: [alpha, beta]\ncondition: and");
        assert!(m.matches(&event("alpha and beta", 200), &VariableMap::new()));
        assert!(!m.matches(&event("alpha only", 200), &VariableMap::new()));

        let m = compiled("type: word\nwords: [alpha, beta]");
        assert!(m.matches(&event("alpha only", 200), &VariableMap::new()));
    }

    #[test]
    fn word_matcher_case_insensitive() {
        let m = compiled("type: word\nwords: [Apache]\ncase-insensitive: true");
        assert!(m.matches(&event("server: APACHE", 200), &VariableMap::new()));

        let m = compiled("type: word\nwords: [Apache]");
        assert!(!m.matches(&event("server: APACHE", 200), &VariableMap::new()));
    }

    #[test]
    fn word_matcher_part_header() {
        let m = compiled("type: word\npart: header\nwords: [Apache]");
        assert!(m.matches(&event("no match in body", 200), &VariableMap::new()));
    }

    #[test]
    fn empty_word_list_never_matches() {
        let m = compiled("type: word");
        assert!(!m.matches(&event("anything", 200), &VariableMap::new()));
    }

    #[test]
    fn regex_matcher_compiles_once_and_matches() {
        let m = compiled(r#"type: regex
regex: ['Apache/[\d.]+']"#);
        assert!(m.matches(&event("Apache/2.4.41 ready", 200), &VariableMap::new()));
        assert!(!m.matches(&event("nginx/1.25", 200), &VariableMap::new()));
    }

    #[test]
    fn invalid_regex_is_a_compile_error() {
        let mut m: Matcher = serde_yaml::from_str("type: regex\nregex: ['(']").unwrap();
        assert!(matches!(
            m.compile(&BTreeSet::new()),
            Err(CompileError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn binary_matcher_decodes_hex_at_compile_time() {
        // 504b0304 is the ZIP local file header.
        let m = compiled("type: binary\nbinary: ['504b0304']");
        let mut ev = InternalEvent::new();
        ev.set("body", Value::Bytes(vec![0x50, 0x4b, 0x03, 0x04, 0x00]));
        assert!(m.matches(&ev, &VariableMap::new()));

        let mut miss = InternalEvent::new();
        miss.set("body", Value::Bytes(vec![0x1f, 0x8b]));
        assert!(!m.matches(&miss, &VariableMap::new()));
    }

    #[test]
    fn invalid_hex_is_a_compile_error() {
        let mut m: Matcher = serde_yaml::from_str("type: binary\nbinary: ['zz']").unwrap();
        assert!(matches!(
            m.compile(&BTreeSet::new()),
            Err(CompileError::InvalidHex(_))
        ));
    }

    #[test]
    fn size_matcher() {
        let m = compiled("type: size\nsize: [5]");
        assert!(m.matches(&event("12345", 200), &VariableMap::new()));
        assert!(!m.matches(&event("1234", 200), &VariableMap::new()));
    }

    #[test]
    fn dsl_matcher_truthiness_and_errors() {
        let m = compiled("type: dsl\ndsl: ['len(body) > 100 && contains(body, \"error\")']");
        let small = event("short error text", 200);
        // 50-byte body: the length conjunct fails, no error surfaces.
        assert!(!m.matches(&small, &VariableMap::new()));

        let big_body = format!("{} error", "x".repeat(120));
        assert!(m.matches(&event(&big_body, 200), &VariableMap::new()));
    }

    #[test]
    fn dsl_matcher_sees_status_code() {
        let m = compiled("type: dsl\ndsl: ['status_code == 200']");
        assert!(m.matches(&event("", 200), &VariableMap::new()));
        assert!(!m.matches(&event("", 500), &VariableMap::new()));
    }

    #[test]
    fn word_needles_expand_payload_placeholders() {
        let known: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        let mut m: Matcher =
            serde_yaml::from_str("type: word\nwords: ['{{a}}{{b}}']").unwrap();
        m.compile(&known).unwrap();

        let mut vars = VariableMap::new();
        vars.set("a", Value::from("x"));
        vars.set("b", Value::from("1"));

        assert!(m.matches(&event("echo: x1", 200), &vars));
        assert!(!m.matches(&event("echo: x2", 200), &vars));
    }

    #[test]
    fn word_needle_with_unknown_placeholder_fails_compile() {
        let mut m: Matcher =
            serde_yaml::from_str("type: word\nwords: ['{{mystery}}']").unwrap();
        assert!(matches!(
            m.compile(&BTreeSet::new()),
            Err(CompileError::UnresolvedVariable { .. })
        ));
    }

    #[test]
    fn negative_inverts() {
        let m = compiled("type: word\nwords: [missing]\nnegative: true");
        assert!(m.matches(&event("nothing here", 200), &VariableMap::new()));
        assert!(!m.matches(&event("missing is present", 200), &VariableMap::new()));
    }
}
