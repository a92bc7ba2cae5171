//! Extractors: named projections from a response into the variable map
//! or the user-visible result.

use std::collections::BTreeSet;

use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use super::{part_text, Part};
use crate::dsl::{self, Expr, Value, VariableMap};
use crate::error::CompileError;
use crate::scan::InternalEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorType {
    /// Capture group of every regex match
    Regex,
    /// Case-insensitive key lookup over headers, cookies and k=v lines
    Kval,
    /// Dotted-path queries over the body parsed as JSON
    Json,
    /// XPath subset evaluated over the body parsed as HTML
    Xpath,
    /// Stringified DSL expression result
    Dsl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extractor {
    #[serde(rename = "type")]
    pub extractor_type: ExtractorType,

    /// Named extractors publish into the execution variable map;
    /// unnamed ones only contribute to the user-visible result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub part: Part,

    /// Regex capture index
    #[serde(default)]
    pub group: usize,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regex: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kval: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub xpath: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dsl: Vec<String>,

    /// Extracted values stay engine-internal: usable by later requests,
    /// never emitted on a result event.
    #[serde(default)]
    pub internal: bool,

    #[serde(skip)]
    compiled: Compiled,
}

#[derive(Debug, Clone, Default)]
struct Compiled {
    regexes: Vec<Regex>,
    exprs: Vec<Expr>,
}

impl Extractor {
    /// Event fields (`body`, `header`, ...) are always in scope on top
    /// of the declared universe.
    pub fn compile(&mut self, known: &BTreeSet<String>) -> Result<(), CompileError> {
        let mut known = known.clone();
        known.extend(super::event_field_names());
        let known = &known;

        self.compiled.regexes.clear();
        for pattern in &self.regex {
            let compiled = Regex::new(pattern).map_err(|e| CompileError::InvalidRegex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            self.compiled.regexes.push(compiled);
        }

        self.compiled.exprs.clear();
        for expr in &self.dsl {
            self.compiled.exprs.push(dsl::compile_expression(expr, known)?);
        }

        Ok(())
    }

    /// Produces zero or more string values from the event. Runtime
    /// failures (unparseable JSON, bad selector) yield no values.
    pub fn extract(&self, event: &InternalEvent, vars: &VariableMap) -> Vec<String> {
        match self.extractor_type {
            ExtractorType::Regex => self.extract_regex(event),
            ExtractorType::Kval => self.extract_kval(event),
            ExtractorType::Json => self.extract_json(event),
            ExtractorType::Xpath => self.extract_xpath(event),
            ExtractorType::Dsl => self.extract_dsl(event, vars),
        }
    }

    fn extract_regex(&self, event: &InternalEvent) -> Vec<String> {
        let text = part_text(event, self.part);
        let mut out = Vec::new();
        for re in &self.compiled.regexes {
            for caps in re.captures_iter(&text) {
                if let Some(m) = caps.get(self.group) {
                    out.push(m.as_str().to_string());
                }
            }
        }
        out
    }

    fn extract_kval(&self, event: &InternalEvent) -> Vec<String> {
        let mut out = Vec::new();
        for key in &self.kval {
            let wanted = normalize_key(key);

            // Parsed header and cookie maps first.
            for space in ["header", "cookie"] {
                if let Some(Value::Map(map)) = event.get(space) {
                    for (name, value) in map {
                        if normalize_key(name) == wanted {
                            out.push(value.to_string());
                        }
                    }
                }
            }

            // k=v lines in the selected part (e.g. token=abc bodies).
            let text = part_text(event, self.part);
            for line in text.lines() {
                if let Some((name, value)) = line.split_once('=') {
                    if normalize_key(name.trim()) == wanted {
                        out.push(value.trim().to_string());
                    }
                }
            }
        }
        out
    }

    fn extract_json(&self, event: &InternalEvent) -> Vec<String> {
        let text = part_text(event, self.part);
        let Ok(root) = serde_json::from_str::<serde_json::Value>(&text) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for query in &self.json {
            for value in resolve_json_path(&root, query) {
                match value {
                    serde_json::Value::String(s) => out.push(s.clone()),
                    serde_json::Value::Null => {}
                    scalar @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_)) => {
                        out.push(scalar.to_string())
                    }
                    composite => {
                        if let Ok(s) = serde_json::to_string(composite) {
                            out.push(s);
                        }
                    }
                }
            }
        }
        out
    }

    fn extract_xpath(&self, event: &InternalEvent) -> Vec<String> {
        let text = part_text(event, self.part);
        let document = Html::parse_document(&text);
        let mut out = Vec::new();
        for query in &self.xpath {
            let Some(compiled) = XpathQuery::parse(query) else {
                tracing::debug!("unsupported xpath query '{}'", query);
                continue;
            };
            out.extend(compiled.select(&document));
        }
        out
    }

    fn extract_dsl(&self, event: &InternalEvent, vars: &VariableMap) -> Vec<String> {
        let mut scope = vars.clone();
        event.bind_into(&mut scope);
        let mut out = Vec::new();
        for expr in &self.compiled.exprs {
            match dsl::evaluate(expr, &scope) {
                Ok(Value::Null) => {}
                Ok(value) => out.push(value.to_string()),
                Err(e) => tracing::debug!("dsl extractor evaluation failed: {}", e),
            }
        }
        out
    }
}

/// kval lookup treats keys case-insensitively with `-` and `_` equivalent.
fn normalize_key(key: &str) -> String {
    key.to_lowercase().replace('-', "_")
}

/// Resolves a dotted path (`data.items[0].name`, `[*].id`) against a
/// JSON document.
fn resolve_json_path<'a>(root: &'a serde_json::Value, path: &str) -> Vec<&'a serde_json::Value> {
    let mut frontier = vec![root];
    let path = path.trim().trim_start_matches('$').trim_start_matches('.');

    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (name, brackets) = split_segment(segment);
        if !name.is_empty() {
            frontier = frontier
                .into_iter()
                .filter_map(|v| v.get(name))
                .collect();
        }
        for bracket in brackets {
            if bracket == "*" {
                frontier = frontier
                    .into_iter()
                    .flat_map(|v| v.as_array().map(|a| a.iter()).into_iter().flatten())
                    .collect();
            } else if let Ok(index) = bracket.parse::<usize>() {
                frontier = frontier.into_iter().filter_map(|v| v.get(index)).collect();
            } else {
                // Quoted key form: ["some key"]
                let key = bracket.trim_matches(|c| c == '"' || c == '\'');
                frontier = frontier.into_iter().filter_map(|v| v.get(key)).collect();
            }
        }
        if frontier.is_empty() {
            break;
        }
    }
    frontier
}

fn split_segment(segment: &str) -> (&str, Vec<&str>) {
    match segment.find('[') {
        None => (segment, Vec::new()),
        Some(start) => {
            let name = &segment[..start];
            let brackets = segment[start..]
                .split('[')
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.strip_suffix(']'))
                .collect();
            (name, brackets)
        }
    }
}

/// A practical XPath subset: descendant steps with optional attribute
/// predicates, terminated by `/@attr` or `/text()`.
///
/// `//a/@href`, `//meta[@name='generator']/@content`, `//div//span/text()`
struct XpathQuery {
    selector: Selector,
    target: XpathTarget,
}

enum XpathTarget {
    Text,
    Attr(String),
}

impl XpathQuery {
    fn parse(query: &str) -> Option<Self> {
        let query = query.trim();
        let rest = query.strip_prefix("//")?;

        let (rest, target) = if let Some(stripped) = rest.strip_suffix("/text()") {
            (stripped, XpathTarget::Text)
        } else if let Some(at) = rest.rfind("/@") {
            let attr = rest[at + 2..].to_string();
            if attr.is_empty() || !attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return None;
            }
            (&rest[..at], XpathTarget::Attr(attr))
        } else {
            (rest, XpathTarget::Text)
        };

        let mut css = String::new();
        for step in rest.split("//") {
            let step = step.trim_matches('/');
            if step.is_empty() {
                return None;
            }
            if !css.is_empty() {
                css.push(' ');
            }
            css.push_str(&step_to_css(step)?);
        }

        let selector = Selector::parse(&css).ok()?;
        Some(XpathQuery { selector, target })
    }

    fn select(&self, document: &Html) -> Vec<String> {
        document
            .select(&self.selector)
            .filter_map(|element| match &self.target {
                XpathTarget::Text => {
                    let text: String = element.text().collect::<String>().trim().to_string();
                    (!text.is_empty()).then_some(text)
                }
                XpathTarget::Attr(attr) => element.value().attr(attr).map(str::to_string),
            })
            .collect()
    }
}

/// Converts one XPath step (`tag`, `tag[@attr]`, `tag[@attr='v']`) to CSS.
fn step_to_css(step: &str) -> Option<String> {
    match step.find('[') {
        None => valid_tag(step).then(|| star_to_css(step)),
        Some(open) => {
            let tag = &step[..open];
            if !valid_tag(tag) {
                return None;
            }
            let predicate = step[open..].strip_prefix("[@")?.strip_suffix(']')?;
            match predicate.split_once('=') {
                None => Some(format!("{}[{}]", star_to_css(tag), predicate)),
                Some((attr, value)) => {
                    let value = value.trim_matches(|c| c == '"' || c == '\'');
                    Some(format!("{}[{}=\"{}\"]", star_to_css(tag), attr, value))
                }
            }
        }
    }
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && (tag == "*" || tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

fn star_to_css(tag: &str) -> String {
    if tag == "*" {
        "*".to_string()
    } else {
        tag.to_string()
    }
}
