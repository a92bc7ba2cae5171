//! Expression language used by `dsl` matchers/extractors, template
//! variables and `{{...}}` placeholder expansion.

mod eval;
pub mod functions;
mod lexer;
mod parser;
mod value;

pub use eval::{evaluate, evaluate_str};
pub use parser::Expr;
pub use value::{Value, VariableMap};

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{CompileError, ExpansionError};

/// Regex matching `{{expression}}` placeholders, non-greedy.
fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(.+?)\}\}").expect("invalid placeholder regex"))
}

/// Parses an expression and checks it against the declared variable
/// universe; unresolved identifiers and unknown functions are compile
/// errors per the template contract.
pub fn compile_expression(input: &str, known: &BTreeSet<String>) -> Result<Expr, CompileError> {
    let expr = Expr::parse(input).map_err(|source| CompileError::Expression {
        expr: input.to_string(),
        source,
    })?;

    for call in expr.function_calls() {
        if !functions::is_builtin(&call) {
            return Err(CompileError::Expression {
                expr: input.to_string(),
                source: crate::error::EvalError::UnknownFunction(call),
            });
        }
    }

    for ident in expr.identifiers() {
        let resolved = known.iter().any(|k| k.eq_ignore_ascii_case(&ident));
        if !resolved {
            return Err(CompileError::UnresolvedVariable {
                name: ident,
                context: format!("expression '{}'", input),
            });
        }
    }

    Ok(expr)
}

/// Returns true when `input` carries at least one `{{...}}` marker.
pub fn has_placeholders(input: &str) -> bool {
    placeholder_regex().is_match(input)
}

/// Expands every `{{expression}}` in `input` against the current scope.
///
/// A placeholder that fails to parse or evaluate aborts the expansion;
/// runners treat that as an expansion error for the current payload tuple.
pub fn expand(input: &str, vars: &VariableMap) -> Result<String, ExpansionError> {
    let mut failure: Option<ExpansionError> = None;

    let expanded = placeholder_regex().replace_all(input, |caps: &regex::Captures| {
        let inner = caps[1].trim();
        match evaluate_str(inner, vars) {
            Ok(value) => value.to_string(),
            Err(source) => {
                if failure.is_none() {
                    failure = Some(ExpansionError {
                        placeholder: inner.to_string(),
                        source,
                    });
                }
                caps[0].to_string()
            }
        }
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(expanded.into_owned()),
    }
}

/// Identifier names every placeholder of `input` references, for
/// compile-time resolution checks of paths, bodies and headers.
pub fn placeholder_identifiers(input: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for caps in placeholder_regex().captures_iter(input) {
        if let Ok(expr) = Expr::parse(caps[1].trim()) {
            out.extend(expr.identifiers());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> VariableMap {
        let mut vars = VariableMap::new();
        vars.set("BaseURL", Value::from("http://example.com"));
        vars.set("token", Value::from("abc123"));
        vars
    }

    #[test]
    fn expands_simple_placeholders() {
        let out = expand("{{BaseURL}}/login?t={{token}}", &vars()).unwrap();
        assert_eq!(out, "http://example.com/login?t=abc123");
    }

    #[test]
    fn expands_expressions_inside_placeholders() {
        let out = expand("x={{to_upper(token)}}", &vars()).unwrap();
        assert_eq!(out, "x=ABC123");
        let out = expand("{{base64(token)}}", &vars()).unwrap();
        assert_eq!(out, "YWJjMTIz");
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let err = expand("{{missing}}", &vars()).unwrap_err();
        assert_eq!(err.placeholder, "missing");
    }

    #[test]
    fn no_placeholders_passes_through() {
        assert_eq!(expand("/plain/path", &vars()).unwrap(), "/plain/path");
        assert!(!has_placeholders("/plain/path"));
        assert!(has_placeholders("{{BaseURL}}"));
    }

    #[test]
    fn compile_expression_rejects_unknown_names() {
        let known: std::collections::BTreeSet<String> =
            ["body".to_string(), "status_code".to_string()].into();

        assert!(compile_expression("len(body) > 10", &known).is_ok());

        let err = compile_expression("len(stuff) > 10", &known).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnresolvedVariable { ref name, .. } if name == "stuff"
        ));

        let err = compile_expression("frobnicate(body)", &known).unwrap_err();
        assert!(matches!(err, CompileError::Expression { .. }));
    }

    #[test]
    fn placeholder_identifier_collection() {
        let idents = placeholder_identifiers("{{BaseURL}}/a/{{to_lower(name)}}");
        assert!(idents.contains("BaseURL"));
        assert!(idents.contains("name"));
    }
}
