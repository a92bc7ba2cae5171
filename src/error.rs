//! Error types for template loading, compilation and execution.
//!
//! Only schema and compile errors (and panics) propagate out of an
//! execution; transport, expansion and evaluation failures are recorded
//! on the scan context and never fail the call.

use thiserror::Error;

/// Top-level error for template operations
#[derive(Error, Debug)]
pub enum TemplateError {
    /// YAML decode failure or an unknown enum value
    #[error("schema error: {0}")]
    Schema(String),

    /// Compile-time validation failure
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    /// The target URL could not be parsed
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    /// I/O failure while loading a template file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while turning a parsed template into an executable form
#[derive(Error, Debug)]
pub enum CompileError {
    /// A matcher, extractor or variable references an undeclared name
    #[error("unresolved variable reference '{name}' in {context}")]
    UnresolvedVariable { name: String, context: String },

    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("invalid hex literal '{0}'")]
    InvalidHex(String),

    /// Pitchfork requires all payload lists to have the same length
    #[error("pitchfork payload '{name}' has {len} values, expected {expected}")]
    PayloadLengthMismatch {
        name: String,
        len: usize,
        expected: usize,
    },

    #[error("payload '{0}' has no values")]
    EmptyPayload(String),

    #[error("request declares neither paths nor raw requests")]
    EmptyRequest,

    #[error("network request declares no hosts")]
    NoHosts,

    /// A DSL expression failed to parse or referenced unknown functions
    #[error("invalid expression '{expr}': {source}")]
    Expression { expr: String, source: EvalError },

    /// Template has already been compiled
    #[error("template is already compiled")]
    AlreadyCompiled,
}

/// Runtime failure inside the expression evaluator.
///
/// At compile time these surface as [`CompileError::Expression`]; at
/// runtime a failing matcher expression is a non-match and a failing
/// extractor expression yields no values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}: expected {expected} argument(s), got {got}")]
    Arity {
        function: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid regex '{0}'")]
    Regex(String),
}

/// A `{{placeholder}}` that cannot be resolved at dispatch time.
///
/// Aborts the current payload tuple and is reported as a warning.
#[derive(Error, Debug)]
#[error("cannot expand '{{{{{placeholder}}}}}': {source}")]
pub struct ExpansionError {
    pub placeholder: String,
    #[source]
    pub source: EvalError,
}
