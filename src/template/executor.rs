//! Template executor: runs request blocks in declared order, threading
//! extracted values forward, and produces the template verdict.
//!
//! Single-threaded per (template, target) pair so extraction flows
//! deterministically; concurrency across templates and targets is the
//! driver's concern.

use url::Url;

use super::Template;
use crate::dsl::{self, Value, VariableMap};
use crate::error::TemplateError;
use crate::scan::{ResultContext, ResultEvent, ScanContext};

/// Builtin variable names derived from the target URL.
pub const BUILTIN_NAMES: &[&str] = &[
    "BaseURL", "RootURL", "Hostname", "Host", "Port", "Scheme", "Path",
];

/// Seeds the execution scope from the target URL.
pub fn target_variables(url: &Url) -> VariableMap {
    let scheme = url.scheme().to_string();
    let host = url.host_str().unwrap_or("").to_string();
    let port = url
        .port_or_known_default()
        .map(|p| p.to_string())
        .unwrap_or_else(|| if scheme == "https" { "443" } else { "80" }.to_string());

    let base_url = match url.port() {
        Some(explicit) => format!("{}://{}:{}", scheme, host, explicit),
        None => format!("{}://{}", scheme, host),
    };
    let root_url = format!("{}/", base_url.trim_end_matches('/'));

    let mut vars = VariableMap::new();
    vars.set("BaseURL", Value::String(base_url));
    vars.set("RootURL", Value::String(root_url));
    vars.set("Hostname", Value::String(host.clone()));
    vars.set("Host", Value::String(host));
    vars.set("Port", Value::String(port));
    vars.set("Scheme", Value::String(scheme));
    vars.set("Path", Value::String(url.path().to_string()));
    vars
}

/// Template variables are expressions when they parse and resolve,
/// placeholder strings when they expand, literals otherwise.
fn evaluate_variable(raw: &serde_yaml::Value, vars: &VariableMap) -> Value {
    let Some(text) = raw.as_str() else {
        return match raw {
            serde_yaml::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .or_else(|| n.as_f64().map(Value::Float))
                .unwrap_or(Value::Null),
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            _ => Value::Null,
        };
    };

    if let Ok(expr) = dsl::Expr::parse(text) {
        let resolvable = expr.identifiers().iter().all(|i| vars.contains(i));
        if resolvable {
            if let Ok(value) = dsl::evaluate(&expr, vars) {
                return value;
            }
        }
    }

    if dsl::has_placeholders(text) {
        if let Ok(expanded) = dsl::expand(text, vars) {
            return Value::String(expanded);
        }
    }

    Value::String(text.to_string())
}

/// Runs every request block of `template` against `target`.
///
/// Per-request transport and expansion failures are recorded as warnings
/// and iteration continues; cancellation stops dispatching and returns
/// the partial result list as-is.
pub async fn execute(
    template: &Template,
    ctx: &ScanContext,
    target: &str,
) -> Result<Vec<ResultEvent>, TemplateError> {
    let url = Url::parse(target).map_err(|e| TemplateError::InvalidTarget {
        target: target.to_string(),
        reason: e.to_string(),
    })?;

    let mut vars = target_variables(&url);
    vars.merge(&ctx.payloads);

    // Template variables evaluate once, in declaration order.
    for (name, value) in &template.variables {
        let name = super::yaml_key(name);
        let evaluated = evaluate_variable(value, &vars);
        vars.set(name, evaluated);
    }

    let result_ctx = ResultContext::new(
        template.id.clone(),
        template.info.name.clone(),
        template.info.severity,
        template.info.metadata.clone(),
        url.host_str().unwrap_or(target).to_string(),
    );

    let mut matched = false;

    for request in &template.http {
        if ctx.is_cancelled() {
            tracing::debug!(template = %template.id, "cancelled before HTTP dispatch");
            break;
        }
        match request.execute(ctx, &mut vars, &url, &result_ctx).await {
            Ok(request_matched) => {
                matched |= request_matched;
                if matched && template.stop_at_first_match {
                    return Ok(ctx.results());
                }
            }
            Err(e) => ctx.log_warning(format!("template {}: {}", template.id, e)),
        }
    }

    for request in &template.network {
        if ctx.is_cancelled() {
            tracing::debug!(template = %template.id, "cancelled before network dispatch");
            break;
        }
        match request.execute(ctx, &mut vars, &url, &result_ctx).await {
            Ok(request_matched) => {
                matched |= request_matched;
                if matched && template.stop_at_first_match {
                    return Ok(ctx.results());
                }
            }
            Err(e) => ctx.log_warning(format!("template {}: {}", template.id, e)),
        }
    }

    Ok(ctx.results())
}
