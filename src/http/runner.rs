//! HTTP dispatch: request building, redirect and cookie policy, race
//! mode, event recording and operator evaluation.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

use super::client::{build_client, RequestPolicy};
use super::raw::{self, RawRequest};
use super::HttpRequest;
use crate::dsl::{self, Value, VariableMap};
use crate::error::TemplateError;
use crate::network::ProbeStream;
use crate::operators::OperatorResult;
use crate::scan::{InternalEvent, ResultContext, ScanContext};

/// One concrete thing to send for a payload tuple.
enum Definition<'a> {
    Path(&'a str),
    Raw(&'a str),
}

impl HttpRequest {
    /// Runs the block's full payload iteration against the target.
    ///
    /// Returns whether any dispatch matched. Named extractor outputs are
    /// written back into `vars` so later requests of the template can
    /// reference them.
    pub async fn execute(
        &self,
        ctx: &ScanContext,
        vars: &mut VariableMap,
        target: &Url,
        result_ctx: &ResultContext,
    ) -> Result<bool, TemplateError> {
        let policy = RequestPolicy {
            follow_redirects: self.redirects,
            max_redirects: self.max_redirects,
            cookie_reuse: self.cookie_reuse,
        };
        let client = match ctx.http_client() {
            Some(client) => client,
            None => match build_client(&ctx.client_config, &policy) {
                Ok(client) => client,
                Err(e) => {
                    ctx.log_warning(format!("failed to build HTTP client: {}", e));
                    return Ok(false);
                }
            },
        };

        let definitions: Vec<Definition> = if !self.raw.is_empty() {
            self.raw.iter().map(|r| Definition::Raw(r)).collect()
        } else {
            self.path.iter().map(|p| Definition::Path(p)).collect()
        };

        let mut matched_any = false;

        'tuples: for tuple in self.generator.tuples() {
            if ctx.is_cancelled() {
                tracing::debug!("scan cancelled, stopping payload iteration");
                break;
            }

            let mut scope = vars.clone();
            for (name, value) in &tuple {
                scope.set(name.clone(), Value::String(value.clone()));
            }

            for definition in &definitions {
                if ctx.is_cancelled() {
                    break 'tuples;
                }

                let outcomes = if self.race && self.race_count > 1 {
                    let dispatches = (0..self.race_count)
                        .map(|_| self.dispatch(ctx, &client, &scope, definition, target, result_ctx));
                    join_all(dispatches).await
                } else {
                    vec![
                        self.dispatch(ctx, &client, &scope, definition, target, result_ctx)
                            .await,
                    ]
                };

                for outcome in outcomes {
                    match outcome {
                        Ok(Some(result)) => {
                            for (name, values) in result.named_values() {
                                let value = if values.len() == 1 {
                                    Value::String(values[0].clone())
                                } else {
                                    Value::List(
                                        values.iter().map(|v| Value::String(v.clone())).collect(),
                                    )
                                };
                                vars.set(name.clone(), value.clone());
                                scope.set(name.clone(), value);
                            }
                            matched_any |= result.matched;
                        }
                        // Transport failure: recorded on the event,
                        // iteration continues.
                        Ok(None) => {}
                        // Expansion (or build) failure aborts this
                        // payload tuple.
                        Err(e) => {
                            ctx.log_warning(format!("request expansion failed: {}", e));
                            continue 'tuples;
                        }
                    }
                }

                if matched_any && self.stop_at_first_match {
                    break 'tuples;
                }
            }
        }

        Ok(matched_any)
    }

    async fn dispatch(
        &self,
        ctx: &ScanContext,
        client: &reqwest::Client,
        scope: &VariableMap,
        definition: &Definition<'_>,
        target: &Url,
        result_ctx: &ResultContext,
    ) -> Result<Option<OperatorResult>> {
        match definition {
            Definition::Raw(template) if self.unsafe_raw => {
                self.dispatch_unsafe(ctx, scope, template, target, result_ctx).await
            }
            Definition::Raw(template) => {
                let expanded = dsl::expand(template, scope)?;
                let parsed = RawRequest::parse(&expanded)
                    .context("failed to parse raw request template")?;
                let url = resolve_url(&parsed.uri, scope, target);
                let headers = parsed.headers.iter().cloned().collect();
                let body = (!parsed.body.is_empty()).then(|| parsed.body.clone());
                self.send_normalized(ctx, client, scope, &parsed.method, &url, headers, body, result_ctx)
                    .await
            }
            Definition::Path(path) => {
                let expanded = dsl::expand(path, scope)?;
                let url = resolve_url(&expanded, scope, target);

                let method = match &self.method {
                    Some(method) => dsl::expand(method, scope)?.to_uppercase(),
                    None => "GET".to_string(),
                };

                let mut headers = Vec::new();
                for (name, value) in &self.headers {
                    headers.push((dsl::expand(name, scope)?, dsl::expand(value, scope)?));
                }

                let body = match &self.body {
                    Some(body) => Some(dsl::expand(body, scope)?),
                    None => None,
                };

                self.send_normalized(ctx, client, scope, &method, &url, headers, body, result_ctx)
                    .await
            }
        }
    }

    /// Builds and sends one normalized request, records the event and
    /// evaluates operators.
    #[allow(clippy::too_many_arguments)]
    async fn send_normalized(
        &self,
        ctx: &ScanContext,
        client: &reqwest::Client,
        scope: &VariableMap,
        method: &str,
        url: &str,
        headers: Vec<(String, String)>,
        body: Option<String>,
        result_ctx: &ResultContext,
    ) -> Result<Option<OperatorResult>> {
        let method = reqwest::Method::from_str(method)
            .map_err(|_| anyhow!("invalid HTTP method '{}'", method))?;

        let mut builder = client.request(method.clone(), url);
        for (name, value) in &headers {
            match (HeaderName::from_str(name), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => tracing::debug!("skipping malformed header '{}: {}'", name, value),
            }
        }
        if let Some(body) = &body {
            builder = builder.body(body.clone());
        }

        let request_text = render_request(method.as_str(), url, &headers, body.as_deref());
        let mut event = InternalEvent::new();
        event.set("request", Value::String(request_text));
        event.set("host", Value::from(result_ctx.host.clone()));
        event.set("matched_at", Value::from(url.to_string()));

        let started = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                event.set("error", Value::String(e.to_string()));
                ctx.log_event(event);
                ctx.log_warning(format!("request to {} failed: {}", url, e));
                return Ok(None);
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();

        let mut header_map = BTreeMap::new();
        let mut cookie_map = BTreeMap::new();
        let mut header_lines = Vec::new();
        for (name, value) in response.headers() {
            let Ok(text) = value.to_str() else { continue };
            header_lines.push(format!("{}: {}", name.as_str(), text));
            header_map.insert(name.as_str().to_string(), Value::from(text));
            if name.as_str().eq_ignore_ascii_case("set-cookie") {
                let pair = text.split(';').next().unwrap_or_default();
                if let Some((ck, cv)) = pair.split_once('=') {
                    cookie_map.insert(ck.trim().to_string(), Value::from(cv.trim()));
                }
            }
        }
        let all_headers = header_lines.join("\n");

        let body_bytes = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                event.set("error", Value::String(e.to_string()));
                ctx.log_event(event);
                ctx.log_warning(format!("failed to read body from {}: {}", url, e));
                return Ok(None);
            }
        };
        let duration = started.elapsed();

        let body_text = String::from_utf8_lossy(&body_bytes).into_owned();
        let raw_response = format!("HTTP/1.1 {}\n{}\n\n{}", status, all_headers, body_text);

        event.set("status_code", Value::Int(i64::from(status)));
        event.set("content_length", Value::Int(body_bytes.len() as i64));
        event.set("body", Value::String(body_text));
        event.set("all_headers", Value::String(all_headers));
        event.set("header", Value::Map(header_map));
        if !cookie_map.is_empty() {
            event.set("cookie", Value::Map(cookie_map));
        }
        event.set("response", Value::String(raw_response));
        event.set("raw", Value::Bytes(body_bytes));
        event.set("duration", Value::Int(duration.as_secs() as i64));
        event.set("matched_at", Value::from(final_url.clone()));

        let outcome = self.operators.execute(&event, scope);
        result_ctx.absorb(&outcome.extracts);

        for (name, values) in outcome.named_values() {
            let value = if values.len() == 1 {
                Value::String(values[0].clone())
            } else {
                Value::List(values.iter().map(|v| Value::String(v.clone())).collect())
            };
            event.set(name.clone(), value);
        }

        if outcome.matched {
            let mut extracted = BTreeMap::new();
            if !outcome.anonymous.is_empty() {
                extracted.insert("extracted".to_string(), outcome.anonymous.clone());
            }
            let result =
                result_ctx.result(final_url, outcome.matcher_names.first().cloned(), extracted);
            ctx.log_result(result);
        }

        ctx.log_event(event);
        Ok(Some(outcome))
    }

    /// Serializes the expanded raw template literally over the socket:
    /// no normalization, no automatic Host or Content-Length.
    async fn dispatch_unsafe(
        &self,
        ctx: &ScanContext,
        scope: &VariableMap,
        template: &str,
        target: &Url,
        result_ctx: &ResultContext,
    ) -> Result<Option<OperatorResult>> {
        let expanded = dsl::expand(template, scope)?;
        let wire = raw::to_wire_bytes(&expanded);

        let tls = target.scheme() == "https";
        let host = target.host_str().unwrap_or_default().to_string();
        let port = target
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });
        let timeout = ctx.client_config.timeout;

        let mut event = InternalEvent::new();
        event.set(
            "request",
            Value::String(String::from_utf8_lossy(&wire).into_owned()),
        );
        event.set("host", Value::from(result_ctx.host.clone()));
        event.set("matched_at", Value::from(format!("{}:{}", host, port)));

        let started = Instant::now();
        let mut stream = match ProbeStream::connect(&host, port, tls, timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                event.set("error", Value::String(e.to_string()));
                ctx.log_event(event);
                ctx.log_warning(format!("unsafe dispatch to {}:{} failed: {}", host, port, e));
                return Ok(None);
            }
        };
        if let Err(e) = stream.send(&wire).await {
            event.set("error", Value::String(e.to_string()));
            ctx.log_event(event);
            ctx.log_warning(format!("unsafe dispatch to {}:{} failed: {}", host, port, e));
            return Ok(None);
        }

        let response_bytes = stream.read_to_close(timeout).await;
        let duration = started.elapsed();
        let response_text = String::from_utf8_lossy(&response_bytes).into_owned();

        event.set("response", Value::String(response_text.clone()));
        event.set("raw", Value::Bytes(response_bytes.clone()));
        event.set("duration", Value::Int(duration.as_secs() as i64));

        match raw::parse_response(&response_bytes) {
            Ok(parsed) => {
                let all_headers = parsed
                    .headers
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .collect::<Vec<_>>()
                    .join("\n");
                let header_map = parsed
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                    .collect();
                event.set("status_code", Value::Int(i64::from(parsed.status)));
                event.set("content_length", Value::Int(parsed.body.len() as i64));
                event.set(
                    "body",
                    Value::String(String::from_utf8_lossy(&parsed.body).into_owned()),
                );
                event.set("all_headers", Value::String(all_headers));
                event.set("header", Value::Map(header_map));
            }
            Err(_) => {
                // Not HTTP-shaped: expose everything as the body.
                event.set("body", Value::String(response_text));
                event.set("content_length", Value::Int(response_bytes.len() as i64));
            }
        }

        let outcome = self.operators.execute(&event, scope);
        result_ctx.absorb(&outcome.extracts);

        if outcome.matched {
            let mut extracted = BTreeMap::new();
            if !outcome.anonymous.is_empty() {
                extracted.insert("extracted".to_string(), outcome.anonymous.clone());
            }
            let result = result_ctx.result(
                format!("{}:{}", host, port),
                outcome.matcher_names.first().cloned(),
                extracted,
            );
            ctx.log_result(result);
        }

        ctx.log_event(event);
        Ok(Some(outcome))
    }
}

/// Absolute URLs pass through; everything else resolves against the
/// target's base.
fn resolve_url(path: &str, scope: &VariableMap, target: &Url) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }

    let base = scope
        .get("BaseURL")
        .map(|v| v.to_string())
        .unwrap_or_else(|| {
            let mut base = format!("{}://{}", target.scheme(), target.host_str().unwrap_or(""));
            if let Some(port) = target.port() {
                base.push_str(&format!(":{}", port));
            }
            base
        });

    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

fn render_request(
    method: &str,
    url: &str,
    headers: &[(String, String)],
    body: Option<&str>,
) -> String {
    let mut out = format!("{} {} HTTP/1.1\n", method, url);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\n", name, value));
    }
    out.push('\n');
    if let Some(body) = body {
        out.push_str(body);
    }
    out
}
