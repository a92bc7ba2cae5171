//! Raw TCP/TLS dispatch for network request blocks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use url::Url;

use super::{CompiledInput, NetworkRequest};
use crate::dsl::{self, Value, VariableMap};
use crate::error::TemplateError;
use crate::scan::{InternalEvent, ResultContext, ScanContext};

/// Certificate verifier that accepts everything. Probe targets routinely
/// present self-signed or mismatched certificates.
#[derive(Debug)]
struct NoVerification(rustls::crypto::CryptoProvider);

impl NoVerification {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// A plain or TLS connection to one endpoint.
pub(crate) enum ProbeStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ProbeStream {
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        tls: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("connect timeout to {}", addr))?
            .with_context(|| format!("failed to connect to {}", addr))?;

        if !tls {
            return Ok(ProbeStream::Plain(stream));
        }

        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.to_string())
            .with_context(|| format!("invalid TLS server name '{}'", host))?;

        let tls_stream = tokio::time::timeout(timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| anyhow!("TLS handshake timeout with {}", addr))?
            .with_context(|| format!("TLS handshake failed with {}", addr))?;
        Ok(ProbeStream::Tls(Box::new(tls_stream)))
    }

    pub(crate) async fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            ProbeStream::Plain(s) => s.write_all(data).await,
            ProbeStream::Tls(s) => s.write_all(data).await,
        }
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ProbeStream::Plain(s) => s.read(buf).await,
            ProbeStream::Tls(s) => s.read(buf).await,
        }
    }

    /// Reads exactly `n` bytes, stopping early on connection close or
    /// when the deadline passes.
    pub(crate) async fn read_n(&mut self, n: usize, timeout: Duration) -> Vec<u8> {
        let mut out = Vec::with_capacity(n.min(64 * 1024));
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; 4096];

        while out.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let want = (n - out.len()).min(buf.len());
            match tokio::time::timeout(remaining, self.read_some(&mut buf[..want])).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(read)) => out.extend_from_slice(&buf[..read]),
                Ok(Err(_)) => break,
            }
        }
        out
    }

    /// Drains the connection until close or the deadline.
    pub(crate) async fn read_to_close(&mut self, timeout: Duration) -> Vec<u8> {
        let mut out = Vec::new();
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; 8192];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.read_some(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(read)) => out.extend_from_slice(&buf[..read]),
                Ok(Err(_)) => break,
            }
        }
        out
    }
}

/// An expanded host expression: `tls://{{Hostname}}:8443` and friends.
#[derive(Debug, PartialEq)]
struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
}

fn parse_endpoint(expr: &str, default_port: u16) -> Result<Endpoint> {
    let (tls, rest) = match expr.strip_prefix("tls://") {
        Some(rest) => (true, rest),
        None => (false, expr),
    };
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(anyhow!("empty host expression"));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            Ok(Endpoint {
                host: host.to_string(),
                port: port.parse().context("port out of range")?,
                tls,
            })
        }
        _ => Ok(Endpoint {
            host: rest.to_string(),
            port: default_port,
            tls,
        }),
    }
}

impl NetworkRequest {
    /// Runs this block against every declared host. Returns whether any
    /// endpoint matched; named extracts land in `vars` for later
    /// requests.
    pub async fn execute(
        &self,
        ctx: &ScanContext,
        vars: &mut VariableMap,
        target: &Url,
        result_ctx: &ResultContext,
    ) -> Result<bool, TemplateError> {
        let default_port = target
            .port_or_known_default()
            .unwrap_or(if target.scheme() == "https" { 443 } else { 80 });
        let timeout = ctx.client_config.timeout;
        let mut matched_any = false;

        for host_expr in &self.hosts {
            if ctx.is_cancelled() {
                tracing::debug!("scan cancelled, skipping remaining network hosts");
                break;
            }

            let expanded = match dsl::expand(host_expr, vars) {
                Ok(expanded) => expanded,
                Err(e) => {
                    ctx.log_warning(format!("network host expansion failed: {}", e));
                    continue;
                }
            };
            let endpoint = match parse_endpoint(&expanded, default_port) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    ctx.log_warning(format!("invalid network host '{}': {}", expanded, e));
                    continue;
                }
            };

            match self
                .dispatch(ctx, vars, &endpoint, timeout, result_ctx)
                .await
            {
                Ok(matched) => matched_any |= matched,
                Err(e) => ctx.log_warning(format!(
                    "network dispatch to {}:{} failed: {}",
                    endpoint.host, endpoint.port, e
                )),
            }
        }

        Ok(matched_any)
    }

    async fn dispatch(
        &self,
        ctx: &ScanContext,
        vars: &mut VariableMap,
        endpoint: &Endpoint,
        timeout: Duration,
        result_ctx: &ResultContext,
    ) -> Result<bool> {
        let started = Instant::now();
        let address = format!("{}:{}", endpoint.host, endpoint.port);
        let mut event = InternalEvent::new();
        event.set("host", Value::from(address.clone()));
        event.set("matched_at", Value::from(address.clone()));

        let connection =
            ProbeStream::connect(&endpoint.host, endpoint.port, endpoint.tls, timeout).await;
        let mut stream = match connection {
            Ok(stream) => stream,
            Err(e) => {
                // Transport errors ride on the event and never abort the
                // template.
                event.set("error", Value::String(e.to_string()));
                ctx.log_event(event);
                return Err(e);
            }
        };

        let mut sent = Vec::new();
        let mut collected = Vec::new();
        let mut bindings = VariableMap::new();

        for input in &self.compiled_inputs {
            let (data, read, name) = match input {
                CompiledInput::Bytes { data, read, name } => (data.clone(), *read, name),
                CompiledInput::Text {
                    template,
                    read,
                    name,
                } => {
                    let expanded = match dsl::expand(template, vars) {
                        Ok(expanded) => expanded,
                        Err(e) => {
                            ctx.log_warning(format!("network input expansion failed: {}", e));
                            event.set("error", Value::String(e.to_string()));
                            ctx.log_event(event);
                            return Ok(false);
                        }
                    };
                    (expanded.into_bytes(), *read, name)
                }
            };

            if let Err(e) = stream.send(&data).await {
                event.set("error", Value::String(e.to_string()));
                ctx.log_event(event);
                return Err(e.into());
            }
            sent.extend_from_slice(&data);

            if read > 0 {
                let chunk = stream.read_n(read, timeout).await;
                if let Some(name) = name {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    bindings.set(name.clone(), Value::String(text));
                }
                collected.extend_from_slice(&chunk);
            }
        }

        let trailing = if self.read_all {
            stream.read_to_close(timeout).await
        } else {
            stream.read_n(self.read_size, timeout).await
        };
        collected.extend_from_slice(&trailing);

        let data_text = String::from_utf8_lossy(&collected).into_owned();
        event.set("request", Value::String(String::from_utf8_lossy(&sent).into_owned()));
        event.set("data", Value::String(data_text.clone()));
        event.set("body", Value::String(data_text));
        event.set("raw", Value::Bytes(collected));
        event.set("duration", Value::Int(started.elapsed().as_secs() as i64));
        for (name, value) in bindings.iter() {
            event.set(name.to_string(), value.clone());
        }

        let mut scope = vars.clone();
        scope.merge(&bindings);
        let outcome = self.operators.execute(&event, &scope);
        result_ctx.absorb(&outcome.extracts);

        for (name, values) in outcome.named_values() {
            let value = if values.len() == 1 {
                Value::String(values[0].clone())
            } else {
                Value::List(values.iter().map(|v| Value::String(v.clone())).collect())
            };
            vars.set(name.clone(), value.clone());
            event.set(name.clone(), value);
        }

        if outcome.matched {
            let mut extracted = std::collections::BTreeMap::new();
            if !outcome.anonymous.is_empty() {
                extracted.insert("extracted".to_string(), outcome.anonymous.clone());
            }
            let result = result_ctx.result(
                address,
                outcome.matcher_names.first().cloned(),
                extracted,
            );
            ctx.log_result(result);
        }

        ctx.log_event(event);
        Ok(outcome.matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("example.com", 80).unwrap(),
            Endpoint {
                host: "example.com".into(),
                port: 80,
                tls: false
            }
        );
        assert_eq!(
            parse_endpoint("example.com:25", 80).unwrap(),
            Endpoint {
                host: "example.com".into(),
                port: 25,
                tls: false
            }
        );
        assert_eq!(
            parse_endpoint("tls://example.com:8443", 80).unwrap(),
            Endpoint {
                host: "example.com".into(),
                port: 8443,
                tls: true
            }
        );
        assert!(parse_endpoint("", 80).is_err());
        assert!(parse_endpoint("host:99999", 80).is_err());
    }
}
