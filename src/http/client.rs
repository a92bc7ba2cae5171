//! HTTP client construction.
//!
//! Each execution builds its clients from the scan context's
//! [`ClientConfig`](crate::scan::ClientConfig) plus the request block's
//! redirect and cookie policy; clients are never mutated after build.

use anyhow::{Context, Result};

use crate::scan::ClientConfig;

pub const USER_AGENT: &str =
    "Mozilla/5.0 (compatible; MSIE 9.0; Windows NT 6.1; Trident/5.0)";

pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Per-request-block refinement over the context-level client settings.
#[derive(Debug, Clone, Default)]
pub struct RequestPolicy {
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub cookie_reuse: bool,
}

/// Builds a client for one request block. TLS verification is always
/// disabled: probe targets routinely present self-signed certificates.
pub fn build_client(config: &ClientConfig, policy: &RequestPolicy) -> Result<reqwest::Client> {
    let redirect = if policy.follow_redirects {
        let limit = if policy.max_redirects == 0 {
            DEFAULT_MAX_REDIRECTS
        } else {
            policy.max_redirects
        };
        reqwest::redirect::Policy::limited(limit)
    } else {
        reqwest::redirect::Policy::none()
    };

    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .redirect(redirect)
        .danger_accept_invalid_certs(true)
        .user_agent(USER_AGENT)
        .cookie_store(policy.cookie_reuse);

    if let Some(proxy) = &config.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .with_context(|| format!("invalid proxy URL '{}'", proxy))?;
        builder = builder.proxy(proxy);
    }

    builder.build().context("failed to build HTTP client")
}
