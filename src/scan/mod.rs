//! Per-execution scan state: cancellation, client configuration,
//! observation hooks and accumulated events, warnings and errors.

mod events;

pub use events::{InternalEvent, ResultContext, ResultEvent};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

/// Callback fired for every emitted result event.
pub type ResultHook = Box<dyn Fn(&ResultEvent) + Send + Sync>;
/// Callback fired for every recorded error.
pub type ErrorHook = Box<dyn Fn(&str) + Send + Sync>;

/// HTTP client settings carried by a scan context. Request blocks refine
/// these (redirect policy, cookie reuse) when building their client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub proxy: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            proxy: None,
        }
    }
}

#[derive(Default)]
struct ScanState {
    errors: Vec<String>,
    warnings: Vec<String>,
    events: Vec<InternalEvent>,
    results: Vec<ResultEvent>,
}

/// Handle owned by one (template, target) execution.
///
/// Mutable fields sit behind a mutex: user-supplied hooks run from the
/// runners while callers may inspect state concurrently. Runners check
/// [`ScanContext::is_cancelled`] before every dispatch; cancellation
/// stops further requests and the partial results stand as-is.
pub struct ScanContext {
    /// Target input this execution runs against
    pub input: String,
    /// Extra payload values supplied by the caller, bound before
    /// template variables are evaluated
    pub payloads: crate::dsl::VariableMap,

    pub client_config: ClientConfig,

    on_result: Option<ResultHook>,
    on_error: Option<ErrorHook>,

    http_client: RwLock<Option<reqwest::Client>>,
    state: Mutex<ScanState>,
    cancelled: AtomicBool,
}

impl ScanContext {
    pub fn new(input: impl Into<String>, payloads: Option<crate::dsl::VariableMap>) -> Self {
        Self {
            input: input.into(),
            payloads: payloads.unwrap_or_default(),
            client_config: ClientConfig::default(),
            on_result: None,
            on_error: None,
            http_client: RwLock::new(None),
            state: Mutex::new(ScanState::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Sets the proxy URL used for every HTTP client built under this
    /// context.
    pub fn set_proxy(&mut self, proxy: impl Into<String>) {
        self.client_config.proxy = Some(proxy.into());
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.client_config.timeout = timeout;
    }

    pub fn on_result(&mut self, hook: ResultHook) {
        self.on_result = Some(hook);
    }

    pub fn on_error(&mut self, hook: ErrorHook) {
        self.on_error = Some(hook);
    }

    /// Replaces the shared HTTP client. Set this before the first
    /// dispatch; runners fall back to a client built from
    /// [`ClientConfig`] when unset or when a request block needs its own
    /// redirect/cookie policy.
    pub fn set_http_client(&self, client: reqwest::Client) {
        *self.http_client.write() = Some(client);
    }

    pub fn http_client(&self) -> Option<reqwest::Client> {
        self.http_client.read().clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Records a per-request event and fires no hooks; result events go
    /// through [`ScanContext::log_result`].
    pub fn log_event(&self, event: InternalEvent) {
        self.state.lock().events.push(event);
    }

    pub fn log_result(&self, result: ResultEvent) {
        if let Some(hook) = &self.on_result {
            hook(&result);
        }
        self.state.lock().results.push(result);
    }

    /// Records an error, fires the error hook and stamps the joined
    /// error text onto every recorded event's `error` key.
    pub fn log_error(&self, message: impl Into<String>) {
        let message = message.into();
        if let Some(hook) = &self.on_error {
            hook(&message);
        }
        let mut state = self.state.lock();
        state.errors.push(message);
        let joined = state.errors.join("; ");
        for event in &mut state.events {
            event.set("error", crate::dsl::Value::String(joined.clone()));
        }
    }

    /// Records a warning and stamps the joined warning text onto every
    /// recorded event's `warning` key.
    pub fn log_warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "arbalest::scan", "{}", message);
        let mut state = self.state.lock();
        state.warnings.push(message);
        let joined = state.warnings.join("; ");
        for event in &mut state.events {
            event.set("warning", crate::dsl::Value::String(joined.clone()));
        }
    }

    pub fn results(&self) -> Vec<ResultEvent> {
        self.state.lock().results.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.state.lock().warnings.clone()
    }

    pub fn events_recorded(&self) -> usize {
        self.state.lock().events.len()
    }
}
