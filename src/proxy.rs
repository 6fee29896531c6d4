//! Mock-or-forward decision.

use crate::config::{CallRule, Config, ConfigStore};
use std::sync::Arc;
use std::time::Duration;

/// How a single request is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyDecision {
    /// Forward to the upstream instead of serving a mock
    pub should_proxy: bool,
    /// Delay before dispatch, applied either way
    pub lag: Duration,
}

/// Decides per request against the current config.
#[derive(Debug, Clone)]
pub struct ProxyPolicy {
    store: Arc<ConfigStore>,
}

impl ProxyPolicy {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    pub fn decide(&self, path: &str, method: &str) -> ProxyDecision {
        decide(&self.store.get(), path, method)
    }
}

/// Decision for `method path` under `config`.
///
/// A per-method entry wins over a boolean entry for the path, which wins over
/// `proxy.default`. Without a `proxy` section nothing is forwarded.
pub fn decide(config: &Config, path: &str, method: &str) -> ProxyDecision {
    let should_proxy = match &config.proxy {
        None => false,
        Some(proxy) => match proxy.calls.get(path) {
            Some(CallRule::Always(value)) => *value,
            Some(CallRule::PerMethod(methods)) => methods
                .get(&method.to_lowercase())
                .copied()
                .unwrap_or(proxy.default),
            None => proxy.default,
        },
    };

    ProxyDecision {
        should_proxy,
        lag: config.simulated_lag,
    }
}
