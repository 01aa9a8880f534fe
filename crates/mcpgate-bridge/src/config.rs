use std::time::Duration;

use anyhow::Context as _;
use url::Url;

/// Bridge configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// SSE URL of the remote server; `session_id` is appended per connect.
    pub url: Url,
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub max_consecutive_timeouts: u32,
    /// Minimum quiet period before a client frame re-arms reconnection once
    /// the attempt budget is exhausted.
    pub recovery_interval: Duration,
}

impl BridgeConfig {
    pub fn new(raw_url: &str) -> anyhow::Result<Self> {
        let url = Url::parse(strip_quotes(raw_url)).context("parse upstream url")?;
        Ok(Self {
            url,
            base_reconnect_delay: Duration::from_millis(1_000),
            max_reconnect_delay: Duration::from_millis(10_000),
            max_reconnect_attempts: 5,
            max_consecutive_timeouts: 3,
            recovery_interval: Duration::from_millis(30_000),
        })
    }

    /// Apply `MCPGATE_*` environment overrides. Unset or unparsable values
    /// keep the defaults.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_u64("MCPGATE_RECONNECT_DELAY_MS") {
            self.base_reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("MCPGATE_MAX_RECONNECT_DELAY_MS") {
            self.max_reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("MCPGATE_MAX_RECONNECT_ATTEMPTS") {
            self.max_reconnect_attempts = n as u32;
        }
        if let Some(ms) = env_u64("MCPGATE_RECOVERY_INTERVAL_MS") {
            self.recovery_interval = Duration::from_millis(ms);
        }
        self
    }

    /// The subscribe URL for one connect attempt.
    pub fn subscribe_url(&self, session_id: &str) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("session_id", session_id);
        url
    }

    /// Resolve the URL carried by the `endpoint` event, which servers send
    /// either absolute or relative to the subscribe URL.
    pub fn resolve_endpoint(&self, raw: &str) -> anyhow::Result<Url> {
        self.url
            .join(raw)
            .with_context(|| format!("resolve endpoint url {raw:?}"))
    }
}

/// Shells hand us URLs still wearing their quotes.
fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

fn env_u64(name: &str) -> Option<u64> {
    let v = std::env::var(name).ok()?;
    v.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_surrounding_quotes() {
        assert_eq!(strip_quotes("\"http://x/sse\""), "http://x/sse");
        assert_eq!(strip_quotes("'http://x/sse'"), "http://x/sse");
        assert_eq!(strip_quotes("http://x/sse"), "http://x/sse");
        assert_eq!(strip_quotes("'"), "'");
    }

    #[test]
    fn appends_session_id_to_bare_url() {
        let cfg = BridgeConfig::new("http://127.0.0.1:9000/sse").expect("config");
        assert_eq!(
            cfg.subscribe_url("abc").as_str(),
            "http://127.0.0.1:9000/sse?session_id=abc"
        );
    }

    #[test]
    fn appends_session_id_to_url_with_query() {
        let cfg = BridgeConfig::new("http://127.0.0.1:9000/sse?token=t").expect("config");
        assert_eq!(
            cfg.subscribe_url("abc").as_str(),
            "http://127.0.0.1:9000/sse?token=t&session_id=abc"
        );
    }

    #[test]
    fn resolves_relative_and_absolute_endpoints() {
        let cfg = BridgeConfig::new("http://127.0.0.1:9000/sse").expect("config");
        assert_eq!(
            cfg.resolve_endpoint("/messages?session_id=abc")
                .expect("relative")
                .as_str(),
            "http://127.0.0.1:9000/messages?session_id=abc"
        );
        assert_eq!(
            cfg.resolve_endpoint("http://other:8080/messages")
                .expect("absolute")
                .as_str(),
            "http://other:8080/messages"
        );
    }

    #[test]
    fn rejects_garbage_urls() {
        assert!(BridgeConfig::new("not a url").is_err());
    }
}
