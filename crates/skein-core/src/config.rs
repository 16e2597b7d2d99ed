//! Session-wide tunables (§10.3): a serde/TOML input layer resolved
//! against documented defaults, mirroring the `*ConfigInput` → resolved
//! `*Config` split this workspace already uses for its control-plane
//! configuration.

use serde::Deserialize;

/// Argument-string separators (§4.4, §6). Session-configurable so a
/// pipeline author can avoid conflicts with URL schemes that reuse `:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSeparators {
    pub arg: char,
    pub name_value: char,
    pub fragment: char,
    pub list: char,
    pub negate: char,
}

impl Default for ArgSeparators {
    fn default() -> Self {
        ArgSeparators {
            arg: ':',
            name_value: '=',
            fragment: '#',
            list: ',',
            negate: '!',
        }
    }
}

/// Flush policy chosen on `fs_abort` (§4.6 "Cancellation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortMode {
    None,
    Fast,
    Full,
}

/// Raw, partially-specified config as loaded from TOML (§10.3). Every
/// field is optional so a pipeline author only overrides what they need;
/// [`SessionConfigInput::resolve`] fills the rest from
/// [`SessionConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigInput {
    pub threads: Option<usize>,
    pub buffer_us: Option<u64>,
    pub rbuffer_us: Option<u64>,
    pub mbuffer_us: Option<u64>,
    pub session_timeout_ms: Option<u64>,
    pub reconnect_ceiling: Option<u64>,
    pub error_window_ms: Option<u64>,
    pub max_chain_len: Option<usize>,
    pub implicit_linking: Option<bool>,
    pub cache_capability_graph: Option<bool>,
    pub swap_chain_retry_once: Option<bool>,
    pub max_tasks_per_filter_burst: Option<usize>,
    pub max_sleep_ms: Option<u64>,
}

/// Resolved session configuration. Defaults match the numeric defaults
/// named in §4.6/§5/§7: 10s session timeout, 100000 reconnect ceiling,
/// 1s error window, swap-chain retry-once.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub threads: usize,
    pub buffer_us: u64,
    pub rbuffer_us: u64,
    pub mbuffer_us: u64,
    pub session_timeout_ms: u64,
    pub reconnect_ceiling: u64,
    pub error_window_ms: u64,
    pub max_chain_len: usize,
    pub implicit_linking: bool,
    pub cache_capability_graph: bool,
    pub swap_chain_retry_once: bool,
    pub max_tasks_per_filter_burst: usize,
    pub max_sleep_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            threads: 0,
            buffer_us: 1_000_000,
            rbuffer_us: 500_000,
            mbuffer_us: 3_000_000,
            session_timeout_ms: 10_000,
            reconnect_ceiling: 100_000,
            error_window_ms: 1_000,
            max_chain_len: 8,
            implicit_linking: true,
            cache_capability_graph: true,
            swap_chain_retry_once: true,
            max_tasks_per_filter_burst: 10,
            max_sleep_ms: 100,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

impl SessionConfigInput {
    pub fn resolve(self) -> SessionConfig {
        let d = SessionConfig::default();
        SessionConfig {
            threads: self.threads.unwrap_or(d.threads),
            buffer_us: self.buffer_us.unwrap_or(d.buffer_us),
            rbuffer_us: self.rbuffer_us.unwrap_or(d.rbuffer_us),
            mbuffer_us: self.mbuffer_us.unwrap_or(d.mbuffer_us),
            session_timeout_ms: self.session_timeout_ms.unwrap_or(d.session_timeout_ms),
            reconnect_ceiling: self.reconnect_ceiling.unwrap_or(d.reconnect_ceiling),
            error_window_ms: self.error_window_ms.unwrap_or(d.error_window_ms),
            max_chain_len: self.max_chain_len.unwrap_or(d.max_chain_len).max(1),
            implicit_linking: self.implicit_linking.unwrap_or(d.implicit_linking),
            cache_capability_graph: self
                .cache_capability_graph
                .unwrap_or(d.cache_capability_graph),
            swap_chain_retry_once: self
                .swap_chain_retry_once
                .unwrap_or(d.swap_chain_retry_once),
            max_tasks_per_filter_burst: self
                .max_tasks_per_filter_burst
                .unwrap_or(d.max_tasks_per_filter_burst)
                .max(1),
            max_sleep_ms: self.max_sleep_ms.unwrap_or(d.max_sleep_ms).max(1),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, anyhow::Error> {
        if input.trim().is_empty() {
            return Ok(SessionConfig::default());
        }
        let parsed: SessionConfigInput =
            toml::from_str(input).map_err(|e| anyhow::anyhow!("invalid session config TOML: {e}"))?;
        Ok(parsed.resolve())
    }
}

/// Programmatic override surface, for callers that build a config in
/// code rather than loading TOML (§10.3 "programmatic override via
/// builder methods").
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    input: SessionConfigInput,
}

impl SessionConfigBuilder {
    pub fn threads(mut self, n: usize) -> Self {
        self.input.threads = Some(n);
        self
    }
    pub fn buffer_us(mut self, us: u64) -> Self {
        self.input.buffer_us = Some(us);
        self
    }
    pub fn session_timeout_ms(mut self, ms: u64) -> Self {
        self.input.session_timeout_ms = Some(ms);
        self
    }
    pub fn max_chain_len(mut self, n: usize) -> Self {
        self.input.max_chain_len = Some(n);
        self
    }
    pub fn implicit_linking(mut self, enabled: bool) -> Self {
        self.input.implicit_linking = Some(enabled);
        self
    }
    pub fn build(self) -> SessionConfig {
        self.input.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, SessionConfig::default());
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let toml = r#"
            threads = 4
            session_timeout_ms = 5000
        "#;
        let cfg = SessionConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.session_timeout_ms, 5000);
        assert_eq!(cfg.reconnect_ceiling, 100_000);
        assert_eq!(cfg.error_window_ms, 1_000);
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = SessionConfig::builder()
            .threads(2)
            .max_chain_len(3)
            .implicit_linking(false)
            .build();
        assert_eq!(cfg.threads, 2);
        assert_eq!(cfg.max_chain_len, 3);
        assert!(!cfg.implicit_linking);
        assert_eq!(cfg.buffer_us, SessionConfig::default().buffer_us);
    }

    #[test]
    fn max_chain_len_floors_at_one() {
        let toml = "max_chain_len = 0";
        let cfg = SessionConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.max_chain_len, 1);
    }
}
