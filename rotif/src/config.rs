use std::sync::Arc;

use rotif_helpers::env::EnvVars;
use rotif_helpers::redis::ConnectionConfig;

use crate::retry::RetryStrategy;

/// A per-(attempt, message) retry delay function, the function-valued form
/// of `retryDelay` from spec.md §6.
pub type RetryDelayFn = Arc<dyn Fn(u32, &crate::types::Message) -> u64 + Send + Sync>;

/// Cleanup configuration for the dead-letter queue, matching the
/// `dlqCleanup` option group in spec.md §6.
#[derive(Clone)]
pub struct DlqCleanupConfig {
    pub enabled: bool,
    pub max_age_secs: u64,
    pub max_size: u64,
    pub cleanup_interval_secs: u64,
    pub batch_size: usize,
    pub archive_before_delete: bool,
    pub archive_prefix: String,
}

impl Default for DlqCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age_secs: 7 * 24 * 3600,
            max_size: 10_000,
            cleanup_interval_secs: 3600,
            batch_size: 100,
            archive_before_delete: false,
            archive_prefix: "rotif:dlq:archive".to_string(),
        }
    }
}

/// User-supplied configuration for a Rotif broker instance. Every field
/// beyond `redis` is optional; unset fields fall back to the defaults
/// documented in spec.md §6 when the broker finalizes its configuration,
/// mirroring how the teacher's `RedisConsumerConfig` becomes a
/// `RedisConsumerFinalisedConfig`.
#[derive(Clone, Default)]
pub struct RotifConfig {
    pub redis: ConnectionConfig,
    pub max_retries: Option<u32>,
    pub max_stream_length: Option<u64>,
    pub min_stream_id: Option<String>,
    pub block_interval_ms: Option<u64>,
    pub check_delay_interval_ms: Option<u64>,
    pub scheduled_batch_size: Option<isize>,
    pub deduplication_ttl_secs: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub retry_delay_fn: Option<RetryDelayFn>,
    pub retry_strategy: Option<RetryStrategy>,
    pub disable_delayed: bool,
    pub disable_pending_message_recovery: bool,
    pub pending_check_interval_ms: Option<u64>,
    pub pending_idle_threshold_ms: Option<u64>,
    pub local_round_robin: bool,
    pub dlq_cleanup: DlqCleanupConfig,
}

impl RotifConfig {
    /// Applies `ROTIF_*` environment overrides on top of whatever the
    /// caller already set, mirroring how the teacher's `EnvVars`
    /// abstraction lets config loading be exercised without touching the
    /// real process environment.
    pub fn apply_env_overrides(mut self, env: &dyn EnvVars) -> Self {
        if let Ok(v) = env.var("ROTIF_MAX_RETRIES") {
            if let Ok(v) = v.parse() {
                self.max_retries = Some(v);
            }
        }
        if let Ok(v) = env.var("ROTIF_BLOCK_INTERVAL_MS") {
            if let Ok(v) = v.parse() {
                self.block_interval_ms = Some(v);
            }
        }
        if let Ok(v) = env.var("ROTIF_DEDUPLICATION_TTL_SECS") {
            if let Ok(v) = v.parse() {
                self.deduplication_ttl_secs = Some(v);
            }
        }
        if let Ok(v) = env.var("ROTIF_RETRY_DELAY_MS") {
            if let Ok(v) = v.parse() {
                self.retry_delay_ms = Some(v);
            }
        }
        if let Ok(v) = env.var("ROTIF_DISABLE_DELAYED") {
            self.disable_delayed = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env.var("ROTIF_LOCAL_ROUND_ROBIN") {
            self.local_round_robin = v == "1" || v.eq_ignore_ascii_case("true");
        }
        self
    }
}

/// `RotifConfig` with every default from spec.md §6 applied exactly once,
/// at broker construction time.
#[derive(Clone)]
pub struct RotifFinalisedConfig {
    pub max_retries: u32,
    pub max_stream_length: Option<u64>,
    pub min_stream_id: Option<String>,
    pub block_interval_ms: u64,
    pub check_delay_interval_ms: u64,
    pub scheduled_batch_size: isize,
    pub deduplication_ttl_secs: u64,
    pub retry_delay_ms: u64,
    pub retry_delay_fn: Option<RetryDelayFn>,
    pub retry_strategy: Option<RetryStrategy>,
    pub disable_delayed: bool,
    pub disable_pending_message_recovery: bool,
    pub pending_check_interval_ms: u64,
    pub pending_idle_threshold_ms: u64,
    pub local_round_robin: bool,
    pub dlq_cleanup: DlqCleanupConfig,
}

impl RotifFinalisedConfig {
    pub fn dispatch_mode(&self) -> crate::types::DispatchMode {
        if self.local_round_robin {
            crate::types::DispatchMode::LocalRoundRobin
        } else {
            crate::types::DispatchMode::FanOut
        }
    }
}

impl From<&RotifConfig> for RotifFinalisedConfig {
    fn from(config: &RotifConfig) -> Self {
        Self {
            max_retries: config.max_retries.unwrap_or(5),
            max_stream_length: config.max_stream_length,
            min_stream_id: config.min_stream_id.clone(),
            block_interval_ms: config.block_interval_ms.unwrap_or(5000),
            check_delay_interval_ms: config.check_delay_interval_ms.unwrap_or(1000),
            scheduled_batch_size: config.scheduled_batch_size.unwrap_or(1000),
            deduplication_ttl_secs: config.deduplication_ttl_secs.unwrap_or(3600),
            retry_delay_ms: config.retry_delay_ms.unwrap_or(1000),
            retry_delay_fn: config.retry_delay_fn.clone(),
            retry_strategy: config.retry_strategy.clone(),
            disable_delayed: config.disable_delayed,
            disable_pending_message_recovery: config.disable_pending_message_recovery,
            pending_check_interval_ms: config.pending_check_interval_ms.unwrap_or(30_000),
            pending_idle_threshold_ms: config.pending_idle_threshold_ms.unwrap_or(60_000),
            local_round_robin: config.local_round_robin,
            dlq_cleanup: config.dlq_cleanup.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::env::VarError;

    use super::*;

    struct FakeEnvVars(HashMap<String, String>);

    impl EnvVars for FakeEnvVars {
        fn var(&self, key: &str) -> Result<String, VarError> {
            self.0.get(key).cloned().ok_or(VarError::NotPresent)
        }

        fn clone_env_vars(&self) -> Box<dyn EnvVars> {
            Box::new(FakeEnvVars(self.0.clone()))
        }
    }

    #[test]
    fn test_apply_env_overrides_parses_recognised_vars() {
        let env = FakeEnvVars(HashMap::from([
            ("ROTIF_MAX_RETRIES".to_string(), "9".to_string()),
            ("ROTIF_DISABLE_DELAYED".to_string(), "true".to_string()),
        ]));
        let config = RotifConfig::default().apply_env_overrides(&env);

        assert_eq!(config.max_retries, Some(9));
        assert!(config.disable_delayed);
        assert_eq!(config.block_interval_ms, None);
    }

    #[test]
    fn test_finalised_config_applies_spec_defaults() {
        let config = RotifConfig::default();
        let finalised = RotifFinalisedConfig::from(&config);

        assert_eq!(finalised.max_retries, 5);
        assert_eq!(finalised.block_interval_ms, 5000);
        assert_eq!(finalised.check_delay_interval_ms, 1000);
        assert_eq!(finalised.scheduled_batch_size, 1000);
        assert_eq!(finalised.deduplication_ttl_secs, 3600);
        assert_eq!(finalised.retry_delay_ms, 1000);
        assert_eq!(finalised.pending_check_interval_ms, 30_000);
        assert_eq!(finalised.pending_idle_threshold_ms, 60_000);
        assert!(!finalised.local_round_robin);
        assert!(!finalised.dlq_cleanup.enabled);
    }

    #[test]
    fn test_finalised_config_preserves_explicit_overrides() {
        let config = RotifConfig {
            max_retries: Some(2),
            block_interval_ms: Some(1500),
            local_round_robin: true,
            ..Default::default()
        };
        let finalised = RotifFinalisedConfig::from(&config);

        assert_eq!(finalised.max_retries, 2);
        assert_eq!(finalised.block_interval_ms, 1500);
        assert!(finalised.local_round_robin);
    }
}
