use rand::Rng;

#[derive(Default, Debug, Clone)]
pub struct RetryConfig {
    pub interval: Option<f64>,
    pub backoff_rate: Option<f64>,
    pub max_delay: Option<i64>,
    pub jitter: Option<bool>,
}

/// Calculates the wait time in milliseconds for a retry attempt using
/// exponential backoff, with optional jitter.
/// See: <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
pub fn calculate_retry_wait_time_ms(
    retry_config: &RetryConfig,
    retry_attempt: i64,
    default_interval_seconds: f64,
    default_backoff_rate: f64,
) -> u64 {
    let interval_ms = retry_config.interval.unwrap_or(default_interval_seconds) * 1000.0;
    let multiplier = retry_config.backoff_rate.unwrap_or(default_backoff_rate);
    let mut computed_wait_time_ms = interval_ms * multiplier.powf(retry_attempt as f64);

    if let Some(max_delay) = retry_config.max_delay {
        computed_wait_time_ms = computed_wait_time_ms.min(max_delay as f64 * 1000.0);
    }

    if retry_config.jitter.unwrap_or(false) {
        rand::thread_rng()
            .gen_range(0.0..computed_wait_time_ms.max(1.0))
            .trunc() as u64
    } else {
        computed_wait_time_ms.trunc() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculates_retry_wait_time_ms() {
        let retry_config = RetryConfig {
            interval: Some(2.0),
            backoff_rate: Some(1.5),
            max_delay: Some(14),
            jitter: Some(false),
        };

        let wait_time = calculate_retry_wait_time_ms(&retry_config, 0, 2.0, 1.5);
        assert_eq!(wait_time, 2000);

        let wait_time = calculate_retry_wait_time_ms(&retry_config, 1, 2.0, 1.5);
        assert_eq!(wait_time, 3000);

        let wait_time = calculate_retry_wait_time_ms(&retry_config, 5, 2.0, 1.5);
        assert_eq!(wait_time, 14000);
    }

    #[test_log::test]
    fn test_calculates_retry_wait_time_ms_with_jitter_stays_within_bound() {
        let retry_config = RetryConfig {
            interval: Some(3.0),
            backoff_rate: Some(2.0),
            max_delay: Some(80),
            jitter: Some(true),
        };

        for attempt in 0..6 {
            let wait_time = calculate_retry_wait_time_ms(&retry_config, attempt, 3.0, 2.0);
            assert!(wait_time <= 80000);
        }
    }
}
