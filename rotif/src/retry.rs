//! The retry engine: pure delay computation plus the tagged-enum strategy
//! representation called for by the REDESIGN FLAGS in spec.md §9, in place
//! of runtime dispatch over a string tag.

use std::fmt::Debug;
use std::sync::Arc;

use rotif_helpers::retries::{calculate_retry_wait_time_ms, RetryConfig};

use crate::types::Message;

/// A strategy for computing the delay before the next retry attempt for a
/// message, evaluated as a pure function of `(attempt, message)`.
#[derive(Clone)]
pub enum RetryStrategy {
    Fixed(u64),
    Linear {
        base_ms: u64,
        step_ms: u64,
    },
    Exponential {
        base_ms: u64,
        factor: f64,
        cap_ms: u64,
    },
    ExponentialJitter {
        base_ms: u64,
        factor: f64,
        cap_ms: u64,
        jitter_fraction: f64,
    },
    Fibonacci {
        base_ms: u64,
        cap_ms: u64,
    },
    Custom(Arc<dyn Fn(u32, &Message) -> u64 + Send + Sync>),
}

impl Debug for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStrategy::Fixed(ms) => f.debug_tuple("Fixed").field(ms).finish(),
            RetryStrategy::Linear { base_ms, step_ms } => f
                .debug_struct("Linear")
                .field("base_ms", base_ms)
                .field("step_ms", step_ms)
                .finish(),
            RetryStrategy::Exponential {
                base_ms,
                factor,
                cap_ms,
            } => f
                .debug_struct("Exponential")
                .field("base_ms", base_ms)
                .field("factor", factor)
                .field("cap_ms", cap_ms)
                .finish(),
            RetryStrategy::ExponentialJitter {
                base_ms,
                factor,
                cap_ms,
                jitter_fraction,
            } => f
                .debug_struct("ExponentialJitter")
                .field("base_ms", base_ms)
                .field("factor", factor)
                .field("cap_ms", cap_ms)
                .field("jitter_fraction", jitter_fraction)
                .finish(),
            RetryStrategy::Fibonacci { base_ms, cap_ms } => f
                .debug_struct("Fibonacci")
                .field("base_ms", base_ms)
                .field("cap_ms", cap_ms)
                .finish(),
            RetryStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Fixed(1000)
    }
}

impl RetryStrategy {
    /// Computes the delay in milliseconds before the given 1-based attempt
    /// should be retried. `attempt` is the attempt number that just failed
    /// (i.e. the next attempt will be `attempt + 1`).
    pub fn delay_ms(&self, attempt: u32, message: &Message) -> u64 {
        match self {
            RetryStrategy::Fixed(ms) => *ms,
            RetryStrategy::Linear { base_ms, step_ms } => {
                base_ms + step_ms * attempt.saturating_sub(1) as u64
            }
            RetryStrategy::Exponential {
                base_ms,
                factor,
                cap_ms,
            } => exponential_delay(*base_ms, *factor, *cap_ms, attempt, false, 0.0),
            RetryStrategy::ExponentialJitter {
                base_ms,
                factor,
                cap_ms,
                jitter_fraction,
            } => exponential_delay(*base_ms, *factor, *cap_ms, attempt, true, *jitter_fraction),
            RetryStrategy::Fibonacci { base_ms, cap_ms } => {
                fibonacci_delay(*base_ms, *cap_ms, attempt)
            }
            RetryStrategy::Custom(f) => f(attempt, message),
        }
    }
}

/// Delegates to the same exponential-backoff-with-jitter math the teacher
/// crate uses for its own retry wait times, so the core formula (interval *
/// rate^attempt, capped, optionally jittered) is shared rather than
/// reimplemented.
fn exponential_delay(
    base_ms: u64,
    factor: f64,
    cap_ms: u64,
    attempt: u32,
    jitter: bool,
    jitter_fraction: f64,
) -> u64 {
    let retry_config = RetryConfig {
        interval: Some(base_ms as f64 / 1000.0),
        backoff_rate: Some(factor),
        max_delay: Some((cap_ms / 1000).max(1) as i64),
        jitter: Some(false),
    };

    let full_delay = calculate_retry_wait_time_ms(
        &retry_config,
        attempt.saturating_sub(1) as i64,
        base_ms as f64 / 1000.0,
        factor,
    );

    if jitter {
        let jitter_span = (full_delay as f64 * jitter_fraction.clamp(0.0, 1.0)).max(1.0);
        let jittered = full_delay as f64 - jitter_span + rand::random::<f64>() * jitter_span;
        jittered.max(0.0).trunc() as u64
    } else {
        full_delay
    }
}

fn fibonacci_delay(base_ms: u64, cap_ms: u64, attempt: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..attempt {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    (base_ms.saturating_mul(a)).min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        Message {
            id: "1-0".to_string(),
            channel: "orders.created".to_string(),
            payload: "{}".to_string(),
            timestamp: 0,
            attempt: 1,
            pattern: "orders.*".to_string(),
            exactly_once: false,
            dedup_ttl_secs: 0,
        }
    }

    #[test]
    fn test_fixed_strategy_is_constant() {
        let strategy = RetryStrategy::Fixed(500);
        let message = sample_message();
        assert_eq!(strategy.delay_ms(1, &message), 500);
        assert_eq!(strategy.delay_ms(10, &message), 500);
    }

    #[test]
    fn test_linear_strategy_grows_by_step() {
        let strategy = RetryStrategy::Linear {
            base_ms: 1000,
            step_ms: 250,
        };
        let message = sample_message();
        assert_eq!(strategy.delay_ms(1, &message), 1000);
        assert_eq!(strategy.delay_ms(2, &message), 1250);
        assert_eq!(strategy.delay_ms(3, &message), 1500);
    }

    #[test]
    fn test_exponential_strategy_is_capped() {
        let strategy = RetryStrategy::Exponential {
            base_ms: 1000,
            factor: 2.0,
            cap_ms: 5000,
        };
        let message = sample_message();
        assert_eq!(strategy.delay_ms(1, &message), 1000);
        assert_eq!(strategy.delay_ms(2, &message), 2000);
        assert_eq!(strategy.delay_ms(3, &message), 4000);
        assert_eq!(strategy.delay_ms(4, &message), 5000);
        assert_eq!(strategy.delay_ms(10, &message), 5000);
    }

    #[test]
    fn test_exponential_jitter_never_exceeds_full_delay() {
        let strategy = RetryStrategy::ExponentialJitter {
            base_ms: 1000,
            factor: 2.0,
            cap_ms: 20000,
            jitter_fraction: 0.5,
        };
        let message = sample_message();
        for attempt in 1..8 {
            let full = match &strategy {
                RetryStrategy::ExponentialJitter {
                    base_ms, factor, cap_ms, ..
                } => exponential_delay(*base_ms, *factor, *cap_ms, attempt, false, 0.0),
                _ => unreachable!(),
            };
            let jittered = strategy.delay_ms(attempt, &message);
            assert!(jittered <= full);
        }
    }

    #[test]
    fn test_fibonacci_strategy_follows_fibonacci_sequence_until_capped() {
        let strategy = RetryStrategy::Fibonacci {
            base_ms: 100,
            cap_ms: 500,
        };
        let message = sample_message();
        assert_eq!(strategy.delay_ms(1, &message), 100);
        assert_eq!(strategy.delay_ms(2, &message), 100);
        assert_eq!(strategy.delay_ms(3, &message), 200);
        assert_eq!(strategy.delay_ms(4, &message), 300);
        assert_eq!(strategy.delay_ms(5, &message), 500);
        assert_eq!(strategy.delay_ms(6, &message), 500);
    }

    #[test]
    fn test_custom_strategy_invokes_closure() {
        let strategy = RetryStrategy::Custom(Arc::new(|attempt, _message| attempt as u64 * 10));
        let message = sample_message();
        assert_eq!(strategy.delay_ms(3, &message), 30);
    }
}
