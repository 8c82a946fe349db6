use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

/// Bounded retry with exponential backoff.
///
/// Every error is retried the same way; the caller decides what the
/// operation covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 1.1,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based):
    /// `initial_delay * backoff_factor^(attempt - 1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.initial_delay.mul_f64(self.backoff_factor.powi(exponent))
    }

    /// Run `op` until it succeeds or the attempts run out, sleeping the
    /// thread between attempts. The error of the last attempt is returned.
    pub fn run<T, E: Display>(&self, op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        self.run_with(op, std::thread::sleep)
    }

    /// [`run`](Self::run) with a custom sleep
    pub fn run_with<T, E: Display>(
        &self,
        mut op: impl FnMut() -> Result<T, E>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T, E> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_retries => return Err(err),
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt,
                        max = self.max_retries,
                        ?delay,
                        "Operation failed, retrying: {}",
                        err
                    );
                    sleep(delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_failures() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let mut delays = Vec::new();

        let result = policy.run_with(
            || {
                calls += 1;
                if calls <= 3 { Err(format!("failure {}", calls)) } else { Ok("written") }
            },
            |d| delays.push(d),
        );

        assert_eq!(result, Ok("written"));
        assert_eq!(calls, 4);
        assert_eq!(delays.len(), 3);
    }

    #[test]
    fn test_exhausted_retries_return_last_error() {
        let policy = RetryPolicy { max_retries: 5, ..Default::default() };
        let mut calls = 0;
        let mut delays = Vec::new();

        let result: Result<(), String> = policy.run_with(
            || {
                calls += 1;
                Err(format!("failure {}", calls))
            },
            |d| delays.push(d),
        );

        assert_eq!(result, Err("failure 5".to_string()));
        assert_eq!(calls, 5);
        // no sleep after the final attempt
        assert_eq!(delays.len(), 4);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_delay_formula() {
        let policy = RetryPolicy {
            max_retries: 4,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_default_delays_grow() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..policy.max_retries).map(|a| policy.delay_for(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(delays[0], Duration::from_millis(100));
    }

    #[test]
    fn test_single_attempt_policy() {
        let policy = RetryPolicy { max_retries: 1, ..Default::default() };
        let result: Result<(), &str> =
            policy.run_with(|| Err("nope"), |_| panic!("must not sleep"));
        assert_eq!(result, Err("nope"));
    }
}
