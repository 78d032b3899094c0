use std::time::Duration;

/// Sender tunables.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Route reliable-delivery messages through the datasync batcher.
    pub datasync_enabled: bool,
    /// Queue depth of each event subscription.
    pub subscription_buffer: usize,
    /// Raw-message retries stop once a message has been sent this many times.
    pub max_resend_count: u32,
    /// Delay before the first retry; doubled on every further attempt.
    pub resend_backoff_base: Duration,
    /// Decode application payloads into typed values on receive.
    pub parse_application_payloads: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            datasync_enabled: true,
            subscription_buffer: 100,
            max_resend_count: 3,
            resend_backoff_base: Duration::from_secs(30),
            parse_application_payloads: true,
        }
    }
}

impl SenderConfig {
    /// Milliseconds that must pass after a message's `send_count`-th dispatch
    /// before it is retried.
    pub fn resend_backoff_ms(&self, send_count: u32) -> i64 {
        let exponent = send_count.saturating_sub(1).min(16);
        let base = i64::try_from(self.resend_backoff_base.as_millis()).unwrap_or(i64::MAX);
        base.saturating_mul(1i64 << exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let config = SenderConfig {
            resend_backoff_base: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.resend_backoff_ms(0), 100);
        assert_eq!(config.resend_backoff_ms(1), 100);
        assert_eq!(config.resend_backoff_ms(2), 200);
        assert_eq!(config.resend_backoff_ms(4), 800);
    }
}
