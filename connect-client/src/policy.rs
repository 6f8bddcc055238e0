use std::time::Duration;

/// User preference gating notification forwarding. Off unless the user
/// opted in, matching the Android app's default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationPolicy {
    pub enabled: bool,
}

impl NotificationPolicy {
    pub fn enabled() -> Self {
        Self { enabled: true }
    }
}

/// Exponential backoff for [`crate::RelayClient::connect_with_retry`].
/// Without one, a dropped connection stays down until the caller
/// reconnects by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}
