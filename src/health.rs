use std::time::Duration;
use tokio::time::Instant;

/// Consecutive read failures before a reconnect is considered.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Minimum time between two forced reconnects.
pub const CONNECTION_RESET_COOLDOWN: Duration = Duration::from_secs(30);

/// Tracks consecutive read failures on the register link and decides when the
/// link should be torn down and rebuilt. Performs no I/O itself.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHealthMonitor {
    consecutive_failures: u32,
    last_reset: Option<Instant>,
}

impl ConnectionHealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// True once enough failures piled up and the cooldown since the previous
    /// reset attempt has elapsed.
    pub fn should_reset(&self) -> bool {
        let cooled_down = self
            .last_reset
            .map_or(true, |at| at.elapsed() >= CONNECTION_RESET_COOLDOWN);
        self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES && cooled_down
    }

    /// Called right before a reconnect. The reconnect is judged on its own by
    /// the reads that follow, so the counter starts over.
    pub fn reset_attempted(&mut self) {
        self.last_reset = Some(Instant::now());
        self.consecutive_failures = 0;
    }
}
