//! Idle tracking for the relay.
//!
//! The relay is reclaimed once nothing has happened for `timeout`. Any
//! handled event counts as activity; keep-alive pings from the streaming
//! helper exist only to produce such events during long transfers.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct IdleMonitor {
    timeout: Duration,
    last_activity: Instant,
    keepalives: u64,
}

impl IdleMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_activity: Instant::now(),
            keepalives: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn record_keepalive(&mut self) {
        self.keepalives += 1;
        self.touch();
    }

    /// Instant at which the relay becomes reclaimable.
    pub fn deadline(&self) -> Instant {
        self.last_activity + self.timeout
    }

    pub fn is_idle(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn keepalives(&self) -> u64 {
        self.keepalives
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_after_timeout() {
        let monitor = IdleMonitor::new(Duration::from_secs(30));
        assert!(!monitor.is_idle());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(monitor.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_extends_deadline() {
        let mut monitor = IdleMonitor::new(Duration::from_secs(30));
        let first = monitor.deadline();

        tokio::time::advance(Duration::from_secs(20)).await;
        monitor.record_keepalive();
        assert_eq!(monitor.deadline(), first + Duration::from_secs(20));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!monitor.is_idle());
        assert_eq!(monitor.keepalives(), 1);
        assert_eq!(monitor.idle_for(), Duration::from_secs(20));
    }
}
