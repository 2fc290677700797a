//! Router Solicitation bursts used to refresh the router table quickly.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::nd::{build_router_solicit, ALL_ROUTERS};
use crate::timer::{random_delay, Timer};

use super::infra_if::InfraIf;

const MAX_TX_COUNT: u32 = 3;
const MAX_START_DELAY: Duration = Duration::from_millis(1000);
const TX_INTERVAL: Duration = Duration::from_secs(4);
const WAIT_ON_LAST_ATTEMPT: Duration = Duration::from_secs(1);
const RETRY_DELAY: Duration = TX_INTERVAL;

#[derive(Debug, Default)]
pub struct RsSender {
    tx_count: u32,
    start_time: Option<Instant>,
    timer: Timer,
}

impl RsSender {
    pub fn is_in_progress(&self) -> bool {
        self.timer.is_running()
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        self.timer.fire_time()
    }

    pub fn start(&mut self, now: Instant) {
        if self.is_in_progress() {
            return;
        }
        let delay = random_delay(MAX_START_DELAY);
        info!("Starting RS transmission in {:?}", delay);
        self.tx_count = 0;
        self.start_time = Some(now);
        self.timer.start(now, delay);
    }

    pub fn stop(&mut self) {
        self.timer.stop();
    }

    /// Sends the next RS of the burst. Returns the burst start time once
    /// the burst is over.
    pub fn handle_timer(&mut self, infra_if: &mut dyn InfraIf, now: Instant) -> Option<Instant> {
        if !self.timer.take_expired(now) {
            return None;
        }

        if self.tx_count >= MAX_TX_COUNT {
            info!("RS transmission finished after {} messages", self.tx_count);
            return Some(self.start_time.unwrap_or(now));
        }

        match infra_if.send_icmp6(&build_router_solicit(), ALL_ROUTERS) {
            Ok(()) => {
                self.tx_count += 1;
                debug!("Sent RS {}/{}", self.tx_count, MAX_TX_COUNT);
                let delay = if self.tx_count == MAX_TX_COUNT {
                    WAIT_ON_LAST_ATTEMPT
                } else {
                    TX_INTERVAL
                };
                self.timer.start(now, delay);
            }
            Err(e) => {
                warn!("Failed to send RS: {}", e);
                self.timer.start(now, RETRY_DELAY);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nd::ICMP6_ROUTER_SOLICIT;
    use crate::routing::infra_if::testing::FakeInfraIf;

    #[test]
    fn test_burst_of_three() {
        let now = Instant::now();
        let mut infra_if = FakeInfraIf::new();
        let mut sender = RsSender::default();

        sender.start(now);
        assert!(sender.is_in_progress());
        let first = sender.next_fire_time().unwrap();
        assert!(first <= now + MAX_START_DELAY);

        assert_eq!(sender.handle_timer(&mut infra_if, first), None);
        assert_eq!(sender.next_fire_time(), Some(first + TX_INTERVAL));
        let second = first + TX_INTERVAL;
        assert_eq!(sender.handle_timer(&mut infra_if, second), None);
        let third = second + TX_INTERVAL;
        assert_eq!(sender.handle_timer(&mut infra_if, third), None);
        assert_eq!(sender.next_fire_time(), Some(third + WAIT_ON_LAST_ATTEMPT));

        assert_eq!(sender.handle_timer(&mut infra_if, third + WAIT_ON_LAST_ATTEMPT), Some(now));
        assert!(!sender.is_in_progress());

        let sent = infra_if.sent_of_type(ICMP6_ROUTER_SOLICIT);
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(_, dest)| *dest == ALL_ROUTERS));
    }

    #[test]
    fn test_start_while_in_progress_is_ignored() {
        let now = Instant::now();
        let mut sender = RsSender::default();
        sender.start(now);
        let fire = sender.next_fire_time();
        sender.start(now + Duration::from_millis(500));
        assert_eq!(sender.next_fire_time(), fire);
    }

    #[test]
    fn test_send_failure_retries() {
        let now = Instant::now();
        let mut infra_if = FakeInfraIf::new();
        infra_if.fail_sends = true;
        let mut sender = RsSender::default();
        sender.start(now);

        let first = sender.next_fire_time().unwrap();
        assert_eq!(sender.handle_timer(&mut infra_if, first), None);
        assert_eq!(sender.next_fire_time(), Some(first + RETRY_DELAY));
        assert!(infra_if.icmp6_sent.is_empty());

        infra_if.fail_sends = false;
        sender.handle_timer(&mut infra_if, first + RETRY_DELAY);
        assert_eq!(infra_if.icmp6_sent.len(), 1);
    }
}
