//! Detection of peer border routers attached to a different infrastructure
//! link (multiple AILs).
//!
//! Border routers in the mesh data that we never see on our own link hint
//! that the mesh bridges more than one infrastructure link. The condition
//! must hold for `DETECT_TIME` before it is reported, and must be gone for
//! `CLEAR_TIME` before the report is withdrawn.

use std::time::{Duration, Instant};

use tracing::info;

use crate::timer::Timer;

pub const DETECT_TIME: Duration = Duration::from_secs(10 * 60);
pub const CLEAR_TIME: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct MultiAilDetector {
    enabled: bool,
    running: bool,
    detected: bool,
    net_data_peer_br_count: u16,
    reachable_peer_br_count: u16,
    timer: Timer,
}

impl MultiAilDetector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_detected(&self) -> bool {
        self.detected
    }

    pub fn net_data_peer_br_count(&self) -> u16 {
        self.net_data_peer_br_count
    }

    pub fn reachable_peer_br_count(&self) -> u16 {
        self.reachable_peer_br_count
    }

    pub fn next_fire_time(&self) -> Option<Instant> {
        self.timer.fire_time()
    }

    /// Returns `Some(false)` if disabling withdrew an active detection.
    pub fn set_enabled(&mut self, enabled: bool) -> Option<bool> {
        if self.enabled == enabled {
            return None;
        }
        self.enabled = enabled;
        if !enabled {
            return self.stop();
        }
        None
    }

    pub fn start(&mut self) {
        self.running = self.enabled;
    }

    /// Returns `Some(false)` if an active detection was withdrawn.
    pub fn stop(&mut self) -> Option<bool> {
        self.running = false;
        self.timer.stop();
        self.net_data_peer_br_count = 0;
        self.reachable_peer_br_count = 0;
        if std::mem::take(&mut self.detected) {
            info!("Multi-AIL detection cleared");
            return Some(false);
        }
        None
    }

    pub fn evaluate(&mut self, net_data_peer_br_count: u16, reachable_peer_br_count: u16, now: Instant) {
        if !self.running {
            return;
        }

        self.net_data_peer_br_count = net_data_peer_br_count;
        self.reachable_peer_br_count = reachable_peer_br_count;
        let condition = net_data_peer_br_count > reachable_peer_br_count;

        if condition == self.detected {
            self.timer.stop();
        } else if !self.timer.is_running() {
            self.timer.start(now, if condition { DETECT_TIME } else { CLEAR_TIME });
        }
    }

    /// Returns the new detection state when it flipped.
    pub fn handle_timer(&mut self, now: Instant) -> Option<bool> {
        if !self.timer.take_expired(now) {
            return None;
        }
        self.detected = !self.detected;
        info!(
            "Multi-AIL {} ({} peer BRs in mesh data, {} reachable on link)",
            if self.detected { "detected" } else { "cleared" },
            self.net_data_peer_br_count,
            self.reachable_peer_br_count
        );
        Some(self.detected)
    }
}
