//! Heartbeat liveness accounting for duplex peers.

use crate::connection::ClientConnection;

/// What the writer should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Peer is within budget; send the next probe.
    Probe,
    /// Peer missed too many consecutive probes.
    Dead,
}

/// Counts consecutive heartbeat ticks without peer activity.
///
/// At each tick the connection's alive flag is checked and reset. Once
/// `max_missed` consecutive ticks see no activity the peer is dead. With
/// `max_missed = 2` that is two unanswered probes.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    missed: u32,
    max_missed: u32,
}

impl HeartbeatMonitor {
    /// Monitor with the given budget (clamped to at least 1).
    pub fn new(max_missed: u32) -> Self {
        Self {
            missed: 0,
            max_missed: max_missed.max(1),
        }
    }

    /// Evaluate one tick.
    pub fn on_tick(&mut self, connection: &ClientConnection) -> HeartbeatVerdict {
        if connection.check_alive() {
            self.missed = 0;
        } else {
            self.missed += 1;
            if self.missed >= self.max_missed {
                return HeartbeatVerdict::Dead;
            }
        }
        HeartbeatVerdict::Probe
    }

    /// Consecutive ticks without activity so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }
}
