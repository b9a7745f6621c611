//! Per-peer misbehavior accounting: penalties accumulate per offense and
//! decay over time; crossing the threshold bans the peer for a fixed
//! window. Reads normalize lazily — an expired ban rewrites itself to a
//! clean penalty entry, and elapsed time forgives penalty units.

use std::collections::HashMap;

/// Offenses the broker layer reports, with their penalty weight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offense {
    /// Payload before (or instead of) the expected handshake
    Spamming,
    /// Pong nonce does not match the outstanding ping
    InvalidPingPong,
    /// Peer did not answer within its window
    RequestTimeout,
    /// Block failed validation
    InvalidBlock,
    /// Transaction failed cheap admission checks
    InvalidTransaction,
}

impl Offense {
    pub fn penalty(&self) -> u32 {
        match self {
            Offense::Spamming => 100,
            Offense::InvalidPingPong => 50,
            Offense::RequestTimeout => 10,
            Offense::InvalidBlock => 20,
            Offense::InvalidTransaction => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisbehaviorStatus {
    Penalty { score: u32, updated_at_ms: u64 },
    Banned { until_ms: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct MisbehaviorConfig {
    pub ban_threshold: u32,
    pub ban_duration_ms: u64,
    /// A penalty entry untouched this long resets to zero
    pub penalty_forgiveness_ms: u64,
    /// One penalty unit is forgiven per elapsed interval
    pub penalty_frequency_ms: u64,
}

impl Default for MisbehaviorConfig {
    fn default() -> Self {
        Self {
            ban_threshold: 100,
            ban_duration_ms: 60 * 60 * 1000,
            penalty_forgiveness_ms: 10 * 60 * 1000,
            penalty_frequency_ms: 60 * 1000,
        }
    }
}

pub struct MisbehaviorStorage {
    peers: HashMap<String, MisbehaviorStatus>,
    config: MisbehaviorConfig,
}

impl MisbehaviorStorage {
    pub fn new(config: MisbehaviorConfig) -> Self {
        MisbehaviorStorage { peers: HashMap::new(), config }
    }

    /// Extract the IP portion from an "IP:port" address string, so
    /// reconnecting on a new port keeps the history
    fn ip_of(addr: &str) -> String {
        addr.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(addr).to_string()
    }

    /// Add `delta` penalty units. Returns the resulting status; crossing
    /// the threshold transitions the peer to banned.
    pub fn update(&mut self, addr: &str, delta: u32, now_ms: u64) -> MisbehaviorStatus {
        let ip = Self::ip_of(addr);
        let current = self.normalized(&ip, now_ms);
        let next = match current {
            MisbehaviorStatus::Banned { .. } => current,
            MisbehaviorStatus::Penalty { score, .. } => {
                let score = score + delta;
                if score >= self.config.ban_threshold {
                    tracing::warn!("🚫 Banning {} (penalty {} ≥ {})", ip, score, self.config.ban_threshold);
                    MisbehaviorStatus::Banned { until_ms: now_ms + self.config.ban_duration_ms }
                } else {
                    MisbehaviorStatus::Penalty { score, updated_at_ms: now_ms }
                }
            }
        };
        self.peers.insert(ip, next);
        next
    }

    pub fn report(&mut self, addr: &str, offense: Offense, now_ms: u64) -> MisbehaviorStatus {
        tracing::debug!("Peer {} reported for {:?}", addr, offense);
        self.update(addr, offense.penalty(), now_ms)
    }

    pub fn get(&mut self, addr: &str, now_ms: u64) -> MisbehaviorStatus {
        let ip = Self::ip_of(addr);
        let status = self.normalized(&ip, now_ms);
        self.peers.insert(ip, status);
        status
    }

    pub fn is_banned(&mut self, addr: &str, now_ms: u64) -> bool {
        matches!(self.get(addr, now_ms), MisbehaviorStatus::Banned { .. })
    }

    pub fn ban_count(&self, now_ms: u64) -> usize {
        self.peers
            .values()
            .filter(|s| matches!(s, MisbehaviorStatus::Banned { until_ms } if now_ms < *until_ms))
            .count()
    }

    /// Apply time-based transitions: ban expiry and penalty forgiveness
    fn normalized(&self, ip: &str, now_ms: u64) -> MisbehaviorStatus {
        match self.peers.get(ip) {
            None => MisbehaviorStatus::Penalty { score: 0, updated_at_ms: now_ms },
            Some(MisbehaviorStatus::Banned { until_ms }) => {
                if now_ms >= *until_ms {
                    MisbehaviorStatus::Penalty { score: 0, updated_at_ms: now_ms }
                } else {
                    MisbehaviorStatus::Banned { until_ms: *until_ms }
                }
            }
            Some(MisbehaviorStatus::Penalty { score, updated_at_ms }) => {
                let elapsed = now_ms.saturating_sub(*updated_at_ms);
                if elapsed >= self.config.penalty_forgiveness_ms {
                    return MisbehaviorStatus::Penalty { score: 0, updated_at_ms: now_ms };
                }
                let forgiven = (elapsed / self.config.penalty_frequency_ms) as u32;
                if forgiven == 0 {
                    return MisbehaviorStatus::Penalty { score: *score, updated_at_ms: *updated_at_ms };
                }
                MisbehaviorStatus::Penalty {
                    score: score.saturating_sub(forgiven),
                    updated_at_ms: now_ms,
                }
            }
        }
    }
}
