//! Reconnection policy for the realtime channel.
//!
//! Pure and deterministic apart from the jitter draw: delay curves and
//! reconnect eligibility are plain functions of their inputs, so backoff
//! behavior is unit-testable without a network.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Observable lifecycle of a realtime subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Connected,
    Disconnected,
    Reconnecting,
    /// Retry budget consumed. Terminal: callers surface a persistent
    /// connection-lost state instead of retrying forever.
    Exhausted,
}

impl std::fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Exponential backoff with uniform jitter. Jitter spreads reconnect storms
/// across many open clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
            jitter_ms: 1_000,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic part of the delay curve:
    /// `min(base * 2^retry_count, max)`, saturating.
    pub fn base_delay_ms(&self, retry_count: u32) -> u64 {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    /// Full delay: the deterministic curve plus a uniform draw from
    /// `[0, jitter_ms)`.
    pub fn compute_delay(&self, retry_count: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        };
        Duration::from_millis(self.base_delay_ms(retry_count) + jitter)
    }

    /// Whether another reconnect attempt is allowed: not when disabled by
    /// policy, not while an attempt is already in flight, and not once the
    /// retry budget is spent.
    pub fn may_reconnect(
        &self,
        can_reconnect: bool,
        is_reconnecting: bool,
        retry_count: u32,
    ) -> bool {
        can_reconnect && !is_reconnecting && retry_count < self.max_retries
    }
}

/// Mutable subscription bookkeeping driven by the connection lifecycle.
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub channel_id: String,
    pub connected: bool,
    pub reconnecting: bool,
    pub retry_count: u32,
    pub can_reconnect: bool,
}

impl SubscriptionState {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            connected: false,
            reconnecting: false,
            retry_count: 0,
            can_reconnect: true,
        }
    }

    pub fn phase(&self, policy: &BackoffPolicy) -> ChannelPhase {
        if self.connected {
            ChannelPhase::Connected
        } else if self.reconnecting {
            ChannelPhase::Reconnecting
        } else if self.retry_count >= policy.max_retries {
            ChannelPhase::Exhausted
        } else {
            ChannelPhase::Disconnected
        }
    }

    pub fn connection_lost(&mut self) {
        self.connected = false;
        self.reconnecting = false;
    }

    pub fn begin_reconnect(&mut self) {
        self.reconnecting = true;
    }

    /// A reconnect attempt failed: no longer in flight, budget reduced.
    pub fn reconnect_failed(&mut self) {
        self.reconnecting = false;
        self.retry_count += 1;
    }

    /// A reconnect attempt succeeded: budget restored in full.
    pub fn reconnect_succeeded(&mut self) {
        self.connected = true;
        self.reconnecting = false;
        self.retry_count = 0;
    }
}
