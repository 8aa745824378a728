//! Link quality estimation from echo probes and frame gaps.
//!
//! The monitor is a plain value owned by the session task. The task feeds
//! it probe sends, echoes, delivered frames and detected gaps, and asks it
//! for one [`QualitySample`] per probe interval.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

// ── Classification ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Excellent,
    Good,
    Poor,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Latency/loss boundaries between classes. Both bounds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub excellent_latency_ms: u32,
    pub excellent_loss: f64,
    pub good_latency_ms: u32,
    pub good_loss: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_latency_ms: 80,
            excellent_loss: 0.02,
            good_latency_ms: 150,
            good_loss: 0.1,
        }
    }
}

impl QualityThresholds {
    pub fn classify(&self, latency_ms: u32, loss_rate: f64) -> Classification {
        if latency_ms < self.excellent_latency_ms && loss_rate < self.excellent_loss {
            Classification::Excellent
        } else if latency_ms < self.good_latency_ms && loss_rate < self.good_loss {
            Classification::Good
        } else {
            Classification::Poor
        }
    }
}

// ── QualitySample ────────────────────────────────────────────────

/// Point-in-time link health. Superseded, never mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    pub latency_ms: u32,
    /// Smoothed loss in `0.0..=1.0`.
    pub loss_rate: f64,
    pub classification: Classification,
    pub sampled_at: Instant,
}

// ── QualityMonitor ───────────────────────────────────────────────

#[derive(Debug)]
pub struct QualityMonitor {
    thresholds: QualityThresholds,
    /// EWMA weight of the newest observation.
    alpha: f64,
    probe_timeout: Duration,

    loss_ewma: f64,
    last_rtt: Option<Duration>,
    next_nonce: u64,
    /// Outstanding probes: nonce → send time.
    in_flight: HashMap<u64, Instant>,
    consecutive_timeouts: u32,
    total_timeouts: u64,

    // Counters for the interval being measured.
    interval_frames: u64,
    interval_missing: u64,
    interval_echoes: u64,
    interval_timeouts: u64,
}

impl QualityMonitor {
    pub fn new(thresholds: QualityThresholds, alpha: f64, probe_timeout: Duration) -> Self {
        Self {
            thresholds,
            alpha: alpha.clamp(0.0, 1.0),
            probe_timeout,
            loss_ewma: 0.0,
            last_rtt: None,
            next_nonce: 1,
            in_flight: HashMap::new(),
            consecutive_timeouts: 0,
            total_timeouts: 0,
            interval_frames: 0,
            interval_missing: 0,
            interval_echoes: 0,
            interval_timeouts: 0,
        }
    }

    /// Register a probe sent at `now`; returns its nonce.
    pub fn start_probe(&mut self, now: Instant) -> u64 {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        self.in_flight.insert(nonce, now);
        nonce
    }

    /// Match an echo to its probe. Unknown or already-expired nonces are
    /// ignored.
    pub fn record_echo(&mut self, nonce: u64, now: Instant) -> Option<Duration> {
        let sent = self.in_flight.remove(&nonce)?;
        let rtt = now.saturating_duration_since(sent);
        self.last_rtt = Some(rtt);
        self.consecutive_timeouts = 0;
        self.interval_echoes += 1;
        Some(rtt)
    }

    /// Count frames delivered in order.
    pub fn record_frames(&mut self, delivered: u64) {
        self.interval_frames += delivered;
    }

    /// Count frames skipped by a sequence gap.
    pub fn record_gap(&mut self, missing: u64) {
        self.interval_missing += missing;
    }

    /// Expire probes older than the probe timeout. Returns how many
    /// expired in this call.
    pub fn expire_probes(&mut self, now: Instant) -> u32 {
        let timeout = self.probe_timeout;
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, sent| now.saturating_duration_since(*sent) < timeout);
        let expired = (before - self.in_flight.len()) as u32;

        self.consecutive_timeouts += expired;
        self.total_timeouts += expired as u64;
        self.interval_timeouts += expired as u64;
        expired
    }

    /// Probes that timed out since the last echo.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn total_timeouts(&self) -> u64 {
        self.total_timeouts
    }

    pub fn latency(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Close the current interval and produce a sample.
    ///
    /// The interval's loss observation is the share of expected units
    /// (frames and probes) that never arrived. Returns `None` until there
    /// is something to report: no echo has ever arrived and no probe has
    /// timed out.
    pub fn close_interval(&mut self, now: Instant) -> Option<QualitySample> {
        let lost = self.interval_missing + self.interval_timeouts;
        let expected = self.interval_frames + lost + self.interval_echoes;
        let observed = if expected == 0 {
            0.0
        } else {
            lost as f64 / expected as f64
        };

        let had_timeouts = self.interval_timeouts > 0;
        self.interval_frames = 0;
        self.interval_missing = 0;
        self.interval_echoes = 0;
        self.interval_timeouts = 0;

        self.loss_ewma = self.alpha * observed + (1.0 - self.alpha) * self.loss_ewma;

        let latency = match (self.last_rtt, had_timeouts) {
            (Some(rtt), _) => rtt,
            (None, true) => self.probe_timeout,
            (None, false) => return None,
        };
        let latency_ms = latency.as_millis().min(u32::MAX as u128) as u32;
        let loss_rate = self.loss_ewma.clamp(0.0, 1.0);

        Some(QualitySample {
            latency_ms,
            loss_rate,
            classification: self.thresholds.classify(latency_ms, loss_rate),
            sampled_at: now,
        })
    }

    /// Forget outstanding probes after the transport was replaced.
    pub fn reset_probes(&mut self) {
        self.in_flight.clear();
        self.consecutive_timeouts = 0;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> QualityMonitor {
        QualityMonitor::new(QualityThresholds::default(), 0.3, Duration::from_secs(2))
    }

    #[test]
    fn classification_boundaries() {
        let t = QualityThresholds::default();
        assert_eq!(t.classify(79, 0.019), Classification::Excellent);
        assert_eq!(t.classify(80, 0.0), Classification::Good);
        assert_eq!(t.classify(20, 0.02), Classification::Good);
        assert_eq!(t.classify(149, 0.099), Classification::Good);
        assert_eq!(t.classify(150, 0.0), Classification::Poor);
        assert_eq!(t.classify(10, 0.1), Classification::Poor);
    }

    #[test]
    fn no_sample_before_first_measurement() {
        let mut m = monitor();
        m.start_probe(Instant::now());
        assert!(m.close_interval(Instant::now()).is_none());
    }

    #[test]
    fn echo_sets_latency() {
        let mut m = monitor();
        let t0 = Instant::now();
        let nonce = m.start_probe(t0);
        let rtt = m.record_echo(nonce, t0 + Duration::from_millis(40)).unwrap();
        assert_eq!(rtt, Duration::from_millis(40));
        m.record_frames(30);

        let s = m.close_interval(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(s.latency_ms, 40);
        assert_eq!(s.loss_rate, 0.0);
        assert_eq!(s.classification, Classification::Excellent);
    }

    #[test]
    fn unknown_echo_ignored() {
        let mut m = monitor();
        assert!(m.record_echo(99, Instant::now()).is_none());
    }

    #[test]
    fn loss_is_smoothed() {
        let mut m = monitor();
        let t0 = Instant::now();
        let nonce = m.start_probe(t0);
        m.record_echo(nonce, t0 + Duration::from_millis(10));
        // 9 delivered + 1 missing + 0 probes lost, plus one echo:
        // 1 / 11 lost in this interval.
        m.record_frames(9);
        m.record_gap(1);
        let s = m.close_interval(t0 + Duration::from_secs(1)).unwrap();
        let expected = 0.3 * (1.0 / 11.0);
        assert!((s.loss_rate - expected).abs() < 1e-9, "loss = {}", s.loss_rate);

        // A clean interval decays the estimate.
        m.record_frames(10);
        let s2 = m.close_interval(t0 + Duration::from_secs(2)).unwrap();
        assert!((s2.loss_rate - expected * 0.7).abs() < 1e-9);
    }

    #[test]
    fn probe_timeouts_count_consecutively_until_echo() {
        let mut m = monitor();
        let t0 = Instant::now();
        let a = m.start_probe(t0);
        let b = m.start_probe(t0 + Duration::from_secs(1));
        let _c = m.start_probe(t0 + Duration::from_secs(2));

        assert_eq!(m.expire_probes(t0 + Duration::from_millis(1999)), 0);
        assert_eq!(m.expire_probes(t0 + Duration::from_secs(2)), 1);
        assert_eq!(m.consecutive_timeouts(), 1);
        assert!(m.record_echo(a, t0 + Duration::from_secs(2)).is_none());

        assert_eq!(m.expire_probes(t0 + Duration::from_secs(3)), 1);
        assert_eq!(m.consecutive_timeouts(), 2);
        assert!(m.record_echo(b, t0 + Duration::from_secs(3)).is_none());

        let d = m.start_probe(t0 + Duration::from_secs(3));
        m.record_echo(d, t0 + Duration::from_millis(3050));
        assert_eq!(m.consecutive_timeouts(), 0);
        assert_eq!(m.total_timeouts(), 2);
    }

    #[test]
    fn timeouts_without_echo_report_poor() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.start_probe(t0);
        m.expire_probes(t0 + Duration::from_secs(2));
        let s = m.close_interval(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(s.latency_ms, 2000);
        assert_eq!(s.classification, Classification::Poor);
    }
}
