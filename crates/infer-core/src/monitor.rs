use crate::config::{ThresholdConfig, ViolationTolerance};
use crate::schema::{MeasurementRecord, Phase, RecordStatus};

/// Decision after one observed record. The monitor only ever emits the
/// signal; acting on it is the run controller's job alone.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Continue,
    Stop(Violation),
}

/// The record that exhausted the tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub sequence_id: u64,
    pub latency_s: f64,
    pub queue_delay_us: u64,
    pub violations_observed: u64,
}

/// Evaluates steady-phase records against the configured thresholds.
/// Deterministic: replaying the same record sequence against a fresh
/// monitor yields the same counts and the same stop decision.
pub struct ThresholdMonitor {
    cfg: ThresholdConfig,
    violations: u64,
    steady_seen: u64,
}

impl ThresholdMonitor {
    pub fn new(cfg: ThresholdConfig) -> Self {
        Self {
            cfg,
            violations: 0,
            steady_seen: 0,
        }
    }

    /// Warm-up rows and failed requests never count against the thresholds;
    /// the former are excluded by design, the latter have no meaningful
    /// latency to judge.
    pub fn observe(&mut self, rec: &MeasurementRecord) -> Verdict {
        if rec.phase != Phase::Steady || rec.status != RecordStatus::Ok {
            return Verdict::Continue;
        }
        self.steady_seen += 1;

        let violated = rec.latency_s > self.cfg.latency_threshold_s
            || rec.queue_delay_us > self.cfg.queue_threshold_us;
        if !violated {
            return Verdict::Continue;
        }
        self.violations += 1;

        let exhausted = match self.cfg.tolerance {
            ViolationTolerance::Count(n) => self.violations > n,
            ViolationTolerance::Fraction(f) => {
                self.violations as f64 > f * self.steady_seen as f64
            }
        };
        if exhausted {
            Verdict::Stop(Violation {
                sequence_id: rec.sequence_id,
                latency_s: rec.latency_s,
                queue_delay_us: rec.queue_delay_us,
                violations_observed: self.violations,
            })
        } else {
            Verdict::Continue
        }
    }

    pub fn violations_observed(&self) -> u64 {
        self.violations
    }
}
