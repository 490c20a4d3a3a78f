use std::time::Duration;

use rand::rngs::SmallRng;
use tokio::time::Instant;
use rand::{Rng, SeedableRng};

use crate::config::BenchConfig;
use crate::schema::{InferRequest, InputTensor};

/// A request together with its slot in the pacing schedule.
#[derive(Debug, Clone)]
pub struct ScheduledRequest {
    pub sequence_id: u64,
    pub scheduled_at: Instant,
    pub request: InferRequest,
}

/// Open-loop request source: exactly `num_iterations` requests with
/// `scheduled_at[i] = start + i / rate`, independent of how fast the server
/// answers. Lazy, finite, not restartable. The caller sleeps until
/// `next_scheduled_at` and then takes the request; the generator itself
/// never waits on anything.
pub struct RequestGenerator {
    model_name: String,
    model_version: u32,
    shape: Vec<usize>,
    window_len: usize,
    period_s: f64,
    start: Instant,
    total: u64,
    next_seq: u64,
    seed: u64,
}

impl RequestGenerator {
    pub fn new(cfg: &BenchConfig, start: Instant) -> Self {
        Self {
            model_name: cfg.model_name.clone(),
            model_version: cfg.model_version,
            shape: cfg.input_shape.clone(),
            window_len: cfg.input_shape.iter().product(),
            period_s: 1.0 / cfg.generation_rate,
            start,
            total: cfg.num_iterations,
            next_seq: 0,
            seed: cfg.seed,
        }
    }

    /// Ideal send time of the next request, None once the budget is spent.
    pub fn next_scheduled_at(&self) -> Option<Instant> {
        if self.next_seq >= self.total {
            return None;
        }
        Some(self.start + Duration::from_secs_f64(self.next_seq as f64 * self.period_s))
    }

    pub fn next_request(&mut self) -> Option<ScheduledRequest> {
        let scheduled_at = self.next_scheduled_at()?;
        let sequence_id = self.next_seq;
        self.next_seq += 1;

        // reseed per request so payloads are reproducible across runs
        let mut rng = SmallRng::seed_from_u64(self.seed ^ sequence_id);
        let data: Vec<f32> = (0..self.window_len)
            .map(|_| rng.gen_range(-1.0f32..1.0f32))
            .collect();

        Some(ScheduledRequest {
            sequence_id,
            scheduled_at,
            request: InferRequest {
                sequence_id,
                model_name: self.model_name.clone(),
                model_version: self.model_version,
                inputs: vec![InputTensor {
                    name: "window".to_string(),
                    shape: self.shape.clone(),
                    data,
                }],
            },
        })
    }

    pub fn produced(&self) -> u64 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: f64, total: u64) -> BenchConfig {
        BenchConfig {
            generation_rate: rate,
            num_iterations: total,
            input_shape: vec![2, 4],
            ..BenchConfig::default()
        }
    }

    #[test]
    fn test_schedule_is_open_loop_spacing() {
        let start = Instant::now();
        let mut gen = RequestGenerator::new(&config(10.0, 5), start);
        for i in 0..5 {
            let at = gen.next_scheduled_at().unwrap();
            let expect = i as f64 / 10.0;
            assert!((at.duration_since(start).as_secs_f64() - expect).abs() < 1e-9);
            let req = gen.next_request().unwrap();
            assert_eq!(req.sequence_id, i);
        }
        assert!(gen.next_request().is_none());
        // finite and not restartable
        assert!(gen.next_scheduled_at().is_none());
        assert_eq!(gen.produced(), 5);
    }

    #[test]
    fn test_payload_shape_and_determinism() {
        let start = Instant::now();
        let mut a = RequestGenerator::new(&config(100.0, 2), start);
        let mut b = RequestGenerator::new(&config(100.0, 2), start);

        let ra = a.next_request().unwrap().request;
        let rb = b.next_request().unwrap().request;
        assert_eq!(ra.inputs[0].data.len(), 8);
        assert_eq!(ra.inputs[0].shape, vec![2, 4]);
        assert_eq!(ra.inputs[0].data, rb.inputs[0].data);

        // different sequence ids draw different windows
        let ra2 = a.next_request().unwrap().request;
        assert_ne!(ra.inputs[0].data, ra2.inputs[0].data);
    }
}
