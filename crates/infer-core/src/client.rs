use std::collections::HashMap;

use tokio::time::Instant;
use tracing::warn;

use crate::generator::ScheduledRequest;
use crate::schema::{Completion, InferReply, Phase, RecordStatus};
use crate::transport::{SendRejected, Transport};
use crate::util::since_s;

/// Send metadata held while a request is on the wire.
#[derive(Debug, Clone, Copy)]
pub struct Outstanding {
    pub scheduled_s: f64,
    pub sent_s: f64,
    pub phase: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The transport could not take the request right now; the request is
    /// dropped and the event is counted, never silently swallowed.
    Backpressure,
    /// The transport is gone. Fatal for the run.
    Closed,
}

/// Owns requests from send until their completion arrives (or the run ends
/// with them outstanding). The table is keyed by sequence_id because replies
/// come back in whatever order the server's batching finishes them. An entry
/// is only created once the transport accepts the request, so the table is
/// bounded by the transport's queue capacity.
pub struct InferenceClient<T: Transport> {
    transport: T,
    inflight: HashMap<u64, Outstanding>,
    epoch: Instant,
    spurious: u64,
}

impl<T: Transport> InferenceClient<T> {
    pub fn new(transport: T, epoch: Instant) -> Self {
        Self {
            transport,
            inflight: HashMap::new(),
            epoch,
            spurious: 0,
        }
    }

    /// Non-blocking send. The outstanding entry is created only once the
    /// transport has accepted the request.
    pub fn send(&mut self, sreq: ScheduledRequest, phase: Phase) -> SendOutcome {
        let sequence_id = sreq.sequence_id;
        let scheduled_s = since_s(self.epoch, sreq.scheduled_at);
        let sent_at = Instant::now();
        match self.transport.try_send(sreq.request) {
            Ok(()) => {
                self.inflight.insert(
                    sequence_id,
                    Outstanding {
                        scheduled_s,
                        sent_s: since_s(self.epoch, sent_at),
                        phase,
                    },
                );
                SendOutcome::Sent
            }
            Err(SendRejected::Full) => SendOutcome::Backpressure,
            Err(SendRejected::Closed) => SendOutcome::Closed,
        }
    }

    /// Correlate a reply to its outstanding request. Out-of-order arrival is
    /// the normal case. Unknown or already-resolved sequence ids are dropped
    /// and logged so nothing is ever recorded twice.
    pub fn resolve(
        &mut self,
        reply: InferReply,
        received_at: Instant,
    ) -> Option<(Outstanding, Completion)> {
        let Some(meta) = self.inflight.remove(&reply.sequence_id) else {
            self.spurious += 1;
            warn!(
                sequence_id = reply.sequence_id,
                "dropping completion with no outstanding request"
            );
            return None;
        };
        let status = if reply.error.is_some() {
            RecordStatus::Error
        } else {
            RecordStatus::Ok
        };
        Some((
            meta,
            Completion {
                sequence_id: reply.sequence_id,
                received_s: since_s(self.epoch, received_at),
                queue_delay_us: reply.queue_us,
                status,
                error_detail: reply.error,
            },
        ))
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }

    pub fn spurious_dropped(&self) -> u64 {
        self.spurious
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchConfig;
    use crate::generator::RequestGenerator;

    struct SinkTransport {
        accepted: Vec<u64>,
        reject: Option<SendRejected>,
    }

    impl Transport for SinkTransport {
        fn try_send(
            &mut self,
            req: crate::schema::InferRequest,
        ) -> Result<(), SendRejected> {
            if let Some(r) = self.reject {
                return Err(r);
            }
            self.accepted.push(req.sequence_id);
            Ok(())
        }
    }

    fn reply(sequence_id: u64, queue_us: u64) -> InferReply {
        InferReply {
            sequence_id,
            queue_us,
            compute_us: 0,
            error: None,
        }
    }

    fn client_with(
        reject: Option<SendRejected>,
    ) -> (InferenceClient<SinkTransport>, RequestGenerator, Instant) {
        let epoch = Instant::now();
        let cfg = BenchConfig {
            generation_rate: 1000.0,
            num_iterations: 16,
            input_shape: vec![4],
            ..BenchConfig::default()
        };
        (
            InferenceClient::new(
                SinkTransport {
                    accepted: Vec::new(),
                    reject,
                },
                epoch,
            ),
            RequestGenerator::new(&cfg, epoch),
            epoch,
        )
    }

    #[test]
    fn test_out_of_order_completions_attribute_their_own_request() {
        let (mut client, mut gen, epoch) = client_with(None);
        for _ in 0..6 {
            let sreq = gen.next_request().unwrap();
            assert_eq!(client.send(sreq, Phase::Steady), SendOutcome::Sent);
        }
        assert_eq!(client.outstanding(), 6);

        // 5 answers before 3
        let t5 = epoch + std::time::Duration::from_millis(20);
        let t3 = epoch + std::time::Duration::from_millis(80);
        let (meta5, done5) = client.resolve(reply(5, 100), t5).unwrap();
        let (meta3, done3) = client.resolve(reply(3, 200), t3).unwrap();

        assert_eq!(done5.sequence_id, 5);
        assert_eq!(done3.sequence_id, 3);
        assert!((done5.received_s - 0.020).abs() < 1e-6);
        assert!((done3.received_s - 0.080).abs() < 1e-6);
        // schedule slots belong to the right request (1 kHz -> 1 ms apart)
        assert!((meta5.scheduled_s - 0.005).abs() < 1e-9);
        assert!((meta3.scheduled_s - 0.003).abs() < 1e-9);
        assert_eq!(client.outstanding(), 4);
    }

    #[test]
    fn test_duplicate_and_unknown_completions_are_dropped() {
        let (mut client, mut gen, epoch) = client_with(None);
        let sreq = gen.next_request().unwrap();
        client.send(sreq, Phase::Steady);

        assert!(client.resolve(reply(0, 10), epoch).is_some());
        // duplicate
        assert!(client.resolve(reply(0, 10), epoch).is_none());
        // never sent
        assert!(client.resolve(reply(99, 10), epoch).is_none());
        assert_eq!(client.spurious_dropped(), 2);
    }

    #[test]
    fn test_error_reply_is_addressable_not_fatal() {
        let (mut client, mut gen, epoch) = client_with(None);
        client.send(gen.next_request().unwrap(), Phase::Steady);

        let (_, done) = client
            .resolve(
                InferReply {
                    sequence_id: 0,
                    queue_us: 0,
                    compute_us: 0,
                    error: Some("oom".to_string()),
                },
                epoch,
            )
            .unwrap();
        assert_eq!(done.status, RecordStatus::Error);
        assert_eq!(done.error_detail.as_deref(), Some("oom"));
    }

    #[test]
    fn test_rejected_send_leaves_no_outstanding_entry() {
        let (mut client, mut gen, _) = client_with(Some(SendRejected::Full));
        let out = client.send(gen.next_request().unwrap(), Phase::Steady);
        assert_eq!(out, SendOutcome::Backpressure);
        assert_eq!(client.outstanding(), 0);
    }
}
