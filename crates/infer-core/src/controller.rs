use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
pub use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::{InferenceClient, SendOutcome};
use crate::config::{BenchConfig, ThresholdConfig};
use crate::error::{BenchError, Outcome};
use crate::generator::RequestGenerator;
use crate::monitor::{ThresholdMonitor, Verdict, Violation};
use crate::recorder::{MeasurementRecorder, RunSummary};
use crate::schema::{Phase, RecordStatus};
use crate::transport::{Endpoint, HttpTransport, Transport, TransportEvent};

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    WarmUp,
    Steady,
    Shutdown,
}

/// Mutable run bookkeeping. Nothing outside this module mutates it, and the
/// phase only moves through the transition methods below, so the state
/// machine stays auditable.
#[derive(Debug)]
pub struct RunState {
    phase: RunPhase,
    pub requests_sent: u64,
    pub requests_completed: u64,
    pub backpressure_events: u64,
    pub violations_observed: u64,
    terminal_reason: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            phase: RunPhase::Init,
            requests_sent: 0,
            requests_completed: 0,
            backpressure_events: 0,
            violations_observed: 0,
            terminal_reason: None,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn enter_warm_up(&mut self) {
        self.phase = RunPhase::WarmUp;
        info!("entering warm-up phase");
    }

    fn enter_steady(&mut self) {
        self.phase = RunPhase::Steady;
        info!("entering steady phase");
    }

    // reached exactly once per run
    fn enter_shutdown(&mut self, reason: &str) {
        if self.phase == RunPhase::Shutdown {
            return;
        }
        self.phase = RunPhase::Shutdown;
        self.terminal_reason = Some(reason.to_string());
        info!(reason, "entering shutdown");
    }

    pub fn terminal_reason(&self) -> Option<&str> {
        self.terminal_reason.as_deref()
    }
}

/// Everything a caller needs to judge a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: Outcome,
    pub terminal_reason: String,
    pub requests_sent: u64,
    pub requests_completed: u64,
    pub incomplete: u64,
    pub spurious_dropped: u64,
    pub backpressure_events: u64,
    pub violations_observed: u64,
    pub summary: RunSummary,
}

/// Owns the run lifecycle: drives the generator on its open-loop clock,
/// feeds every completion through the recorder and monitor, and is the only
/// authority that acts on a stop signal.
pub struct RunController<T: Transport> {
    cfg: BenchConfig,
    transport: T,
    events: mpsc::Receiver<TransportEvent>,
    recorder: MeasurementRecorder,
    monitor: ThresholdMonitor,
    state: RunState,
    cancel: CancellationToken,
}

impl<T: Transport> RunController<T> {
    /// The transport is already connected; configuration is validated before
    /// the artifact file is created so a bad config leaves nothing behind.
    pub fn new(
        cfg: BenchConfig,
        thresholds: ThresholdConfig,
        transport: T,
        events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, BenchError> {
        cfg.validate(&thresholds)?;
        let recorder = MeasurementRecorder::create(&cfg.client_stats_path(), cfg.flush_every)?;
        info!(
            latency_threshold_s = thresholds.latency_threshold_s,
            queue_threshold_us = thresholds.queue_threshold_us,
            tolerance = ?thresholds.tolerance,
            "thresholds armed"
        );
        Ok(Self {
            cfg,
            transport,
            events,
            recorder,
            monitor: ThresholdMonitor::new(thresholds),
            state: RunState::new(),
            cancel,
        })
    }

    pub async fn run(self) -> Result<RunReport, BenchError> {
        let RunController {
            cfg,
            transport,
            mut events,
            mut recorder,
            mut monitor,
            mut state,
            cancel,
        } = self;

        let start = Instant::now();
        let mut client = InferenceClient::new(transport, start);
        let mut generator = RequestGenerator::new(&cfg, start);

        if cfg.warm_up > 0 {
            state.enter_warm_up();
        } else {
            state.enter_steady();
        }
        info!(
            rate = cfg.generation_rate,
            iterations = cfg.num_iterations,
            warm_up = cfg.warm_up,
            "starting load generation"
        );

        let mut sla: Option<Violation> = None;
        let mut fatal: Option<String> = None;
        let mut interrupted = false;
        let mut last_progress = start;

        // generation and completion handling interleave here; connection
        // workers only ever talk to this loop through the event channel, so
        // the outstanding table has a single writer
        while sla.is_none() && fatal.is_none() && !interrupted {
            let Some(next_at) = generator.next_scheduled_at() else {
                break; // iteration budget exhausted
            };

            tokio::select! {
                _ = tokio::time::sleep_until(next_at) => {
                    let sreq = match generator.next_request() {
                        Some(s) => s,
                        None => continue,
                    };
                    if sreq.sequence_id == cfg.warm_up && state.phase() == RunPhase::WarmUp {
                        state.enter_steady();
                    }
                    let phase = if sreq.sequence_id < cfg.warm_up {
                        Phase::WarmUp
                    } else {
                        Phase::Steady
                    };
                    let sequence_id = sreq.sequence_id;
                    match client.send(sreq, phase) {
                        SendOutcome::Sent => state.requests_sent += 1,
                        SendOutcome::Backpressure => {
                            state.backpressure_events += 1;
                            warn!(sequence_id, "transport queues full, request dropped (backpressure)");
                        }
                        SendOutcome::Closed => {
                            fatal = Some("transport closed while sending".to_string());
                        }
                    }
                    if last_progress.elapsed() >= Duration::from_secs(1) {
                        info!(
                            completed = state.requests_completed,
                            sent = state.requests_sent,
                            total = cfg.num_iterations,
                            inflight = client.outstanding(),
                            "progress"
                        );
                        last_progress = Instant::now();
                    }
                }

                ev = events.recv() => {
                    match on_event(ev, &mut client, &mut recorder, &mut monitor, &mut state)? {
                        EventAction::None => {}
                        EventAction::Stop(v) => sla = Some(v),
                        EventAction::Fatal(d) => fatal = Some(d),
                    }
                }

                _ = cancel.cancelled() => {
                    warn!("external interrupt, stopping generation");
                    interrupted = true;
                }
            }
        }

        // bounded grace period so in-flight requests are not truncated
        // unnecessarily; a broken stream has nothing left to deliver
        if client.outstanding() > 0 && fatal.is_none() {
            info!(
                outstanding = client.outstanding(),
                grace_ms = cfg.grace_ms,
                "draining outstanding completions"
            );
            let deadline = Instant::now() + Duration::from_millis(cfg.grace_ms);
            while client.outstanding() > 0 {
                let ev = tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    ev = events.recv() => ev,
                };
                match on_event(ev, &mut client, &mut recorder, &mut monitor, &mut state)? {
                    EventAction::None => {}
                    EventAction::Stop(v) => {
                        if sla.is_none() {
                            sla = Some(v);
                        }
                    }
                    EventAction::Fatal(d) => {
                        fatal = Some(d);
                        break;
                    }
                }
            }
        }

        let incomplete = client.outstanding() as u64;
        let spurious_dropped = client.spurious_dropped();
        if incomplete > 0 {
            warn!(incomplete, "requests still outstanding at shutdown, counted incomplete");
        }

        let (outcome, reason) = if let Some(detail) = fatal {
            (Outcome::FatalError, detail)
        } else if interrupted {
            (
                Outcome::FatalError,
                "interrupted before the iteration budget completed".to_string(),
            )
        } else if let Some(v) = &sla {
            (
                Outcome::SlaViolated,
                format!(
                    "sla violated at sequence_id {} (latency {:.6}s, queue {}us, violation #{})",
                    v.sequence_id, v.latency_s, v.queue_delay_us, v.violations_observed
                ),
            )
        } else {
            (
                Outcome::Completed,
                format!(
                    "iteration budget of {} exhausted with no violation",
                    cfg.num_iterations
                ),
            )
        };

        state.enter_shutdown(&reason);
        recorder.flush()?;
        // dropping the client tears down the connection workers
        drop(client);

        let summary = recorder.summary();
        info!(
            records = summary.total_records,
            warm_up = summary.warm_up_records,
            steady_ok = summary.steady_ok,
            steady_err = summary.steady_err,
            latency_p50_us = summary.latency_p50_us,
            latency_p95_us = summary.latency_p95_us,
            latency_p99_us = summary.latency_p99_us,
            queue_p99_us = summary.queue_p99_us,
            "run summary"
        );
        match outcome {
            Outcome::Completed => info!(outcome = outcome.as_str(), reason = %reason, "run finished"),
            _ => error!(outcome = outcome.as_str(), reason = %reason, "run finished"),
        }

        Ok(RunReport {
            outcome,
            terminal_reason: reason,
            requests_sent: state.requests_sent,
            requests_completed: state.requests_completed,
            incomplete,
            spurious_dropped,
            backpressure_events: state.backpressure_events,
            violations_observed: monitor.violations_observed(),
            summary,
        })
    }
}

enum EventAction {
    None,
    Stop(Violation),
    Fatal(String),
}

fn on_event<T: Transport>(
    ev: Option<TransportEvent>,
    client: &mut InferenceClient<T>,
    recorder: &mut MeasurementRecorder,
    monitor: &mut ThresholdMonitor,
    state: &mut RunState,
) -> Result<EventAction, BenchError> {
    let Some(ev) = ev else {
        return Ok(EventAction::Fatal("completion channel closed".to_string()));
    };
    match ev {
        TransportEvent::Reply { reply, received_at } => {
            let Some((meta, done)) = client.resolve(reply, received_at) else {
                return Ok(EventAction::None);
            };
            state.requests_completed += 1;
            if done.status == RecordStatus::Error {
                warn!(
                    sequence_id = done.sequence_id,
                    detail = done.error_detail.as_deref().unwrap_or(""),
                    "request failed on the server, recorded and continuing"
                );
            }
            let rec = recorder.record(&meta, &done)?;
            let verdict = monitor.observe(&rec);
            state.violations_observed = monitor.violations_observed();
            match verdict {
                Verdict::Continue => Ok(EventAction::None),
                Verdict::Stop(v) => {
                    error!(
                        sequence_id = v.sequence_id,
                        latency_s = v.latency_s,
                        queue_delay_us = v.queue_delay_us,
                        violations = v.violations_observed,
                        "threshold violated, raising stop"
                    );
                    Ok(EventAction::Stop(v))
                }
            }
        }
        TransportEvent::Down(detail) => Ok(EventAction::Fatal(detail)),
    }
}

/// Validate, connect, run. The one-call entry the CLI uses.
pub async fn run_bench(
    cfg: BenchConfig,
    thresholds: ThresholdConfig,
    cancel: CancellationToken,
) -> Result<RunReport, BenchError> {
    cfg.validate(&thresholds)?;
    let endpoint = Endpoint::parse(&cfg.endpoint, &cfg.model_name, cfg.model_version)?;
    info!(addr = %endpoint.addr, "connecting");
    let (transport, events) =
        HttpTransport::connect(&endpoint, cfg.connections, cfg.conn_queue).await?;
    let controller = RunController::new(cfg, thresholds, transport, events, cancel)?;
    controller.run().await
}
