use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use hdrhistogram::Histogram;

use crate::client::Outstanding;
use crate::schema::{Completion, MeasurementRecord, Phase, RecordStatus};
use crate::util::s_to_us;

const CSV_HEADER: &str =
    "sequence_id,scheduled_time,sent_time,receive_time,end_to_end_latency_s,queue_delay_us,phase,status";

/// Append-only measurement log. Every correlated completion becomes exactly
/// one row in `<prefix>_client-stats.csv`; rows already flushed are never
/// rewritten. Warm-up rows are written with their phase marker but stay out
/// of the steady-phase summary histograms.
pub struct MeasurementRecorder {
    writer: BufWriter<File>,
    records: Vec<MeasurementRecord>,
    unflushed: usize,
    flush_every: usize,

    lat_us: Histogram<u64>,
    queue_us: Histogram<u64>,
    steady_ok: u64,
    steady_err: u64,
    warm_up_records: u64,
}

impl MeasurementRecorder {
    pub fn create(path: &Path, flush_every: usize) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("create client-stats artifact {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{CSV_HEADER}").context("write client-stats header")?;
        Ok(Self {
            writer,
            records: Vec::new(),
            unflushed: 0,
            flush_every: flush_every.max(1),
            lat_us: Histogram::new_with_bounds(1, 3_600_000_000, 3)
                .context("latency histogram")?,
            queue_us: Histogram::new_with_bounds(1, 3_600_000_000, 3)
                .context("queue histogram")?,
            steady_ok: 0,
            steady_err: 0,
            warm_up_records: 0,
        })
    }

    /// Build the record for a completion and append it.
    pub fn record(
        &mut self,
        meta: &Outstanding,
        done: &Completion,
    ) -> anyhow::Result<MeasurementRecord> {
        let rec = MeasurementRecord {
            sequence_id: done.sequence_id,
            scheduled_s: meta.scheduled_s,
            sent_s: meta.sent_s,
            received_s: done.received_s,
            latency_s: done.received_s - meta.sent_s,
            queue_delay_us: done.queue_delay_us,
            phase: meta.phase,
            status: done.status,
        };
        self.append(&rec)?;
        Ok(rec)
    }

    fn append(&mut self, rec: &MeasurementRecord) -> anyhow::Result<()> {
        writeln!(
            self.writer,
            "{},{:.6},{:.6},{:.6},{:.6},{},{},{}",
            rec.sequence_id,
            rec.scheduled_s,
            rec.sent_s,
            rec.received_s,
            rec.latency_s,
            rec.queue_delay_us,
            rec.phase.as_str(),
            rec.status.as_str()
        )
        .context("append client-stats row")?;

        match (rec.phase, rec.status) {
            (Phase::WarmUp, _) => self.warm_up_records += 1,
            (Phase::Steady, RecordStatus::Ok) => {
                self.steady_ok += 1;
                let _ = self.lat_us.record(s_to_us(rec.latency_s).max(1));
                let _ = self.queue_us.record(rec.queue_delay_us.max(1));
            }
            // failed requests are counted apart from the latency statistics
            (Phase::Steady, RecordStatus::Error) => self.steady_err += 1,
        }

        self.records.push(rec.clone());
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush().context("flush client-stats")?;
        self.unflushed = 0;
        Ok(())
    }

    pub fn records(&self) -> &[MeasurementRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            total_records: self.records.len() as u64,
            warm_up_records: self.warm_up_records,
            steady_ok: self.steady_ok,
            steady_err: self.steady_err,
            latency_p50_us: hist_q(&self.lat_us, 0.50),
            latency_p95_us: hist_q(&self.lat_us, 0.95),
            latency_p99_us: hist_q(&self.lat_us, 0.99),
            queue_p99_us: hist_q(&self.queue_us, 0.99),
        }
    }
}

/// Steady-phase rollup logged at the end of a run. Warm-up rows and failed
/// requests are excluded so the percentiles describe steady behavior only.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total_records: u64,
    pub warm_up_records: u64,
    pub steady_ok: u64,
    pub steady_err: u64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,
    pub queue_p99_us: u64,
}

fn hist_q(hist: &Histogram<u64>, q: f64) -> u64 {
    if hist.len() == 0 {
        0
    } else {
        hist.value_at_quantile(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(phase: Phase, sent_s: f64) -> Outstanding {
        Outstanding {
            scheduled_s: sent_s,
            sent_s,
            phase,
        }
    }

    fn done(sequence_id: u64, received_s: f64, queue_delay_us: u64) -> Completion {
        Completion {
            sequence_id,
            received_s,
            queue_delay_us,
            status: RecordStatus::Ok,
            error_detail: None,
        }
    }

    #[test]
    fn test_rows_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client-stats.csv");
        let mut rec = MeasurementRecorder::create(&path, 2).unwrap();

        rec.record(&meta(Phase::WarmUp, 0.0), &done(0, 0.050, 1000))
            .unwrap();
        rec.record(&meta(Phase::Steady, 0.1), &done(1, 0.150, 2000))
            .unwrap();
        rec.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("0,"));
        assert!(lines[1].ends_with(",warm_up,ok"));
        assert!(lines[2].ends_with(",steady,ok"));
    }

    #[test]
    fn test_warm_up_and_errors_stay_out_of_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec =
            MeasurementRecorder::create(&dir.path().join("c.csv"), 64).unwrap();

        // warm-up spike that must not contaminate the steady percentiles
        rec.record(&meta(Phase::WarmUp, 0.0), &done(0, 5.0, 900_000))
            .unwrap();
        rec.record(&meta(Phase::Steady, 0.1), &done(1, 0.2, 1000))
            .unwrap();
        rec.record(
            &meta(Phase::Steady, 0.2),
            &Completion {
                sequence_id: 2,
                received_s: 0.3,
                queue_delay_us: 0,
                status: RecordStatus::Error,
                error_detail: Some("boom".to_string()),
            },
        )
        .unwrap();

        let s = rec.summary();
        assert_eq!(s.total_records, 3);
        assert_eq!(s.warm_up_records, 1);
        assert_eq!(s.steady_ok, 1);
        assert_eq!(s.steady_err, 1);
        // only the 100 ms steady sample is in the histogram
        assert!(s.latency_p99_us < 200_000);
        assert!(s.queue_p99_us < 2_000);
    }
}
