use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const CSV_HEADER: &str =
    "elapsed_s,model,count,interval_s,request_us,queue_us,compute_input_us,compute_infer_us,compute_output_us,gpu_utilization";

const STAGES: [&str; 5] = [
    "request",
    "queue",
    "compute_input",
    "compute_infer",
    "compute_output",
];

/// 服务端导出的是累计值;相邻两次抓取做差,除以新增请求数,
/// 得到该区间内每请求的平均耗时。
#[derive(Debug, Default, Clone, Copy)]
struct StageCounter {
    count: f64,
    total_us: f64,
}

impl StageCounter {
    fn update(&mut self, count: f64, total_us: f64) -> Option<f64> {
        let delta = count - self.count;
        if delta <= 0.0 {
            return None;
        }
        let mean = (total_us - self.total_us) / delta;
        self.count = count;
        self.total_us = total_us;
        Some(mean)
    }
}

#[derive(Debug, Clone)]
struct StatRow {
    elapsed_s: f64,
    model: String,
    count: f64,
    interval_s: f64,
    stage_us: [f64; 5],
    gpu_utilization: f64,
}

/// Side telemetry: polls the inference server's Prometheus text endpoint and
/// appends per-model stage averages to `<prefix>_server-stats.csv`. Never
/// part of threshold evaluation; a failed poll is logged and skipped so the
/// client-side measurement stream stays the primary artifact.
pub struct ServerStatsMonitor {
    url: String,
    interval: Duration,
    writer: BufWriter<File>,
    http: reqwest::Client,
    counters: BTreeMap<(String, &'static str), StageCounter>,
    primed: bool,
    started: Instant,
    last_poll: Instant,
}

impl ServerStatsMonitor {
    pub fn create(url: &str, path: &Path, interval: Duration) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("create server-stats artifact {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{CSV_HEADER}").context("write server-stats header")?;
        let now = Instant::now();
        Ok(Self {
            url: url.to_string(),
            interval,
            writer,
            http: reqwest::Client::new(),
            counters: BTreeMap::new(),
            primed: false,
            started: now,
            last_poll: now,
        })
    }

    /// Poll until cancelled, then flush whatever was gathered.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.poll().await {
                        warn!("server metrics poll failed: {e:#}");
                    }
                }
            }
        }
        if let Err(e) = self.writer.flush() {
            warn!("flush server-stats: {e}");
        }
    }

    async fn poll(&mut self) -> anyhow::Result<()> {
        let text = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("get metrics")?
            .error_for_status()
            .context("metrics status")?
            .text()
            .await
            .context("read metrics body")?;

        let now = Instant::now();
        let interval_s = now.duration_since(self.last_poll).as_secs_f64();
        self.last_poll = now;
        let elapsed_s = now.duration_since(self.started).as_secs_f64();

        for row in self.digest(&text, elapsed_s, interval_s) {
            writeln!(
                self.writer,
                "{:.3},{},{:.0},{:.3},{:.1},{:.1},{:.1},{:.1},{:.1},{:.3}",
                row.elapsed_s,
                row.model,
                row.count,
                row.interval_s,
                row.stage_us[0],
                row.stage_us[1],
                row.stage_us[2],
                row.stage_us[3],
                row.stage_us[4],
                row.gpu_utilization,
            )
            .context("append server-stats row")?;
        }
        self.writer.flush().context("flush server-stats")?;
        Ok(())
    }

    // First scrape only primes the counters; rows appear from the second on.
    fn digest(&mut self, text: &str, elapsed_s: f64, interval_s: f64) -> Vec<StatRow> {
        let mut counts: BTreeMap<String, f64> = BTreeMap::new();
        let mut sums: BTreeMap<(String, &'static str), f64> = BTreeMap::new();
        let mut gpu_total = 0.0;
        let mut gpu_n = 0u32;

        for line in text.lines() {
            let Some((name, model, value)) = parse_metric_line(line) else {
                continue;
            };
            if name == "nv_gpu_utilization" {
                gpu_total += value;
                gpu_n += 1;
                continue;
            }
            let Some(model) = model else { continue };
            if name == "nv_inference_request_success" {
                *counts.entry(model.to_string()).or_default() += value;
                continue;
            }
            for stage in STAGES {
                if name == format!("nv_inference_{stage}_duration_us") {
                    *sums.entry((model.to_string(), stage)).or_default() += value;
                    break;
                }
            }
        }

        let gpu_utilization = if gpu_n > 0 {
            gpu_total / gpu_n as f64
        } else {
            0.0
        };

        let mut rows = Vec::new();
        'models: for (model, count) in counts {
            let mut stage_us = [0.0; 5];
            for (i, stage) in STAGES.iter().enumerate() {
                let total_us = sums
                    .get(&(model.clone(), *stage))
                    .copied()
                    .unwrap_or_default();
                let counter = self
                    .counters
                    .entry((model.clone(), *stage))
                    .or_default();
                match counter.update(count, total_us) {
                    Some(mean) => stage_us[i] = mean,
                    // no new requests in this interval, skip the row
                    None => continue 'models,
                }
            }
            rows.push(StatRow {
                elapsed_s,
                model,
                count,
                interval_s,
                stage_us,
                gpu_utilization,
            });
        }
        if !self.primed {
            // the first scrape only sets the baseline
            self.primed = true;
            return Vec::new();
        }
        rows
    }
}

// Prometheus text line: `name{label="..",..} value`, no regex needed.
fn parse_metric_line(line: &str) -> Option<(&str, Option<&str>, f64)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (head, value) = line.rsplit_once(char::is_whitespace)?;
    let value: f64 = value.parse().ok()?;
    let name = &head[..head.find('{').unwrap_or(head.len())];
    let model = head.find("model=\"").and_then(|i| {
        let rest = &head[i + 7..];
        rest.find('"').map(|end| &rest[..end])
    });
    Some((name, model, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scrape(model: &str, count: f64, queue_us: f64) -> String {
        format!(
            concat!(
                "# HELP nv_inference_request_success cumulative successes\n",
                "nv_inference_request_success{{model=\"{m}\",version=\"1\"}} {c}\n",
                "nv_inference_request_duration_us{{model=\"{m}\",version=\"1\"}} {r}\n",
                "nv_inference_queue_duration_us{{model=\"{m}\",version=\"1\"}} {q}\n",
                "nv_inference_compute_input_duration_us{{model=\"{m}\",version=\"1\"}} {q}\n",
                "nv_inference_compute_infer_duration_us{{model=\"{m}\",version=\"1\"}} {q}\n",
                "nv_inference_compute_output_duration_us{{model=\"{m}\",version=\"1\"}} {q}\n",
                "nv_gpu_utilization{{gpu_uuid=\"GPU-0\"}} 0.5\n",
            ),
            m = model,
            c = count,
            r = queue_us * 2.0,
            q = queue_us,
        )
    }

    #[test]
    fn test_parse_metric_line() {
        let (name, model, value) =
            parse_metric_line("nv_inference_queue_duration_us{model=\"gw\",version=\"1\"} 1500")
                .unwrap();
        assert_eq!(name, "nv_inference_queue_duration_us");
        assert_eq!(model, Some("gw"));
        assert_eq!(value, 1500.0);

        assert!(parse_metric_line("# HELP whatever").is_none());
        assert!(parse_metric_line("").is_none());
        let (name, model, _) = parse_metric_line("nv_gpu_utilization{gpu_uuid=\"x\"} 0.9").unwrap();
        assert_eq!(name, "nv_gpu_utilization");
        assert_eq!(model, None);
    }

    #[test]
    fn test_digest_turns_cumulative_sums_into_interval_means() {
        let dir = tempfile::tempdir().unwrap();
        let mut mon = ServerStatsMonitor::create(
            "http://127.0.0.1:8002/metrics",
            &dir.path().join("s.csv"),
            Duration::from_secs(1),
        )
        .unwrap();

        // first scrape primes the counters, no rows yet
        let rows = mon.digest(&scrape("gw", 10.0, 20_000.0), 1.0, 1.0);
        assert!(rows.is_empty());

        // 10 more requests, 30000 more cumulative queue us -> 3000 us mean
        let rows = mon.digest(&scrape("gw", 20.0, 50_000.0), 2.0, 1.0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model, "gw");
        assert!((rows[0].stage_us[1] - 3_000.0).abs() < 1e-6);
        assert!((rows[0].gpu_utilization - 0.5).abs() < 1e-9);

        // idle interval produces no row
        let rows = mon.digest(&scrape("gw", 20.0, 50_000.0), 3.0, 1.0);
        assert!(rows.is_empty());
    }
}
