use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 单实例压测配置。一个进程对着一个端点跑一条流水线;
/// 多端点扇出由外部编排层负责,互相之间没有共享状态。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// 端点地址(http://host:port)
    pub endpoint: String,
    pub model_name: String,
    pub model_version: u32,

    /// 目标生成速率(req/s)。open-loop:按固定节奏发,服务端变慢
    /// 也不会反压生成侧,否则观察不到真实排队。
    pub generation_rate: f64,
    /// 总请求数
    pub num_iterations: u64,
    /// 前 warm_up 个请求记录但不参与阈值判定
    pub warm_up: u64,

    /// 模型输入窗口 shape
    pub input_shape: Vec<usize>,
    /// 合成 payload 的种子(按 seed ^ sequence_id 派生,可复现)
    pub seed: u64,

    /// 产物文件名前缀
    pub file_prefix: String,
    /// 每写入多少条记录 flush 一次
    pub flush_every: usize,

    /// 到端点的连接数与每连接请求队列深度
    pub connections: usize,
    pub conn_queue: usize,

    /// shutdown 时等待在途应答的宽限期(ms)
    pub grace_ms: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000".to_string(),
            model_name: "default".to_string(),
            model_version: 1,
            generation_rate: 100.0,
            num_iterations: 10_000,
            warm_up: 0,
            input_shape: vec![1, 8192],
            seed: 42,
            file_prefix: String::new(),
            flush_every: 64,
            connections: 4,
            conn_queue: 8,
            grace_ms: 2_000,
        }
    }
}

impl BenchConfig {
    pub fn validate(&self, thresholds: &ThresholdConfig) -> Result<(), ConfigError> {
        if !(self.generation_rate > 0.0) {
            return Err(ConfigError::InvalidRate(self.generation_rate));
        }
        if self.num_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.warm_up >= self.num_iterations {
            return Err(ConfigError::WarmUpTooLarge {
                warm_up: self.warm_up,
                iterations: self.num_iterations,
            });
        }
        if self.input_shape.is_empty() || self.input_shape.iter().any(|&d| d == 0) {
            return Err(ConfigError::InvalidInputShape);
        }
        if self.connections == 0 || self.conn_queue == 0 {
            return Err(ConfigError::InvalidTransportSizing);
        }
        thresholds.validate()
    }

    pub fn client_stats_path(&self) -> PathBuf {
        self.artifact("client-stats.csv")
    }

    pub fn log_path(&self) -> PathBuf {
        self.artifact("output.log")
    }

    pub fn server_stats_path(&self) -> PathBuf {
        self.artifact("server-stats.csv")
    }

    // 前缀为空 -> 裸文件名;前缀是目录 -> 放进目录;否则加下划线拼接
    fn artifact(&self, name: &str) -> PathBuf {
        if self.file_prefix.is_empty() {
            return PathBuf::from(name);
        }
        let p = Path::new(&self.file_prefix);
        if p.is_dir() {
            p.join(name)
        } else {
            PathBuf::from(format!("{}_{}", self.file_prefix, name))
        }
    }
}

/// 阈值配置,run 开始时装载一次,之后只读。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// 端到端时延上限(秒)
    pub latency_threshold_s: f64,
    /// 服务端排队时延上限(微秒)
    pub queue_threshold_us: u64,
    pub tolerance: ViolationTolerance,
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.latency_threshold_s > 0.0) {
            return Err(ConfigError::InvalidLatencyThreshold(self.latency_threshold_s));
        }
        if self.queue_threshold_us == 0 {
            return Err(ConfigError::InvalidQueueThreshold(self.queue_threshold_us));
        }
        if let ViolationTolerance::Fraction(f) = self.tolerance {
            if !(f > 0.0 && f <= 1.0) {
                return Err(ConfigError::InvalidViolationFraction(f));
            }
        }
        Ok(())
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            latency_threshold_s: 1.0,
            queue_threshold_us: 100_000,
            tolerance: ViolationTolerance::default(),
        }
    }
}

/// 超限容忍策略:压测目的是找 SLA 首次被打破的速率,
/// 默认第一次超限就停,而不是对失败取平均。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationTolerance {
    /// 超过 n 次才停
    Count(u64),
    /// 超限数超过稳态记录数的该比例才停
    Fraction(f64),
}

impl Default for ViolationTolerance {
    fn default() -> Self {
        ViolationTolerance::Count(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = BenchConfig::default();
        assert!(cfg.validate(&ThresholdConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_zero_rate_and_budget() {
        let thresholds = ThresholdConfig::default();
        let mut cfg = BenchConfig::default();
        cfg.generation_rate = 0.0;
        assert!(matches!(
            cfg.validate(&thresholds),
            Err(ConfigError::InvalidRate(_))
        ));

        let mut cfg = BenchConfig::default();
        cfg.num_iterations = 0;
        assert!(matches!(
            cfg.validate(&thresholds),
            Err(ConfigError::ZeroIterations)
        ));
    }

    #[test]
    fn test_warm_up_must_leave_steady_iterations() {
        let mut cfg = BenchConfig::default();
        cfg.num_iterations = 100;
        cfg.warm_up = 100;
        assert!(matches!(
            cfg.validate(&ThresholdConfig::default()),
            Err(ConfigError::WarmUpTooLarge { .. })
        ));
    }

    #[test]
    fn test_threshold_validation() {
        let mut t = ThresholdConfig::default();
        t.queue_threshold_us = 0;
        assert!(t.validate().is_err());

        let mut t = ThresholdConfig::default();
        t.tolerance = ViolationTolerance::Fraction(1.5);
        assert!(t.validate().is_err());

        let mut t = ThresholdConfig::default();
        t.tolerance = ViolationTolerance::Fraction(0.25);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_artifact_prefix_join() {
        let mut cfg = BenchConfig::default();
        assert_eq!(cfg.client_stats_path(), PathBuf::from("client-stats.csv"));

        cfg.file_prefix = "node3".to_string();
        assert_eq!(
            cfg.client_stats_path(),
            PathBuf::from("node3_client-stats.csv")
        );
    }
}
