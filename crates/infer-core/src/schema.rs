use serde::{Deserialize, Serialize};

/// 一次 run 的阶段标记:warm_up 记录照常写入产物,但不参与阈值判定与稳态统计。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    WarmUp,
    Steady,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::WarmUp => "warm_up",
            Phase::Steady => "steady",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Ok,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Ok => "ok",
            RecordStatus::Error => "error",
        }
    }
}

/// 发往推理端点的请求体。sequence_id 单调递增,一次 run 内唯一,
/// 是完成侧回查在途表的关联键。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferRequest {
    pub sequence_id: u64,
    pub model_name: String,
    pub model_version: u32,
    pub inputs: Vec<InputTensor>,
}

/// 按模型输入窗口生成的合成张量(定形、f32)。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// 端点的应答体。queue_us 由服务端上报:请求进入服务端到首个处理
/// 阶段之间的排队时间(微秒),与端到端时延是两个不同的量。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferReply {
    pub sequence_id: u64,
    #[serde(default)]
    pub queue_us: u64,
    #[serde(default)]
    pub compute_us: u64,
    /// Some(..) 表示服务端处理失败;该应答仍可按 sequence_id 关联。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A reply correlated back to its request. Consumed exactly once by the
/// recorder; times are seconds relative to run start.
#[derive(Debug, Clone)]
pub struct Completion {
    pub sequence_id: u64,
    pub received_s: f64,
    pub queue_delay_us: u64,
    pub status: RecordStatus,
    pub error_detail: Option<String>,
}

/// One row of the client-stats artifact. Append-only; rows may be written
/// out of sequence order, scheduled_s reconstructs send order afterwards.
#[derive(Debug, Clone)]
pub struct MeasurementRecord {
    pub sequence_id: u64,
    pub scheduled_s: f64,
    pub sent_s: f64,
    pub received_s: f64,
    pub latency_s: f64,
    pub queue_delay_us: u64,
    pub phase: Phase,
    pub status: RecordStatus,
}
