// gateway_models/src/health.rs

//! 主机健康状态的对外快照模型。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单个主机在某一时刻的健康状态快照。
///
/// 该结构体既嵌入在 `welcome` 帧的 `server_health` 映射中，
/// 也作为 `server_health` 广播帧的 `status` 字段整体下发。
/// `last_checked` 序列化为 ISO-8601 (RFC 3339) 字符串。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    /// 主机别名。
    pub server_name: String,
    /// 主机地址。
    pub host: String,
    /// 当前是否判定为健康。带滞回去抖，见健康监视器的阈值配置。
    pub is_healthy: bool,
    /// 最近一次探测完成的时刻 (UTC)。
    pub last_checked: DateTime<Utc>,
    /// 连续失败的探测次数，成功一次即清零。
    pub consecutive_failures: u32,
    /// 连续成功的探测次数，失败一次即清零。
    pub consecutive_successes: u32,
}
