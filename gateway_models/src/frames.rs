// gateway_models/src/frames.rs

//! WebSocket 出入站帧结构定义。
//!
//! 入站方向：客户端发送形如 `{"type": "...", "data": {...}}` 的 JSON 帧。
//! 服务端先将原始文本解析为 [`InboundEnvelope`]（仅提取 `type` 标签与原始
//! `data`），再由消息路由器按 `type` 将 `data` 反序列化为对应的强类型负载
//! （[`SshCommandPayload`] / [`ScpTransferPayload`]）。这种两段式解析使得
//! "JSON 格式非法" 与 "未知消息类型" 可以被区分为两个不同的错误码。
//!
//! 出站方向：所有下行帧统一建模为 [`OutboundFrame`] 枚举，通过
//! `#[serde(tag = "type")]` 内联标签序列化，保证每帧恰好携带一个 `type` 字段。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::health::HealthSnapshot;

/// "start_session" 入站消息的类型常量。
pub const START_SESSION_MESSAGE_TYPE: &str = "start_session";
/// "end_session" 入站消息的类型常量。
pub const END_SESSION_MESSAGE_TYPE: &str = "end_session";
/// "ssh_command" 入站消息的类型常量。
pub const SSH_COMMAND_MESSAGE_TYPE: &str = "ssh_command";
/// "scp_transfer" 入站消息的类型常量。
pub const SCP_TRANSFER_MESSAGE_TYPE: &str = "scp_transfer";

/// 入站帧的外层信封。
///
/// `data` 保留为原始 JSON 值，由路由器根据 `message_type` 二次解析。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InboundEnvelope {
    /// 消息类型标签，决定 `data` 应当如何被解析。
    #[serde(rename = "type")]
    pub message_type: String,
    /// 消息负载。对无负载的消息（如 `start_session`）允许缺省。
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// "ssh_command" 消息的负载：在指定主机上执行一条交互式命令。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SshCommandPayload {
    /// 目标主机别名。
    pub server_name: String,
    /// 要执行的 shell 命令文本。
    pub command: String,
    /// 终止短语：该子串首次出现在已提交输出中时，命令即视为完成。
    pub stop_phrase: String,
}

/// "scp_transfer" 消息的负载：按命名配方执行服务器间文件传输。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScpTransferPayload {
    /// 传输配方名称。
    pub transfer_name: String,
}

/// `welcome` 帧中的锁状态视图。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LockStatusView {
    /// 会话锁当前是否被持有。
    pub locked: bool,
    /// 持有者的连接 ID；锁空闲时为 `null`。
    pub lock_owner: Option<String>,
}

/// `welcome` 帧中的会话状态视图（与 `LockStatusView` 语义一致的另一种投影）。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionStatusView {
    /// 当前是否存在活动会话。
    pub active: bool,
    /// 会话持有者的连接 ID；无活动会话时为 `null`。
    pub owner: Option<String>,
}

/// `error` 帧的错误体。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorBody {
    /// 五位数字错误码，取值见 [`crate::codes`]。
    pub code: u32,
    /// 面向人类的错误描述。
    pub message: String,
    /// 可选的结构化补充信息（例如 `owner=<连接ID>`）。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// 服务端下发的全部 WebSocket 帧。
///
/// 每个变体序列化后恰好携带一个 `type` 字段（蛇形命名），
/// 负载字段与 `type` 平铺在同一层 JSON 对象中。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// 连接建立后下发的第一帧，携带连接 ID 与全量状态快照。
    Welcome {
        /// 服务端为本连接分配的不透明标识符。
        connection_id: String,
        /// 会话锁状态视图。
        lock_status: LockStatusView,
        /// 会话状态视图。
        session_status: SessionStatusView,
        /// 按主机别名索引的健康快照全集。
        server_health: BTreeMap<String, HealthSnapshot>,
    },
    /// 交互式命令 / SCP 传输过程中的一批输出文本。
    Output {
        /// 已提交的输出内容（可能包含多行）。
        data: String,
    },
    /// 任务成功结束的终止帧。
    Complete {
        /// 完成说明。
        message: String,
    },
    /// 任务失败 / 协议错误的终止帧。
    Error {
        /// 恒为 `false`，便于前端统一判别。
        success: bool,
        /// 错误体。
        error: ErrorBody,
    },
    /// 会话锁被某连接获取后的全员广播（对发起者同时充当应答）。
    SessionStarted {
        /// 广播说明文本。
        message: String,
        /// 新持有者的连接 ID。
        session_owner: String,
    },
    /// 会话锁被释放后的全员广播。
    SessionEnded {
        /// 广播说明文本。
        message: String,
    },
    /// 主机健康状态发生迁移时的全员广播。
    ServerHealth {
        /// 主机别名。
        server_name: String,
        /// 迁移后的健康判定。
        is_healthy: bool,
        /// 迁移后的完整快照。
        status: HealthSnapshot,
    },
}

impl OutboundFrame {
    /// 以标准形状构造一个 `error` 帧（`success` 恒为 `false`）。
    pub fn error(body: ErrorBody) -> Self {
        OutboundFrame::Error {
            success: false,
            error: body,
        }
    }
}
