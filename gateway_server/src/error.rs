// gateway_server/src/error.rs

//! 应用的主要错误类型。
//!
//! 这个枚举定义了网关中可能出现的各种错误类型，并负责把每个错误映射到
//! 协议层的五位数字错误码（见 `gateway_models::codes`）以及下发给客户端的
//! `error` 帧错误体。错误按来源分组：SSH/SCP 传输层、WebSocket 协议层、
//! 会话/锁/任务管理层、配置层。

use gateway_models::codes;
use gateway_models::ErrorBody;
use thiserror::Error;

/// 网关核心的统一错误类型。
///
/// 每一种错误类型都包含了相关的错误信息，以便进行调试和错误处理。
/// 凭据绝不允许进入任何变体的文本内容。
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("SSH 连接失败: {0}")]
    SshConnectFailed(String),

    #[error("SSH 连接超时")]
    SshConnectTimeout,

    #[error("SSH 认证失败: {0}")]
    SshAuthFailed(String),

    #[error("SSH 命令执行失败: {0}")]
    SshCommandFailed(String),

    #[error("SSH 尚未连接")]
    NotConnected,

    #[error("SCP 传输失败 (退出码: {exit_code:?})")]
    ScpFailed {
        /// 远端 scp 进程的退出码；传输未走到退出阶段时为 `None`。
        exit_code: Option<u32>,
        /// 输出尾部（PTY 下 stderr 与 stdout 合流，取末尾片段用于诊断）。
        stderr_tail: String,
    },

    #[error("主机健康检查失败: {0}")]
    HealthCheckFailed(String),

    #[error("WebSocket 连接失败: {0}")]
    WsConnectFailed(String),

    #[error("无效的 WebSocket 消息: {0}")]
    WsMessageInvalid(String),

    #[error("未找到消息类型 '{0}' 对应的处理器")]
    WsHandlerNotFound(String),

    #[error("会话锁已被其他连接持有")]
    SessionAlreadyActive {
        /// 当前持有者的连接 ID。
        owner: String,
    },

    #[error("当前没有活动会话")]
    NoActiveSession,

    #[error("会话锁由其他连接持有，调用方不是持有者")]
    NotSessionOwner {
        /// 当前持有者的连接 ID。
        owner: String,
    },

    #[error("资源已被锁定: {0}")]
    ResourceLocked(String),

    #[error("该连接已有一个任务在执行中")]
    TaskAlreadyRunning,

    #[error("该连接当前没有进行中的任务")]
    TaskNotFound,

    #[error("任务在取消等待时限内未终止")]
    TaskCancelTimeout,

    #[error("任务取消失败: {0}")]
    TaskCancelFailed(String),

    #[error("任务清理失败: {0}")]
    TaskCleanupFailed(String),

    #[error("未知的主机别名: '{0}'")]
    UnknownHostAlias(String),

    #[error("未知的传输配方: '{0}'")]
    UnknownTransferRecipe(String),

    #[error("配置错误: {0}")]
    ConfigError(String),
}

impl GatewayError {
    /// 返回本错误对应的协议层数字错误码。
    ///
    /// 配置类错误（未知别名/配方）没有独立的码位，
    /// 映射到触发它们的操作所属的码（命令 22000 / 传输 24000）。
    pub fn code(&self) -> u32 {
        match self {
            GatewayError::SshConnectFailed(_) => codes::SSH_CONNECT_FAILED,
            GatewayError::SshConnectTimeout => codes::SSH_CONNECT_TIMEOUT,
            GatewayError::SshAuthFailed(_) => codes::SSH_AUTH_FAILED,
            GatewayError::SshCommandFailed(_) => codes::SSH_COMMAND_FAILED,
            GatewayError::NotConnected => codes::SSH_CONNECT_FAILED,
            GatewayError::ScpFailed { .. } => codes::SCP_FAILED,
            GatewayError::HealthCheckFailed(_) => codes::HEALTH_CHECK_FAILED,
            GatewayError::WsConnectFailed(_) => codes::WS_CONNECT_FAILED,
            GatewayError::WsMessageInvalid(_) => codes::WS_MESSAGE_INVALID,
            GatewayError::WsHandlerNotFound(_) => codes::WS_HANDLER_NOT_FOUND,
            GatewayError::SessionAlreadyActive { .. } => codes::SESSION_ALREADY_ACTIVE,
            GatewayError::NoActiveSession => codes::NO_ACTIVE_SESSION,
            GatewayError::NotSessionOwner { .. } => codes::NOT_SESSION_OWNER,
            GatewayError::ResourceLocked(_) => codes::RESOURCE_LOCKED,
            GatewayError::TaskAlreadyRunning => codes::TASK_ALREADY_RUNNING,
            GatewayError::TaskNotFound => codes::TASK_NOT_FOUND,
            GatewayError::TaskCancelTimeout => codes::TASK_CANCEL_TIMEOUT,
            GatewayError::TaskCancelFailed(_) => codes::TASK_CANCEL_FAILED,
            GatewayError::TaskCleanupFailed(_) => codes::TASK_CLEANUP_FAILED,
            GatewayError::UnknownHostAlias(_) => codes::SSH_COMMAND_FAILED,
            GatewayError::UnknownTransferRecipe(_) => codes::SCP_FAILED,
            GatewayError::ConfigError(_) => codes::WS_MESSAGE_INVALID,
        }
    }

    /// 构造下发给客户端的 `error` 帧错误体。
    ///
    /// `detail` 仅在存在结构化补充信息时填充（例如锁冲突时的持有者 ID、
    /// SCP 失败时的输出尾部），其余情况省略。
    pub fn to_error_body(&self) -> ErrorBody {
        let detail = match self {
            GatewayError::SessionAlreadyActive { owner } => Some(format!("owner={}", owner)),
            GatewayError::NotSessionOwner { owner } => Some(format!("owner={}", owner)),
            GatewayError::ScpFailed { stderr_tail, .. } if !stderr_tail.is_empty() => {
                Some(stderr_tail.clone())
            }
            GatewayError::UnknownHostAlias(alias) => Some(format!("server_name={}", alias)),
            GatewayError::UnknownTransferRecipe(name) => Some(format!("transfer_name={}", name)),
            _ => None,
        };
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            detail,
        }
    }
}
