//! `gateway_models` crate 提供了在 SSH 网关各个组件之间共享的核心数据结构。
//!
//! 这些模型包括 WebSocket 出入站帧、主机与传输配方的配置模型、
//! 主机健康快照以及协议层统一的数字错误码，
//! 确保了跨 Rust 后端和前端 TypeScript 的数据一致性。
//! 所有共享模型都应实现 `Serialize`, `Deserialize`, `Debug`, `Clone` traits。

pub mod codes;
pub mod frames;
pub mod health;
pub mod hosts;

pub use frames::{
    ErrorBody, InboundEnvelope, LockStatusView, OutboundFrame, ScpTransferPayload,
    SessionStatusView, SshCommandPayload,
    END_SESSION_MESSAGE_TYPE, SCP_TRANSFER_MESSAGE_TYPE, SSH_COMMAND_MESSAGE_TYPE,
    START_SESSION_MESSAGE_TYPE,
};
pub use health::HealthSnapshot;
pub use hosts::{HostConfig, TransferRecipe};
