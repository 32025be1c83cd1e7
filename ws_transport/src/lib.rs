//! `ws_transport` - SSH 网关的 WebSocket 传输层工具库。
//!
//! 本 crate 为网关服务端与（测试用）客户端提供一个相对轻量级的 WebSocket
//! 传输层抽象，使上层可以专注于会话编排与消息路由逻辑，
//! 而不必关心底层的 WebSocket 协议细节和握手管理。
//!
//! 主要特性与模块：
//! - **服务端传输层 (`server` 模块)**: 在指定地址上监听，完成 WebSocket 握手
//!   （校验端点路径 [`WS_ENDPOINT_PATH`]，接受任意 Origin），并为每个新连接
//!   执行上层提供的回调。发送侧通过 [`server::transport::ConnectionHandler`]
//!   下发强类型的 [`gateway_models::OutboundFrame`]；接收侧通过
//!   [`server::transport::receive_text`] 逐帧取出原始文本，由上层的消息
//!   路由器负责解析（这样 "JSON 非法" 与 "未知类型" 可以区分处理）。
//! - **客户端传输层 (`client` 模块)**: 连接到网关端点、发送入站帧并接收
//!   强类型出站帧，主要供集成测试与诊断工具使用。
//! - **错误处理 (`error` 模块)**: 统一的 [`error::WsError`] 错误类型。
//!
//! 注意：本库只关注传输层；业务消息的路由、会话与任务管理由
//! `gateway_server` 负责。

pub mod client; // 包含 WebSocket 客户端连接和通信逻辑
pub mod error; // 定义库中使用的各种错误类型
pub mod server; // 包含 WebSocket 服务器监听、连接管理和消息分发逻辑

/// 网关对外暴露的唯一 WebSocket 端点路径。
/// 握手阶段校验请求路径与此常量一致，其余路径一律拒绝。
pub const WS_ENDPOINT_PATH: &str = "/ws/v1/stub";
