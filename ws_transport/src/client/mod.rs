// ws_transport/src/client/mod.rs

//! WebSocket 客户端模块。
//!
//! 本模块 (`client`) 及其子模块（如 `transport`）构成了 `ws_transport` 库中
//! 用于实现 WebSocket 客户端功能的核心组件，主要供集成测试与诊断工具
//! 连接网关端点使用。
//!
//! 主要职责包括：
//! - **连接建立**: 连接到远程网关的 WebSocket 端点。
//! - **消息传输**: 发送入站帧（任意可序列化的信封）并接收强类型出站帧。
//! - **传输层抽象**: 封装底层 `tokio-tungstenite` 的细节，
//!   提供一个更简洁、更易于使用的 API 给上层应用。

pub mod transport; // 公开 transport 子模块，其中包含主要的客户端传输层逻辑
