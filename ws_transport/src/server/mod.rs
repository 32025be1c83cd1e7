// ws_transport/src/server/mod.rs

//! WebSocket 服务端模块。
//!
//! 本模块 (`server`) 及其子模块（例如 `transport`）共同负责提供 `ws_transport`
//! 库中与 WebSocket 服务器端功能相关的组件和逻辑。
//!
//! 主要职责包括：
//! - **服务器启动与监听**: 在指定网络地址和端口上启动 WebSocket 服务器并开始
//!   监听传入连接。
//! - **握手与端点校验**: 处理新的客户端连接请求，完成 WebSocket 握手，
//!   校验请求路径为网关端点 `/ws/v1/stub`，接受任意 Origin（可信网络假设）。
//! - **消息收发**: 为每个成功建立的连接提供出站帧发送句柄与入站文本接收
//!   函数，由上层应用实现具体的消息处理循环。
//!
//! `transport` 子模块包含具体的传输层实现，例如 `start_server` 函数和
//! `ConnectionHandler` 结构体等。

pub mod transport; // 公开 transport 子模块，其中包含了主要的服务器端传输层逻辑和核心功能实现
