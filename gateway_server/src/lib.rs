//! `gateway_server` 服务端核心库。
//!
//! 本 Crate 实现了 WebSocket 前端的交互式 SSH 网关：浏览器客户端通过
//! WebSocket 驱动远端主机上的交互式 shell、编排"远端命令 → 服务器间文件
//! 拷贝 → 远端命令"的多步工作流，并实时观察后端主机的可达性。
//!
//! 主要模块包括：
//! - `config`: 管理应用的配置信息加载与校验。
//! - `error`: 定义应用特定的错误类型与协议错误码映射。
//! - `host_registry`: 主机别名与传输配方的只读注册表。
//! - `ssh`: 面向单连接的 SSH 执行器（PTY 流式输出 + SCP 传输）。
//! - `state`: 管理应用级别的共享状态。
//! - `ws_server`: 实现 WebSocket 服务端，处理客户端连接、消息路由、
//!   会话锁、任务注册表与主机健康监视。

pub mod config;
pub mod error;
pub mod host_registry;
pub mod ssh;
pub mod state;
pub mod ws_server;
