// gateway_server/src/ws_server/mod.rs

//! WebSocket 服务端的各个协作组件。
//!
//! - `client_session`: 单个客户端连接的会话状态。
//! - `connection_manager`: 活动连接的跟踪与全员广播。
//! - `health_monitor`: 主机可达性的后台监视与迁移通知。
//! - `message_router`: 入站帧的解析与类型分发。
//! - `service`: WebSocket 服务主体（接入、欢迎帧、收发循环、断连拆除）。
//! - `session_lock`: 进程级独占会话锁。
//! - `task_registry`: 每连接的可取消任务注册表。

pub mod client_session;
pub mod connection_manager;
pub mod health_monitor;
pub mod message_router;
pub mod service;
pub mod session_lock;
pub mod task_registry;
