// gateway_server/src/state.rs

//! 应用级共享状态。
//!
//! `AppState` 把进程级的各个管理器聚合为一个可克隆共享的依赖包，
//! 由 WebSocket 服务在每个连接的处理任务与消息路由器之间传递，
//! 避免在函数签名里铺陈一长串 `Arc` 参数。

use std::sync::Arc;

use crate::config::GatewaySettings;
use crate::host_registry::HostRegistry;
use crate::ws_server::connection_manager::ConnectionManager;
use crate::ws_server::health_monitor::HealthMonitor;
use crate::ws_server::session_lock::SessionLock;
use crate::ws_server::task_registry::TaskRegistry;

/// 进程级共享状态的聚合。全部成员都是线程安全的共享引用。
pub struct AppState {
    /// 运行期配置（超时、节流参数等）。
    pub settings: Arc<GatewaySettings>,
    /// 活动 WebSocket 连接的管理器。
    pub connection_manager: Arc<ConnectionManager>,
    /// 进程级独占会话锁。
    pub session_lock: Arc<SessionLock>,
    /// 每连接的可取消任务注册表。
    pub task_registry: Arc<TaskRegistry>,
    /// 主机别名与传输配方的只读注册表。
    pub host_registry: Arc<HostRegistry>,
    /// 主机健康监视器。
    pub health_monitor: Arc<HealthMonitor>,
}

impl AppState {
    pub fn new(
        settings: Arc<GatewaySettings>,
        connection_manager: Arc<ConnectionManager>,
        session_lock: Arc<SessionLock>,
        task_registry: Arc<TaskRegistry>,
        host_registry: Arc<HostRegistry>,
        health_monitor: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            settings,
            connection_manager,
            session_lock,
            task_registry,
            host_registry,
            health_monitor,
        }
    }
}
