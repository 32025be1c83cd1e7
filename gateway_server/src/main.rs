use gateway_server::config;
use gateway_server::host_registry::HostRegistry;
use gateway_server::state::AppState;
use gateway_server::ws_server::connection_manager::ConnectionManager;
use gateway_server::ws_server::health_monitor::HealthMonitor;
use gateway_server::ws_server::service::WsService;
use gateway_server::ws_server::session_lock::SessionLock;
use gateway_server::ws_server::task_registry::TaskRegistry;
use gateway_models::OutboundFrame;
use log::{error, info, warn, LevelFilter};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // 初始化日志记录器
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .format_timestamp_millis()
        .init();
    info!("[主程序] 日志系统已成功初始化 (env_logger)，默认级别: Info。");

    // 加载并校验配置；任何无效值都使启动失败
    if let Err(e) = config::init_config() {
        error!("[主程序] 致命错误：网关配置加载失败: {}。进程退出。", e);
        std::process::exit(1);
    }
    let settings = Arc::new(config::get_config().clone());

    // 构建主机/配方注册表
    let host_registry = match HostRegistry::from_settings(&settings) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("[主程序] 致命错误：主机注册表构建失败: {}。进程退出。", e);
            std::process::exit(1);
        }
    };

    // 创建会话锁与任务注册表
    let session_lock = Arc::new(SessionLock::new());
    let task_registry = Arc::new(TaskRegistry::new());
    info!("[主程序] 会话锁 (SessionLock) 与任务注册表 (TaskRegistry) 已创建。");

    // 创建连接管理器
    let connection_manager = Arc::new(ConnectionManager::new());
    info!("[主程序] WebSocket 连接管理器 (ConnectionManager) 已创建。");

    // 创建健康监视器并派生后台探测循环
    let health_monitor = Arc::new(HealthMonitor::new(&host_registry, settings.health.clone()));
    {
        let monitor_for_task = Arc::clone(&health_monitor);
        tokio::spawn(async move {
            info!("[主程序] 正在启动主机健康监视器 (HealthMonitor) 后台任务...");
            monitor_for_task.run().await;
            warn!("[主程序] 警告：主机健康监视器任务已结束。");
        });
    }

    // 健康迁移 → server_health 帧的全员广播转发器
    {
        let mut health_rx = health_monitor.subscribe();
        let manager_for_task = Arc::clone(&connection_manager);
        tokio::spawn(async move {
            info!("[主程序] 健康广播转发任务已启动。");
            loop {
                match health_rx.recv().await {
                    Ok(snapshot) => {
                        let frame = OutboundFrame::ServerHealth {
                            server_name: snapshot.server_name.clone(),
                            is_healthy: snapshot.is_healthy,
                            status: snapshot,
                        };
                        manager_for_task.broadcast_frame(&frame);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("[主程序] 健康广播转发任务滞后，丢失了 {} 条迁移通知。", missed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!("[主程序] 健康迁移通道已关闭，广播转发任务退出。");
                        break;
                    }
                }
            }
        });
    }

    // 汇聚共享状态并启动 WebSocket 服务
    let app_state = Arc::new(AppState::new(
        Arc::clone(&settings),
        connection_manager,
        session_lock,
        task_registry,
        host_registry,
        Arc::clone(&health_monitor),
    ));
    let ws_service = WsService::new(settings.websocket.clone(), app_state);

    info!("[主程序] 正在启动 WebSocket 服务...");
    if let Err(e) = ws_service.start().await {
        error!("[主程序] 致命错误：启动 WebSocket 服务时发生严重问题: {}", e);
    }

    // 服务退出路径：停掉健康监视器，不再产生任何迁移通知
    health_monitor.shutdown();
}
