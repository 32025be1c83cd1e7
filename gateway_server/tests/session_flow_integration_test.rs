// gateway_server/tests/session_flow_integration_test.rs

//! 会话流程集成测试。
//!
//! 启动完整的网关服务（真实 TCP + WebSocket 握手 + 消息路由 + 会话锁 +
//! 任务注册表），用两个并发客户端验证端到端行为：
//! - 欢迎帧先行且携带锁状态快照；
//! - 会话锁的获取 / 冲突 / 释放与全员广播；
//! - 未持锁连接的门控拒绝；
//! - 未知主机别名与不可达主机的任务错误终止帧；
//! - 连接断开后的自动锁释放与广播。

use std::sync::Arc;
use std::time::Duration;

use gateway_models::{codes, OutboundFrame};
use gateway_server::config::{GatewaySettings, SshConfig, WebSocketConfig};
use gateway_server::host_registry::HostRegistry;
use gateway_server::state::AppState;
use gateway_server::ws_server::connection_manager::ConnectionManager;
use gateway_server::ws_server::health_monitor::HealthMonitor;
use gateway_server::ws_server::service::WsService;
use gateway_server::ws_server::session_lock::SessionLock;
use gateway_server::ws_server::task_registry::TaskRegistry;
use gateway_models::HostConfig;
use serde_json::json;
use tokio::time::timeout;
use ws_transport::client::transport::{connect_client, receive_frame, ClientConnection};
use ws_transport::WS_ENDPOINT_PATH;

const TEST_PORT: u16 = 19501;

/// 构建测试配置：一台指向本机保留端口（连接被拒绝）的主机，短超时。
fn test_settings() -> GatewaySettings {
    GatewaySettings {
        websocket: WebSocketConfig {
            host: "127.0.0.1".to_string(),
            port: TEST_PORT,
        },
        hosts: vec![HostConfig {
            alias: "mdwap1p".to_string(),
            host: "127.0.0.1".to_string(),
            // 端口 1 几乎必然连接被拒，使 ssh_command 快速走到错误终止帧
            port: 1,
            username: "batch".to_string(),
            password: "pw".to_string(),
        }],
        transfers: vec![],
        ssh: SshConfig {
            connect_timeout_seconds: 2,
            command_timeout_seconds: 5,
            cancel_deadline_seconds: 5,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 启动网关服务并等待监听器就绪。
async fn spawn_gateway() -> Arc<AppState> {
    let settings = Arc::new(test_settings());
    let host_registry = Arc::new(HostRegistry::from_settings(&settings).unwrap());
    let health_monitor = Arc::new(HealthMonitor::new(&host_registry, settings.health.clone()));
    let app_state = Arc::new(AppState::new(
        Arc::clone(&settings),
        Arc::new(ConnectionManager::new()),
        Arc::new(SessionLock::new()),
        Arc::new(TaskRegistry::new()),
        host_registry,
        health_monitor,
    ));
    let state_for_service = Arc::clone(&app_state);
    let ws_config = settings.websocket.clone();
    tokio::spawn(async move {
        let service = WsService::new(ws_config, state_for_service);
        let _ = service.start().await;
    });
    tokio::time::sleep(Duration::from_millis(250)).await;
    app_state
}

/// 接收下一帧（带超时）。
async fn next_frame(conn: &mut ClientConnection) -> OutboundFrame {
    timeout(Duration::from_secs(10), receive_frame(&mut conn.ws_receiver))
        .await
        .expect("等待下一帧超时")
        .expect("连接被意外关闭")
        .expect("帧解析失败")
}

fn endpoint_url() -> String {
    format!("ws://127.0.0.1:{}{}", TEST_PORT, WS_ENDPOINT_PATH)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_lifecycle_gating_and_broadcasts() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _state = spawn_gateway().await;

    // --- 客户端 A 接入：第一帧必须是 welcome，且锁空闲 ---
    let mut client_a = connect_client(endpoint_url()).await.expect("客户端 A 连接失败");
    let a_id = match next_frame(&mut client_a).await {
        OutboundFrame::Welcome {
            connection_id,
            lock_status,
            session_status,
            ..
        } => {
            assert!(!lock_status.locked);
            assert!(lock_status.lock_owner.is_none());
            assert!(!session_status.active);
            connection_id
        }
        other => panic!("A 的第一帧应为 welcome，实际: {:?}", other),
    };

    // --- A 获取会话锁 ---
    client_a
        .send_envelope(&json!({"type": "start_session"}))
        .await
        .unwrap();
    match next_frame(&mut client_a).await {
        OutboundFrame::SessionStarted { session_owner, .. } => {
            assert_eq!(session_owner, a_id);
        }
        other => panic!("预期 session_started，实际: {:?}", other),
    }

    // --- 客户端 B 接入：welcome 反映锁已被 A 持有 ---
    let mut client_b = connect_client(endpoint_url()).await.expect("客户端 B 连接失败");
    match next_frame(&mut client_b).await {
        OutboundFrame::Welcome { lock_status, .. } => {
            assert!(lock_status.locked);
            assert_eq!(lock_status.lock_owner.as_deref(), Some(a_id.as_str()));
        }
        other => panic!("B 的第一帧应为 welcome，实际: {:?}", other),
    }

    // --- B 抢锁被拒：50004，detail 携带持有者 ---
    client_b
        .send_envelope(&json!({"type": "start_session"}))
        .await
        .unwrap();
    match next_frame(&mut client_b).await {
        OutboundFrame::Error { success, error } => {
            assert!(!success);
            assert_eq!(error.code, codes::SESSION_ALREADY_ACTIVE);
            assert!(error.detail.unwrap().contains(&a_id));
        }
        other => panic!("预期 50004 错误帧，实际: {:?}", other),
    }

    // --- B 未持锁执行门控操作被拒：50006 ---
    client_b
        .send_envelope(&json!({
            "type": "ssh_command",
            "data": {"server_name": "mdwap1p", "command": "ls", "stop_phrase": "PROMPT>"}
        }))
        .await
        .unwrap();
    match next_frame(&mut client_b).await {
        OutboundFrame::Error { error, .. } => {
            assert_eq!(error.code, codes::NOT_SESSION_OWNER);
        }
        other => panic!("预期 50006 错误帧，实际: {:?}", other),
    }

    // --- A 使用未知别名：映射到命令失败码 ---
    client_a
        .send_envelope(&json!({
            "type": "ssh_command",
            "data": {"server_name": "wdexgm1p", "command": "ls", "stop_phrase": "PROMPT>"}
        }))
        .await
        .unwrap();
    match next_frame(&mut client_a).await {
        OutboundFrame::Error { error, .. } => {
            assert_eq!(error.code, codes::SSH_COMMAND_FAILED);
            assert!(error.detail.unwrap().contains("wdexgm1p"));
        }
        other => panic!("预期未知别名错误帧，实际: {:?}", other),
    }

    // --- A 对不可达主机执行命令：任务以连接类错误终止，连接保持打开 ---
    client_a
        .send_envelope(&json!({
            "type": "ssh_command",
            "data": {"server_name": "mdwap1p", "command": "ls", "stop_phrase": "PROMPT>"}
        }))
        .await
        .unwrap();
    match next_frame(&mut client_a).await {
        OutboundFrame::Error { error, .. } => {
            assert!(
                error.code == codes::SSH_CONNECT_FAILED
                    || error.code == codes::SSH_CONNECT_TIMEOUT,
                "实际错误码: {}",
                error.code
            );
        }
        other => panic!("预期 SSH 连接错误帧，实际: {:?}", other),
    }

    // --- A 结束会话：A 收到应答，B 收到广播 ---
    client_a
        .send_envelope(&json!({"type": "end_session"}))
        .await
        .unwrap();
    assert!(matches!(
        next_frame(&mut client_a).await,
        OutboundFrame::SessionEnded { .. }
    ));
    assert!(matches!(
        next_frame(&mut client_b).await,
        OutboundFrame::SessionEnded { .. }
    ));

    // --- 未知消息类型：32000，连接不关闭 ---
    client_a
        .send_envelope(&json!({"type": "reboot_world"}))
        .await
        .unwrap();
    match next_frame(&mut client_a).await {
        OutboundFrame::Error { error, .. } => {
            assert_eq!(error.code, codes::WS_HANDLER_NOT_FOUND);
        }
        other => panic!("预期 32000 错误帧，实际: {:?}", other),
    }

    // --- 畸形 JSON：31000，连接不关闭 ---
    client_a.send_raw_text("this is not json").await.unwrap();
    match next_frame(&mut client_a).await {
        OutboundFrame::Error { error, .. } => {
            assert_eq!(error.code, codes::WS_MESSAGE_INVALID);
        }
        other => panic!("预期 31000 错误帧，实际: {:?}", other),
    }

    // --- A 重新持锁后直接断开：锁必须自动释放并广播给 B ---
    client_a
        .send_envelope(&json!({"type": "start_session"}))
        .await
        .unwrap();
    assert!(matches!(
        next_frame(&mut client_a).await,
        OutboundFrame::SessionStarted { .. }
    ));
    // B 也会观察到这次锁获取的广播
    assert!(matches!(
        next_frame(&mut client_b).await,
        OutboundFrame::SessionStarted { .. }
    ));

    drop(client_a);

    // 断连拆除会释放锁并向剩余连接广播 session_ended
    assert!(matches!(
        next_frame(&mut client_b).await,
        OutboundFrame::SessionEnded { .. }
    ));

    // --- 新客户端 C 看到的锁状态为空闲，且无任何残留任务 ---
    let mut client_c = connect_client(endpoint_url()).await.expect("客户端 C 连接失败");
    match next_frame(&mut client_c).await {
        OutboundFrame::Welcome { lock_status, .. } => {
            assert!(!lock_status.locked);
            assert!(lock_status.lock_owner.is_none());
        }
        other => panic!("C 的第一帧应为 welcome，实际: {:?}", other),
    }
}
