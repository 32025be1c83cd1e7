// gateway_server/src/ws_server/service.rs

//! WebSocket 服务端核心服务模块。
//!
//! 本模块的核心是 `WsService` 结构体及其 `start` 方法。`WsService` 负责：
//! - 使用 `ws_transport` 库的功能启动底层 WebSocket 服务器，在配置的地址
//!   上监听网关端点。
//! - 为每一个成功建立的客户端连接执行定制的回调逻辑。
//!
//! 针对每个新连接，回调会：
//! 1. **会话创建**: 调用 `ConnectionManager::add_client` 铸造连接 ID 并注册
//!    `ClientSession`。
//! 2. **欢迎帧**: 在派生任何并发任务之前直接写出 `welcome` 帧（连接 ID +
//!    会话锁快照 + 全量主机健康快照），保证它是本连接的第一帧。
//! 3. **双任务并发处理**: 派生发送任务（内部 MPSC 队列 → 物理连接，
//!    周期性检查逻辑关闭标志），随后在当前任务内运行接收与分发循环
//!    （带 1 秒接收超时，以便同样周期性地检查关闭标志）。
//! 4. **断连拆除**: 无论接收循环因何退出，按固定顺序执行四步拆除 ——
//!    取消在途任务（5 秒时限）、条件释放会话锁并广播、关闭 SSH 执行器、
//!    从连接管理器注销。每一步失败只记录日志，不阻止后续步骤。

use crate::config::WebSocketConfig;
use crate::state::AppState;
use crate::ws_server::message_router;
use anyhow::{Context, Result};
use futures_util::stream::SplitStream;
use gateway_models::OutboundFrame;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use ws_transport::error::WsError;
use ws_transport::server::transport::{receive_text, start_server, ConnectionHandler};

/// 每连接出站帧队列的深度。队列的有界性是输出节流的一部分：
/// 队列满时任务输出的 `send` 产生背压，远端读取随之放缓。
const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// `WsService` 封装了运行 WebSocket 服务所需的配置与共享状态。
pub struct WsService {
    /// WebSocket 服务的监听配置。
    config: WebSocketConfig,
    /// 进程级共享状态（连接管理器、会话锁、任务注册表、注册表、健康监视器）。
    state: Arc<AppState>,
}

impl WsService {
    pub fn new(config: WebSocketConfig, state: Arc<AppState>) -> Self {
        info!("[WebSocket服务层] 正在创建并初始化一个新的 WsService 实例...");
        Self { config, state }
    }

    /// 异步启动 WebSocket 服务端并开始监听连接。
    ///
    /// 成功启动后此方法通常不会返回；返回 `Err` 表示监听器无法建立
    /// （端口被占用等）或服务器发生不可恢复的错误。
    pub async fn start(&self) -> Result<(), anyhow::Error> {
        info!(
            "[WebSocket服务层] WebSocket 服务正在启动。监听主机地址 '{}', 端口号 {}",
            self.config.host, self.config.port
        );

        let on_new_connection_cb = {
            let state_for_cb = Arc::clone(&self.state);
            move |ws_conn_handler: ConnectionHandler,
                  ws_receiver: SplitStream<WebSocketStream<TcpStream>>,
                  client_addr: SocketAddr| {
                let state = Arc::clone(&state_for_cb);
                handle_connection(state, ws_conn_handler, ws_receiver, client_addr)
            }
        };

        start_server(
            format!("{}:{}", self.config.host, self.config.port),
            on_new_connection_cb,
        )
        .await
        .with_context(|| {
            format!(
                "[WebSocket服务层] 尝试启动 WebSocket 服务并使其监听于地址 '{}:{}' 的操作失败",
                self.config.host, self.config.port
            )
        })
    }
}

/// 单个客户端连接的完整生命周期：接入 → 欢迎帧 → 收发循环 → 断连拆除。
async fn handle_connection(
    state: Arc<AppState>,
    mut ws_conn_handler: ConnectionHandler,
    mut ws_receiver: SplitStream<WebSocketStream<TcpStream>>,
    client_addr: SocketAddr,
) {
    // 内部帧队列：路由器 / 任务 / 广播 → 本连接的发送任务
    let (tx_to_client_session, mut rx_from_client_session) =
        mpsc::channel::<OutboundFrame>(OUTBOUND_QUEUE_DEPTH);
    let close_handle = Arc::new(AtomicBool::new(false));

    let client_session = state
        .connection_manager
        .add_client(client_addr, tx_to_client_session, Arc::clone(&close_handle))
        .await;
    let connection_id = client_session.connection_id;

    // --- 欢迎帧：必须是本连接收到的第一帧 ---
    // 在发送任务派生之前直接写出；此刻通过内部队列进来的任何广播
    // 都只会排在它之后。
    let lock_snapshot = state.session_lock.snapshot();
    let server_health = state.health_monitor.snapshot_all().await;
    let welcome = OutboundFrame::Welcome {
        connection_id: connection_id.to_string(),
        lock_status: lock_snapshot.lock_status_view(),
        session_status: lock_snapshot.session_status_view(),
        server_health,
    };
    if let Err(e) = ws_conn_handler.send_frame(&welcome).await {
        error!(
            "[WebSocket服务层] 向新客户端 {} (地址: {}) 发送 welcome 帧失败: {}。连接按失败处理。",
            connection_id, client_addr, e
        );
        state.connection_manager.remove_client(&connection_id).await;
        return;
    }
    info!(
        "[WebSocket服务层] 已向客户端 {} (地址: {}) 发送 welcome 帧。",
        connection_id, client_addr
    );

    // --- 发送任务：内部帧队列 → 物理连接 ---
    let close_for_sender = Arc::clone(&close_handle);
    let sender_task_join_handle = tokio::spawn(async move {
        info!("[WebSocket服务层-发送任务 {}] 发送任务已启动。", connection_id);
        loop {
            if close_for_sender.load(Ordering::SeqCst) {
                info!(
                    "[WebSocket服务层-发送任务 {}] 检测到逻辑关闭信号，发送任务即将终止。",
                    connection_id
                );
                break;
            }
            tokio::select! {
                biased;
                // 周期性唤醒以检查关闭标志
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    continue;
                }
                maybe_frame = rx_from_client_session.recv() => {
                    match maybe_frame {
                        Some(frame) => {
                            if ws_conn_handler.send_frame(&frame).await.is_err() {
                                // WebSocket 写失败视为断连：触发拆除流程
                                error!(
                                    "[WebSocket服务层-发送任务 {}] 向客户端写帧失败，底层连接已损坏。按断连处理。",
                                    connection_id
                                );
                                close_for_sender.store(true, Ordering::SeqCst);
                                break;
                            }
                        }
                        None => {
                            info!(
                                "[WebSocket服务层-发送任务 {}] 内部帧队列已关闭，发送任务即将终止。",
                                connection_id
                            );
                            break;
                        }
                    }
                }
            }
        }
        info!("[WebSocket服务层-发送任务 {}] 发送任务执行完毕。", connection_id);
    });

    // --- 接收与分发循环 ---
    info!(
        "[WebSocket服务层-接收循环 {}] 接收与处理循环已启动。",
        connection_id
    );
    loop {
        if close_handle.load(Ordering::SeqCst) {
            info!(
                "[WebSocket服务层-接收循环 {}] 检测到逻辑关闭信号，接收循环即将终止。",
                connection_id
            );
            break;
        }

        // 带 1 秒超时的接收，保证关闭标志被周期性检查。
        // `receive_text` 的 future 需要 Box::pin 以满足 select! 的 Unpin 约束。
        let mut receive_fut = Box::pin(receive_text(&mut ws_receiver));
        let received = tokio::select! {
            biased;
            res = &mut receive_fut => Some(res),
            _ = tokio::time::sleep(Duration::from_secs(1)) => None,
        };

        match received {
            Some(Some(Ok(raw_text))) => {
                if let Err(e) = message_router::handle_message(
                    Arc::clone(&client_session),
                    raw_text,
                    Arc::clone(&state),
                )
                .await
                {
                    // 路由器内部消化协议错误；走到这里说明出现了更严重的问题，
                    // 记录后继续处理后续消息
                    error!(
                        "[WebSocket服务层-接收循环 {}] 消息路由器报告未处理的错误: {}。接收循环继续。",
                        connection_id, e
                    );
                }
            }
            Some(Some(Err(ws_err))) => match ws_err {
                WsError::Message(detail) => {
                    // 非文本帧等可恢复的消息级错误：记录并继续
                    warn!(
                        "[WebSocket服务层-接收循环 {}] 收到无法处理的消息: {}。已忽略。",
                        connection_id, detail
                    );
                }
                other => {
                    warn!(
                        "[WebSocket服务层-接收循环 {}] 接收时发生协议级错误: {}。接收循环即将终止。",
                        connection_id, other
                    );
                    close_handle.store(true, Ordering::SeqCst);
                    break;
                }
            },
            Some(None) => {
                info!(
                    "[WebSocket服务层-接收循环 {}] 连接已被对端关闭。",
                    connection_id
                );
                close_handle.store(true, Ordering::SeqCst);
                break;
            }
            None => {
                // 1 秒接收超时不是错误，继续下一轮并重新检查关闭标志
                debug!(
                    "[WebSocket服务层-接收循环 {}] 接收等待超时 (1秒)，继续监听。",
                    connection_id
                );
            }
        }
    }

    // --- 断连拆除：四个步骤按序执行，单步失败不阻止后续步骤 ---
    info!(
        "[WebSocket服务层-连接处理 {}] 接收循环已结束，开始执行断连拆除流程。",
        connection_id
    );

    // 步骤 1: 取消仍在运行的任务
    match state
        .task_registry
        .cancel(&connection_id, state.settings.ssh.cancel_deadline())
        .await
    {
        Ok(()) => {
            info!("[WebSocket服务层-连接处理 {}] 拆除步骤 1: 在途任务已取消。", connection_id);
        }
        Err(crate::error::GatewayError::TaskNotFound) => {
            debug!("[WebSocket服务层-连接处理 {}] 拆除步骤 1: 无在途任务。", connection_id);
        }
        Err(e) => {
            error!(
                "[WebSocket服务层-连接处理 {}] 拆除步骤 1 失败 (任务取消): {}。继续后续步骤。",
                connection_id, e
            );
        }
    }

    // 步骤 2: 仅当本连接持有会话锁时释放，并向其余连接广播
    if state.session_lock.is_owned_by(connection_id) {
        match state.session_lock.release(connection_id) {
            Ok(()) => {
                info!(
                    "[WebSocket服务层-连接处理 {}] 拆除步骤 2: 会话锁已随断连释放，正在广播。",
                    connection_id
                );
                let frame = OutboundFrame::SessionEnded {
                    message: "会话因连接断开而结束".to_string(),
                };
                state
                    .connection_manager
                    .broadcast_frame_except(&frame, Some(&connection_id));
            }
            Err(e) => {
                error!(
                    "[WebSocket服务层-连接处理 {}] 拆除步骤 2 失败 (锁释放): {}。继续后续步骤。",
                    connection_id, e
                );
            }
        }
    } else {
        debug!(
            "[WebSocket服务层-连接处理 {}] 拆除步骤 2: 本连接不持有会话锁，无需释放。",
            connection_id
        );
    }

    // 步骤 3: 关闭 SSH 执行器
    match client_session.ssh_runner.try_lock() {
        Ok(mut runner) => {
            runner.close().await;
            info!("[WebSocket服务层-连接处理 {}] 拆除步骤 3: SSH 执行器已关闭。", connection_id);
        }
        Err(_) => {
            // 执行器仍被未能按时终止的任务持有；其传输随任务一并废弃
            warn!(
                "[WebSocket服务层-连接处理 {}] 拆除步骤 3: SSH 执行器仍被在途任务持有，跳过显式关闭。",
                connection_id
            );
        }
    }

    // 步骤 4: 从连接管理器注销（同时退出所有广播的受众），并等待发送任务收尾
    close_handle.store(true, Ordering::SeqCst);
    state.connection_manager.remove_client(&connection_id).await;
    if let Err(e) = sender_task_join_handle.await {
        error!(
            "[WebSocket服务层-连接处理 {}] 等待发送任务结束时发生错误 (任务可能已 panic): {:?}",
            connection_id, e
        );
    }
    info!(
        "[WebSocket服务层-连接处理 {}] 断连拆除流程执行完毕，连接 ID 不再复用。",
        connection_id
    );
}
