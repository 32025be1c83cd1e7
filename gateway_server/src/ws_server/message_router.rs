// gateway_server/src/ws_server/message_router.rs

//! WebSocket 消息路由器模块。
//!
//! 本模块的核心功能是异步处理从已连接的 WebSocket 客户端接收到的各类消息。
//! 它扮演着服务端消息处理的中央分发枢纽角色：
//! - **两段式解析**: 先把原始文本解析为 `InboundEnvelope`（仅提取 `type`
//!   标签与原始 `data`）。文本不是合法 JSON 时回复错误码 31000
//!   (`ws-message-invalid`)；`type` 不对应任何处理器时回复 32000
//!   (`ws-handler-not-found`)。两类错误都不关闭连接，分发循环继续。
//! - **类型匹配与分发**: 根据 `type` 将消息路由到相应的处理分支：
//!   `start_session` / `end_session` 直接操作会话锁并广播；
//!   `ssh_command` / `scp_transfer` 是受门控的有状态操作，要求调用方持有
//!   会话锁，并经由任务注册表以独立子任务执行，使分发循环始终能接收
//!   `end_session` 等控制消息。
//! - **终止帧保证**: 每个任务恰好以一帧 `complete` 或一帧 `error` 结束，
//!   任务的全部 `output` 帧先于其终止帧；任务出错只终止任务本身，
//!   连接保持打开，客户端可以重试。

use std::sync::Arc;

use anyhow::Result;
use gateway_models::codes;
use gateway_models::{
    ErrorBody, InboundEnvelope, OutboundFrame, ScpTransferPayload, SshCommandPayload,
    END_SESSION_MESSAGE_TYPE, SCP_TRANSFER_MESSAGE_TYPE, SSH_COMMAND_MESSAGE_TYPE,
    START_SESSION_MESSAGE_TYPE,
};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::ssh::{OutputSink, StreamOutcome, StreamTuning};
use crate::state::AppState;
use crate::ws_server::client_session::ClientSession;

/// 异步处理从特定客户端接收到的单条原始文本帧。
///
/// 此函数由 `WsService` 在其每连接的接收循环中调用。协议层错误
/// （JSON 非法、未知类型、负载缺失或格式错误）在此统一转换为 `error` 帧
/// 回复给客户端，并返回 `Ok(())` 以保持分发循环继续运行；返回 `Err`
/// 的情况应当非常罕见，表示出现了无法内部消化的严重问题。
pub async fn handle_message(
    client_session: Arc<ClientSession>,
    raw_text: String,
    state: Arc<AppState>,
) -> Result<(), anyhow::Error> {
    debug!(
        "[消息路由] 客户端 {} (地址: {})：收到原始帧: '{}'",
        client_session.connection_id, client_session.addr, raw_text
    );

    // 第一段解析：信封。文本不是合法 JSON → 31000，连接不关闭。
    let envelope: InboundEnvelope = match serde_json::from_str(&raw_text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(
                "[消息路由] 客户端 {} (地址: {})：入站帧不是合法的消息信封: {}",
                client_session.connection_id, client_session.addr, e
            );
            send_error(&client_session, &GatewayError::WsMessageInvalid(e.to_string())).await;
            return Ok(());
        }
    };

    info!(
        "[消息路由] 客户端 {} (地址: {})：接收到类型为 '{}' 的消息。",
        client_session.connection_id, client_session.addr, envelope.message_type
    );

    match envelope.message_type.as_str() {
        START_SESSION_MESSAGE_TYPE => {
            handle_start_session(&client_session, &state).await;
        }
        END_SESSION_MESSAGE_TYPE => {
            handle_end_session(&client_session, &state).await;
        }
        SSH_COMMAND_MESSAGE_TYPE => match parse_payload::<SshCommandPayload>(envelope.data) {
            Ok(payload) => handle_ssh_command(&client_session, payload, &state).await,
            Err(e) => {
                warn!(
                    "[消息路由] 客户端 {}：ssh_command 负载解析失败: {}",
                    client_session.connection_id, e
                );
                send_error(&client_session, &e).await;
            }
        },
        SCP_TRANSFER_MESSAGE_TYPE => match parse_payload::<ScpTransferPayload>(envelope.data) {
            Ok(payload) => handle_scp_transfer(&client_session, payload, &state).await,
            Err(e) => {
                warn!(
                    "[消息路由] 客户端 {}：scp_transfer 负载解析失败: {}",
                    client_session.connection_id, e
                );
                send_error(&client_session, &e).await;
            }
        },
        unknown_type => {
            // 未知类型 → 32000，连接不关闭
            warn!(
                "[消息路由] 客户端 {} (地址: {})：消息类型 '{}' 未注册任何处理器。",
                client_session.connection_id, client_session.addr, unknown_type
            );
            send_error(
                &client_session,
                &GatewayError::WsHandlerNotFound(unknown_type.to_string()),
            )
            .await;
        }
    }
    Ok(())
}

/// 第二段解析：把信封的 `data` 反序列化为具体负载。
/// 缺失或格式错误都归入 31000 (`ws-message-invalid`)。
fn parse_payload<T: DeserializeOwned>(
    data: Option<serde_json::Value>,
) -> Result<T, GatewayError> {
    let value = data.ok_or_else(|| {
        GatewayError::WsMessageInvalid("缺少必需的 data 负载".to_string())
    })?;
    serde_json::from_value(value)
        .map_err(|e| GatewayError::WsMessageInvalid(format!("data 负载格式无效: {}", e)))
}

/// 处理 `start_session`：尝试获取会话锁，成功则向全体连接广播。
async fn handle_start_session(client_session: &Arc<ClientSession>, state: &Arc<AppState>) {
    let connection_id = client_session.connection_id;
    match state.session_lock.acquire(connection_id) {
        Ok(()) => {
            let frame = OutboundFrame::SessionStarted {
                message: "会话已开始".to_string(),
                session_owner: connection_id.to_string(),
            };
            // 对发起者可靠送达（应答即广播），其余连接尽力而为
            if let Err(e) = client_session.send_frame(frame.clone()).await {
                error!(
                    "[消息路由] 向客户端 {} 发送 session_started 应答失败: {}",
                    connection_id, e
                );
            }
            state
                .connection_manager
                .broadcast_frame_except(&frame, Some(&connection_id));
        }
        Err(e) => {
            info!(
                "[消息路由] 客户端 {} 获取会话锁被拒绝: {}",
                connection_id, e
            );
            send_error(client_session, &e).await;
        }
    }
}

/// 处理 `end_session`：取消本连接仍在运行的任务，释放会话锁并广播。
///
/// 取消与释放是两个独立的步骤：任务在取消时限内未终止时回复
/// `task-cancel-timeout`，但锁仍然被释放 —— 会话的结束不应被僵尸任务阻塞。
async fn handle_end_session(client_session: &Arc<ClientSession>, state: &Arc<AppState>) {
    let connection_id = client_session.connection_id;

    // 前置校验：必须是当前锁持有者
    if let Err(e) = state.session_lock.require(connection_id) {
        send_error(client_session, &e).await;
        return;
    }

    // 步骤 1: 取消仍在运行的任务（若有）。任务的终止帧（error{cancelled}）
    // 由任务自身在终止前写入发送队列，因此先于随后的 session_ended。
    match state
        .task_registry
        .cancel(&connection_id, state.settings.ssh.cancel_deadline())
        .await
    {
        Ok(()) => {
            info!("[消息路由] 客户端 {} 的在途任务已随 end_session 取消。", connection_id);
        }
        Err(GatewayError::TaskNotFound) => {
            debug!("[消息路由] 客户端 {} 没有在途任务，无需取消。", connection_id);
        }
        Err(e) => {
            warn!(
                "[消息路由] 客户端 {} 的任务在 end_session 中取消失败: {}",
                connection_id, e
            );
            send_error(client_session, &e).await;
        }
    }

    // 步骤 2: 释放锁并广播。无论取消结果如何都执行。
    match state.session_lock.release(connection_id) {
        Ok(()) => {
            let frame = OutboundFrame::SessionEnded {
                message: "会话已结束".to_string(),
            };
            if let Err(e) = client_session.send_frame(frame.clone()).await {
                error!(
                    "[消息路由] 向客户端 {} 发送 session_ended 应答失败: {}",
                    connection_id, e
                );
            }
            state
                .connection_manager
                .broadcast_frame_except(&frame, Some(&connection_id));
        }
        Err(e) => {
            send_error(client_session, &e).await;
        }
    }
}

/// 处理 `ssh_command`：门控校验、解析主机别名，然后经任务注册表启动
/// "连接 → 交互式执行 → 关闭" 的子任务。
async fn handle_ssh_command(
    client_session: &Arc<ClientSession>,
    payload: SshCommandPayload,
    state: &Arc<AppState>,
) {
    let connection_id = client_session.connection_id;

    if let Err(e) = state.session_lock.require(connection_id) {
        send_error(client_session, &e).await;
        return;
    }
    let host = match state.host_registry.resolve_host(&payload.server_name) {
        Ok(host) => host.clone(),
        Err(e) => {
            warn!(
                "[消息路由] 客户端 {} 请求的主机别名 '{}' 无法解析。",
                connection_id, payload.server_name
            );
            send_error(client_session, &e).await;
            return;
        }
    };

    let session_for_task = Arc::clone(client_session);
    let state_for_task = Arc::clone(state);
    let start_result = state.task_registry.start(connection_id, move |token| async move {
        let sink = OutputSink::new(
            connection_id,
            session_for_task.sender.clone(),
            token.clone(),
        );
        let outcome = run_ssh_command_task(
            &session_for_task,
            &host,
            &payload,
            &state_for_task,
            &sink,
            &token,
        )
        .await;
        emit_terminal_frame(
            &session_for_task,
            outcome,
            "Command execution completed",
            ErrorBody {
                code: codes::SSH_COMMAND_FAILED,
                message: "命令已被取消".to_string(),
                detail: None,
            },
        )
        .await;
        if let Err(e) = state_for_task.task_registry.cleanup(&connection_id) {
            // 句柄已被取消流程注销属正常时序
            debug!("[消息路由] 客户端 {} 的任务收尾清理: {}", connection_id, e);
        }
    });

    if let Err(e) = start_result {
        send_error(client_session, &e).await;
    }
}

/// `ssh_command` 子任务主体：连接目标主机、流式执行命令、关闭传输。
async fn run_ssh_command_task(
    session: &Arc<ClientSession>,
    host: &gateway_models::HostConfig,
    payload: &SshCommandPayload,
    state: &Arc<AppState>,
    sink: &OutputSink,
    token: &CancellationToken,
) -> Result<StreamOutcome, GatewayError> {
    let mut runner = session.ssh_runner.lock().await;

    // 连接阶段同样受取消令牌约束，避免 end_session 被连接超时拖住
    let connect_result = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(StreamOutcome::Cancelled),
        res = runner.connect(host, state.settings.ssh.connect_timeout()) => res,
    };
    connect_result?;

    let tuning = StreamTuning::interactive(&state.settings.ssh);
    let result = runner
        .run_interactive(&payload.command, &payload.stop_phrase, sink, token, &tuning)
        .await;
    runner.close().await;
    result
}

/// 处理 `scp_transfer`：门控校验、解析配方与两端主机，然后经任务注册表
/// 启动 "连接源主机 → 驱动拷贝 → 关闭" 的子任务。
async fn handle_scp_transfer(
    client_session: &Arc<ClientSession>,
    payload: ScpTransferPayload,
    state: &Arc<AppState>,
) {
    let connection_id = client_session.connection_id;

    if let Err(e) = state.session_lock.require(connection_id) {
        send_error(client_session, &e).await;
        return;
    }
    let (recipe, source_host, dest_host) = {
        let recipe = match state.host_registry.resolve_transfer(&payload.transfer_name) {
            Ok(recipe) => recipe.clone(),
            Err(e) => {
                warn!(
                    "[消息路由] 客户端 {} 请求的传输配方 '{}' 无法解析。",
                    connection_id, payload.transfer_name
                );
                send_error(client_session, &e).await;
                return;
            }
        };
        // 配方的两端别名在配置加载阶段已校验可解析
        let source_host = match state.host_registry.resolve_host(&recipe.source_alias) {
            Ok(host) => host.clone(),
            Err(e) => {
                send_error(client_session, &e).await;
                return;
            }
        };
        let dest_host = match state.host_registry.resolve_host(&recipe.dest_alias) {
            Ok(host) => host.clone(),
            Err(e) => {
                send_error(client_session, &e).await;
                return;
            }
        };
        (recipe, source_host, dest_host)
    };

    let session_for_task = Arc::clone(client_session);
    let state_for_task = Arc::clone(state);
    let start_result = state.task_registry.start(connection_id, move |token| async move {
        let sink = OutputSink::new(
            connection_id,
            session_for_task.sender.clone(),
            token.clone(),
        );
        let outcome = run_scp_transfer_task(
            &session_for_task,
            &recipe,
            &source_host,
            &dest_host,
            &state_for_task,
            &sink,
            &token,
        )
        .await;
        emit_terminal_frame(
            &session_for_task,
            outcome,
            "Transfer completed",
            ErrorBody {
                code: codes::SCP_FAILED,
                message: "传输已被取消".to_string(),
                detail: None,
            },
        )
        .await;
        if let Err(e) = state_for_task.task_registry.cleanup(&connection_id) {
            debug!("[消息路由] 客户端 {} 的任务收尾清理: {}", connection_id, e);
        }
    });

    if let Err(e) = start_result {
        send_error(client_session, &e).await;
    }
}

/// `scp_transfer` 子任务主体：连接配方的源主机并由其驱动拷贝。
async fn run_scp_transfer_task(
    session: &Arc<ClientSession>,
    recipe: &gateway_models::TransferRecipe,
    source_host: &gateway_models::HostConfig,
    dest_host: &gateway_models::HostConfig,
    state: &Arc<AppState>,
    sink: &OutputSink,
    token: &CancellationToken,
) -> Result<StreamOutcome, GatewayError> {
    let mut runner = session.ssh_runner.lock().await;

    let connect_result = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(StreamOutcome::Cancelled),
        res = runner.connect(source_host, state.settings.ssh.connect_timeout()) => res,
    };
    connect_result?;

    let tuning = StreamTuning::transfer(&state.settings.ssh);
    let result = runner
        .scp_transfer(recipe, dest_host, sink, token, &tuning)
        .await;
    runner.close().await;
    result
}

/// 发出任务的终止帧：`complete`、取消对应的 `error`、或失败对应的 `error`。
///
/// 任务的输出帧全部经由同一条发送队列，因此终止帧天然排在其后。
async fn emit_terminal_frame(
    session: &Arc<ClientSession>,
    outcome: Result<StreamOutcome, GatewayError>,
    complete_message: &str,
    cancelled_body: ErrorBody,
) {
    let frame = match outcome {
        Ok(StreamOutcome::Completed) => OutboundFrame::Complete {
            message: complete_message.to_string(),
        },
        Ok(StreamOutcome::Cancelled) => OutboundFrame::error(cancelled_body),
        Err(e) => {
            warn!(
                "[消息路由] 客户端 {} 的任务以错误终止: {}",
                session.connection_id, e
            );
            OutboundFrame::error(e.to_error_body())
        }
    };
    if let Err(e) = session.send_frame(frame).await {
        error!(
            "[消息路由] 向客户端 {} 发送任务终止帧失败: {}。连接可能已断开。",
            session.connection_id, e
        );
    }
}

/// 辅助函数：把领域错误转换为 `error` 帧并发送给指定客户端。
///
/// 发送失败通常意味着客户端已断开连接，此时仅记录错误，
/// 不进一步传播，以保持消息处理的健壮性。
async fn send_error(client_session: &Arc<ClientSession>, err: &GatewayError) {
    let frame = OutboundFrame::error(err.to_error_body());
    if let Err(e) = client_session.sender.send(frame).await {
        error!(
            "[消息路由] 向客户端 {} (地址: {}) 发送错误帧失败: {}。错误响应未能送达。",
            client_session.connection_id, client_session.addr, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_missing_data_is_invalid_message() {
        let result = parse_payload::<SshCommandPayload>(None);
        match result {
            Err(e) => assert_eq!(e.code(), codes::WS_MESSAGE_INVALID),
            Ok(_) => panic!("缺少 data 时应报 ws-message-invalid"),
        }
    }

    #[test]
    fn test_parse_payload_wrong_shape_is_invalid_message() {
        let value = serde_json::json!({"server_name": "mdwap1p"});
        let result = parse_payload::<SshCommandPayload>(Some(value));
        match result {
            Err(e) => assert_eq!(e.code(), codes::WS_MESSAGE_INVALID),
            Ok(_) => panic!("字段缺失时应报 ws-message-invalid"),
        }
    }

    #[test]
    fn test_parse_payload_accepts_well_formed_data() {
        let value = serde_json::json!({
            "server_name": "mdwap1p",
            "command": "ls",
            "stop_phrase": "PROMPT>"
        });
        let payload = parse_payload::<SshCommandPayload>(Some(value)).unwrap();
        assert_eq!(payload.command, "ls");
    }
}
