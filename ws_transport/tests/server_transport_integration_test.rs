// ws_transport/tests/server_transport_integration_test.rs

//! 服务端传输层集成测试。
//!
//! 启动一个最小化的帧回显服务器，用真实的 TCP + WebSocket 握手验证：
//! - 端点路径校验（非 `/ws/v1/stub` 的握手被拒绝）；
//! - 出站帧的序列化下发与客户端侧的强类型接收；
//! - 入站文本帧的原始接收。

use gateway_models::{InboundEnvelope, OutboundFrame};
use log::{error, info};
use serde_json::json;
use tokio::time::{Duration, timeout};
use ws_transport::WS_ENDPOINT_PATH;
use ws_transport::client::transport::{connect_client, receive_frame};
use ws_transport::server::transport::{receive_text, start_server};

/// 启动一个测试服务器：收到任何合法信封后，把其 `type` 作为 `output` 帧回显，
/// 然后下发一个 `complete` 终止帧。
async fn setup_frame_echo_server(addr: String) -> tokio::task::JoinHandle<()> {
    let handle = tokio::spawn(async move {
        let result = start_server(addr, move |mut handler, mut receiver, client_addr| async move {
            info!("[测试服务端] 新客户端已连接: {}", client_addr);
            loop {
                match receive_text(&mut receiver).await {
                    Some(Ok(raw_text)) => {
                        let envelope: InboundEnvelope = match serde_json::from_str(&raw_text) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                error!("[测试服务端] 信封解析失败: {}", e);
                                break;
                            }
                        };
                        let output = OutboundFrame::Output {
                            data: format!("echo:{}", envelope.message_type),
                        };
                        if let Err(e) = handler.send_frame(&output).await {
                            error!("[测试服务端] 发送 output 帧失败: {}", e);
                            break;
                        }
                        let complete = OutboundFrame::Complete {
                            message: "done".to_string(),
                        };
                        if let Err(e) = handler.send_frame(&complete).await {
                            error!("[测试服务端] 发送 complete 帧失败: {}", e);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("[测试服务端] 接收消息时出错: {}", e);
                        break;
                    }
                    None => {
                        info!("[测试服务端] 连接已关闭或流结束。");
                        break;
                    }
                }
            }
        })
        .await;
        if let Err(e) = result {
            error!("[测试服务端] 服务器异常退出: {}", e);
        }
    });
    // 留出监听器绑定时间
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle
}

#[tokio::test]
async fn test_server_send_receive_typed_frames() {
    let _ = env_logger::builder().is_test(true).try_init();

    let server_bind_addr = "127.0.0.1:19401".to_string();
    let client_connect_url = format!("ws://{}{}", server_bind_addr, WS_ENDPOINT_PATH);

    let server_handle = setup_frame_echo_server(server_bind_addr.clone()).await;

    let mut client_conn = connect_client(client_connect_url.clone())
        .await
        .expect("客户端连接网关端点失败");

    client_conn
        .send_envelope(&json!({"type": "start_session"}))
        .await
        .expect("客户端发送信封失败");

    match timeout(Duration::from_secs(5), receive_frame(&mut client_conn.ws_receiver)).await {
        Ok(Some(Ok(OutboundFrame::Output { data }))) => {
            assert_eq!(data, "echo:start_session");
        }
        other => panic!("[测试客户端] 未收到预期的 output 帧: {:?}", other),
    }

    match timeout(Duration::from_secs(5), receive_frame(&mut client_conn.ws_receiver)).await {
        Ok(Some(Ok(OutboundFrame::Complete { message }))) => {
            assert_eq!(message, "done");
        }
        other => panic!("[测试客户端] 未收到预期的 complete 帧: {:?}", other),
    }

    server_handle.abort();
}

#[tokio::test]
async fn test_server_rejects_unknown_path() {
    let _ = env_logger::builder().is_test(true).try_init();

    let server_bind_addr = "127.0.0.1:19402".to_string();
    let server_handle = setup_frame_echo_server(server_bind_addr.clone()).await;

    // 路径不是网关端点，握手应被 404 拒绝
    let bad_url = format!("ws://{}/ws/v1/unknown", server_bind_addr);
    let result = connect_client(bad_url).await;
    assert!(result.is_err(), "非网关端点的握手应当被拒绝");

    // 正确路径仍然可以连接
    let good_url = format!("ws://{}{}", server_bind_addr, WS_ENDPOINT_PATH);
    let good = connect_client(good_url).await;
    assert!(good.is_ok(), "网关端点握手应当成功");

    server_handle.abort();
}
