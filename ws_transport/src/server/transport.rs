// ws_transport/src/server/transport.rs

//! 包含服务端 WebSocket 监听、接受连接和通信逻辑。

use crate::WS_ENDPOINT_PATH;
use crate::error::WsError;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use gateway_models::OutboundFrame;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        Error as TungsteniteError,
        handshake::server::{ErrorResponse, Request, Response},
        http::{HeaderValue, StatusCode},
        protocol::Message,
    },
};

/// 服务端单个连接的发送句柄。
///
/// 每个新的 WebSocket 连接建立后，其写半部被封装为一个 `ConnectionHandler`
/// 并交给上层回调。上层通过 [`ConnectionHandler::send_frame`] 向该连接下发
/// 强类型的出站帧。
pub struct ConnectionHandler {
    ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
}

impl ConnectionHandler {
    /// 向客户端发送一个出站帧。
    ///
    /// 帧先序列化为 JSON 文本，再作为 WebSocket Text 消息发送。
    pub async fn send_frame(&mut self, frame: &OutboundFrame) -> Result<(), WsError> {
        let frame_json = serde_json::to_string(frame)
            .map_err(|e| WsError::SerializationError(e.to_string()))?;
        debug!("服务端发送帧: {}", frame_json);
        self.ws_sender.send(Message::Text(frame_json)).await?;
        Ok(())
    }
}

/// 监听并接受新的 WebSocket 连接。
///
/// # Arguments
/// * `addr` - 服务器绑定的地址字符串，例如 "0.0.0.0:8088"。
/// * `on_new_connection` - 一个回调闭包，当新的 WebSocket 连接建立并成功握手后
///   被异步调用。该闭包接收 `ConnectionHandler` (用于发送帧)、
///   `SplitStream<WebSocketStream<TcpStream>>` (用于接收帧) 以及客户端的真实
///   网络地址 `SocketAddr`。
///   闭包必须是 `FnMut` 因为它可能需要修改其捕获的状态，`Clone` 因为它会在每个
///   新连接的任务中被克隆，`Send` 和 `'static` 因为它会在 `tokio::spawn` 中被使用。
///   闭包返回的 `Future` 也必须是 `Send` 和 `'static`。
///
/// 握手阶段校验请求路径必须为 [`WS_ENDPOINT_PATH`]，其余路径以 404 拒绝；
/// Origin 不做校验（部署于可信网络）。
pub async fn start_server<F, Fut>(addr: String, on_new_connection: F) -> Result<(), WsError>
where
    F: FnMut(ConnectionHandler, SplitStream<WebSocketStream<TcpStream>>, SocketAddr) -> Fut
        + Send
        + Clone
        + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(WsError::IoError)?;
    info!("WebSocket 服务端正在监听地址: {} (端点路径: {})", addr, WS_ENDPOINT_PATH);

    while let Ok((stream, client_addr)) = listener.accept().await {
        info!("新的 TCP 连接来自: {}", client_addr);
        let mut on_new_connection_for_task = on_new_connection.clone();
        tokio::spawn(async move {
            let callback =
                |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                    let path = req.uri().path();
                    info!("[握手回调] 收到来自 {} 的新 WebSocket 握手请求，路径: {}", client_addr, path);
                    if path != WS_ENDPOINT_PATH {
                        warn!("[握手回调] 路径 '{}' 不是网关端点，已拒绝来自 {} 的握手。", path, client_addr);
                        let mut reject = ErrorResponse::new(Some("unknown websocket endpoint".to_string()));
                        *reject.status_mut() = StatusCode::NOT_FOUND;
                        return Err(reject);
                    }
                    // 可信网络假设：接受任意 Origin
                    response
                        .headers_mut()
                        .append("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
                    Ok(response)
                };

            match accept_hdr_async(stream, callback).await {
                Ok(ws_stream) => {
                    info!("WebSocket 连接已建立: {}", client_addr);
                    let (ws_sender, ws_receiver) = ws_stream.split();
                    let handler = ConnectionHandler { ws_sender };
                    (on_new_connection_for_task)(handler, ws_receiver, client_addr).await;
                    info!("与 {} 的连接已关闭", client_addr);
                }
                Err(e) => {
                    error!("与 {} 的 WebSocket 握手失败: {}", client_addr, e);
                }
            }
        });
    }
    Ok(())
}

/// 从 WebSocket 流中接收一条文本帧的原始内容。
///
/// 此函数处理单个消息事件，循环读取应由调用方实现。
/// 返回原始 JSON 文本而非解析结果：入站帧的两段式解析
/// （区分 "JSON 非法" 与 "未知类型"）由上层消息路由器完成。
pub async fn receive_text(
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> Option<Result<String, WsError>> {
    // 内部循环仅用于跳过不产生用户级文本帧的控制帧 (Ping, Pong 等)。
    // 主要的消息处理循环应在调用方实现。
    loop {
        match ws_receiver.next().await {
            Some(msg_result) => match msg_result {
                Ok(msg) => match msg {
                    Message::Text(text) => {
                        debug!("服务端收到文本消息: {}", text);
                        break Some(Ok(text));
                    }
                    Message::Binary(bin) => {
                        debug!("服务端收到二进制消息 ({} 字节)", bin.len());
                        break Some(Err(WsError::Message("收到非预期的二进制消息".to_string())));
                    }
                    Message::Ping(ping_data) => {
                        debug!("服务端收到 Ping: {:?}. 由 tokio-tungstenite 自动处理.", ping_data);
                        // tokio-tungstenite 自动应答 Pong，继续等待下一条实际消息。
                    }
                    Message::Pong(pong_data) => {
                        debug!("服务端收到 Pong: {:?}", pong_data);
                        // Pong 仅用于保活，接收侧无需处理，继续循环。
                    }
                    Message::Close(close_frame) => {
                        debug!("服务端收到 Close 帧: {:?}", close_frame);
                        break None; // 连接正在关闭/已关闭。
                    }
                    Message::Frame(_) => {
                        debug!("收到一个非预期的底层 Frame 类型。正在跳过。");
                    }
                },
                Err(e) => match e {
                    TungsteniteError::ConnectionClosed | TungsteniteError::AlreadyClosed => {
                        debug!("连接被对方关闭 (在 ws_receiver.next() 期间)。");
                        break None;
                    }
                    _ => {
                        error!("从 WebSocket 流接收消息时发生错误: {}", e);
                        break Some(Err(WsError::WebSocketProtocolError(e)));
                    }
                },
            },
            None => {
                debug!("WebSocket 流已结束 (ws_receiver.next() 返回 None)。");
                break None; // 流已结束。
            }
        }
    }
}
