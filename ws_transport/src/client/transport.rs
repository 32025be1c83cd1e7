// ws_transport/src/client/transport.rs

//! 包含客户端 WebSocket 连接和通信逻辑。

use crate::error::WsError;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use gateway_models::OutboundFrame;
use log::{debug, error, info};
use serde::Serialize;
use tokio_tungstenite::{
    WebSocketStream, connect_async,
    tungstenite::{Error as TungsteniteError, protocol::Message},
};
use url::Url;

/// 客户端侧 WebSocket 流的类型别名（可能经过 TLS 封装）。
pub type ClientWsStream = WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// 客户端 WebSocket 连接的处理器。
///
/// 封装了与网关的单个 WebSocket 连接的发送和接收端。
pub struct ClientConnection {
    /// 用于向服务器发送消息的 Sink 端
    pub ws_sender: SplitSink<ClientWsStream, Message>,
    /// 用于从服务器接收消息的 Stream 端 (需要设为 pub 以便测试和外部使用)
    pub ws_receiver: SplitStream<ClientWsStream>,
}

impl ClientConnection {
    /// 向服务器发送一个入站帧。
    ///
    /// `envelope` 为任意可序列化的值，通常是形如
    /// `{"type": "...", "data": {...}}` 的信封结构。
    pub async fn send_envelope<T: Serialize>(&mut self, envelope: &T) -> Result<(), WsError> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| WsError::SerializationError(e.to_string()))?;
        debug!("客户端发送帧: {}", json);
        self.ws_sender.send(Message::Text(json)).await?;
        Ok(())
    }

    /// 向服务器发送一段原始文本（用于构造故意畸形的帧以测试协议错误处理）。
    pub async fn send_raw_text(&mut self, text: &str) -> Result<(), WsError> {
        debug!("客户端发送原始文本: {}", text);
        self.ws_sender.send(Message::Text(text.to_string())).await?;
        Ok(())
    }
}

/// 连接到指定的 WebSocket 服务器。
///
/// # Arguments
/// * `url_str` - 网关端点的 URL 字符串 (例如 "ws://127.0.0.1:8088/ws/v1/stub")。
///
/// # Returns
/// * `Result<ClientConnection, WsError>` - 如果连接和握手成功，则返回
///   `ClientConnection` 实例，否则返回相应的 `WsError`。
pub async fn connect_client(url_str: String) -> Result<ClientConnection, WsError> {
    info!("客户端：尝试连接到 WebSocket 服务器: {}", url_str);
    let parsed_url = Url::parse(&url_str).map_err(|e| WsError::InvalidUrl(e.to_string()))?;

    match connect_async(parsed_url.as_str()).await {
        Ok((ws_stream, response)) => {
            info!("客户端：成功连接到 {} (HTTP 状态: {})", url_str, response.status());
            debug!("客户端：连接响应头: {:?}", response.headers());
            let (ws_sender, ws_receiver) = ws_stream.split();
            Ok(ClientConnection { ws_sender, ws_receiver })
        }
        Err(e) => {
            error!("客户端：连接到 {} 失败: {}", url_str, e);
            Err(WsError::WebSocketProtocolError(e))
        }
    }
}

/// 从 WebSocket 流中接收并尝试解析一个出站帧。
/// 此函数处理单个消息事件，循环读取应由调用方实现。
pub async fn receive_frame(
    ws_receiver: &mut SplitStream<ClientWsStream>,
) -> Option<Result<OutboundFrame, WsError>> {
    // 内部循环仅用于跳过不产生用户级帧的控制帧 (Ping, Pong 等)。
    loop {
        match ws_receiver.next().await {
            Some(msg_result) => match msg_result {
                Ok(msg) => match msg {
                    Message::Text(text) => {
                        debug!("客户端收到文本消息: {}", text);
                        break Some(
                            serde_json::from_str::<OutboundFrame>(&text)
                                .map_err(|e| WsError::DeserializationError(e.to_string())),
                        );
                    }
                    Message::Binary(bin) => {
                        debug!("客户端收到二进制消息 ({} 字节)", bin.len());
                        break Some(Err(WsError::Message("收到非预期的二进制消息".to_string())));
                    }
                    Message::Ping(ping_data) => {
                        debug!("客户端收到 Ping: {:?}. 由 tokio-tungstenite 自动处理.", ping_data);
                    }
                    Message::Pong(pong_data) => {
                        debug!("客户端收到 Pong: {:?}", pong_data);
                    }
                    Message::Close(close_frame) => {
                        debug!("客户端收到 Close 帧: {:?}", close_frame);
                        break None;
                    }
                    Message::Frame(_) => {
                        debug!("客户端收到一个非预期的底层 Frame 类型。正在跳过。");
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
                break None;
            }
        }
    }
}
