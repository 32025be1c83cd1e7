// gateway_server/src/ws_server/client_session.rs

use chrono::{DateTime, Utc};
use gateway_models::OutboundFrame;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::ssh::SshRunner;

/// 代表一个已连接到网关的 WebSocket 客户端的会话状态及相关句柄。
///
/// 每个成功建立的 WebSocket 连接都会在服务端对应一个 `ClientSession` 实例。
/// 此结构体封装了连接的不透明标识符（进程生命周期内不复用）、网络信息、
/// 出站帧发送通道、连接关闭标志，以及本连接独占的 SSH 执行器。
///
/// 会话锁的持有关系与任务句柄不在此结构体内：它们分别由进程级的
/// `SessionLock` 与 `TaskRegistry` 以连接 ID 为键管理。
pub struct ClientSession {
    /// 由服务端在此会话成功创建时生成的、全局唯一的连接标识符 (UUID 版本 4)。
    /// 此 ID 用于在整个系统中唯一地识别这个客户端连接，且在进程生命周期内不复用。
    pub connection_id: Uuid,

    /// Tokio MPSC (多生产者单消费者) 通道的发送端 (`Sender`)。
    /// 此 `sender` 专门用于异步地向这个特定的客户端发送 `OutboundFrame`。
    /// 消息路由器、任务输出 sink 与广播逻辑都通过它把帧推入内部队列，
    /// 连接的专属发送任务从队列中取出并实际写入 WebSocket。
    pub sender: mpsc::Sender<OutboundFrame>,

    /// 客户端 WebSocket 连接的源网络地址，包含其 IP 地址和端口号。
    pub addr: SocketAddr,

    /// 此客户端会话在服务端被成功创建的时间戳 (UTC)。
    pub creation_time: DateTime<Utc>,

    /// 一个原子布尔标志，用于从外部向处理此连接的 I/O 任务发出信号，
    /// 指示其应优雅地终止并关闭底层的 WebSocket 连接。
    ///
    /// - 当值为 `true` 时，表示连接应当被关闭。
    /// - 当值为 `false` (默认值) 时，表示连接可以继续保持。
    pub connection_should_close: Arc<AtomicBool>,

    /// 本连接独占的 SSH 执行器。
    /// 任务注册表保证同一时刻至多一个任务在使用它；断连拆除流程
    /// 通过 `try_lock` 访问它以关闭残留的传输。
    pub ssh_runner: Arc<Mutex<SshRunner>>,
}

impl ClientSession {
    /// 创建一个新的 `ClientSession` 实例。
    ///
    /// 在 WebSocket 握手成功后调用，为新接受的客户端连接初始化会话对象：
    /// 生成唯一的 `connection_id`、记录创建时间、并为该连接建立专属的
    /// SSH 执行器。
    pub fn new(
        addr: SocketAddr,
        sender: mpsc::Sender<OutboundFrame>,
        connection_should_close: Arc<AtomicBool>,
    ) -> Self {
        let connection_id = Uuid::new_v4();
        Self {
            connection_id,
            sender,
            addr,
            creation_time: Utc::now(),
            connection_should_close,
            ssh_runner: Arc::new(Mutex::new(SshRunner::new(connection_id))),
        }
    }

    /// 把一帧推入本连接的发送队列。
    ///
    /// 返回 `Err` 表示发送任务已退出（连接已断开或正在拆除），
    /// 调用方通常只需记录日志。
    pub async fn send_frame(
        &self,
        frame: OutboundFrame,
    ) -> Result<(), mpsc::error::SendError<OutboundFrame>> {
        self.sender.send(frame).await
    }
}
