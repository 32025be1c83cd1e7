// gateway_server/src/ws_server/connection_manager.rs

//! WebSocket 连接管理模块。
//!
//! 该模块负责跟踪所有通过 WebSocket 连接到网关的活动客户端，每个客户端由
//! 一个 `ClientSession` 实例表示，存储在并发安全的哈希映射中。除了连接的
//! 添加与移除，它还承担面向全体连接的帧广播（锁状态迁移、主机健康迁移），
//! 广播是尽力而为的：单个连接的发送失败或拥塞不会影响其他连接。

use dashmap::DashMap;
use gateway_models::OutboundFrame;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ws_server::client_session::ClientSession;

/// `ConnectionManager` 负责集中管理所有活动的 WebSocket 客户端会话。
///
/// 设计上使用了 `Arc` 和 `DashMap` 来确保其主要数据成员的线程安全和
/// 高效并发访问。
#[derive(Clone)]
pub struct ConnectionManager {
    /// 存储所有当前活动的客户端会话的并发哈希映射。
    /// - 键 (`Uuid`): 每个连接的唯一标识符 (`connection_id`)。
    /// - 值 (`Arc<ClientSession>`): 对该客户端会话对象的共享引用。
    clients: Arc<DashMap<Uuid, Arc<ClientSession>>>,
}

impl ConnectionManager {
    /// 创建一个新的 `ConnectionManager` 实例。应在服务启动时调用一次。
    pub fn new() -> Self {
        info!("[连接管理器] 正在创建并初始化一个新的 ConnectionManager 实例...");
        Self {
            clients: Arc::new(DashMap::new()),
        }
    }

    /// 将一个新的客户端会话添加到连接管理器中进行跟踪。
    ///
    /// 此方法在 WebSocket 服务成功接受一个新的客户端连接后被调用。
    /// 它会创建一个新的 `ClientSession` 实例（内部铸造唯一的连接 ID），
    /// 并将其存储到内部的 `clients` 映射中。
    pub async fn add_client(
        &self,
        addr: SocketAddr,
        sender: mpsc::Sender<OutboundFrame>,
        connection_should_close: Arc<AtomicBool>,
    ) -> Arc<ClientSession> {
        let client_session = Arc::new(ClientSession::new(addr, sender, connection_should_close));
        self.clients
            .insert(client_session.connection_id, Arc::clone(&client_session));
        info!(
            "[连接管理器] 新客户端已成功连接并添加至管理器进行跟踪。ID: {}, 地址: {}",
            client_session.connection_id, client_session.addr
        );
        debug!("[连接管理器] 当前活动客户端总数: {}", self.clients.len());
        client_session
    }

    /// 从连接管理器中移除一个指定的客户端会话。
    ///
    /// 同时把会话的 `connection_should_close` 标志置位，通知处理该连接
    /// I/O 的异步任务终止。移除之后该连接不再是任何广播的受众。
    pub async fn remove_client(&self, connection_id: &Uuid) {
        if let Some((_removed_id, client_session)) = self.clients.remove(connection_id) {
            client_session
                .connection_should_close
                .store(true, Ordering::SeqCst);
            // 让出执行权，帮助连接处理循环尽快观察到关闭标志
            tokio::task::yield_now().await;
            info!(
                "[连接管理器] 客户端 {} (地址: {}) 已从活动客户端列表中移除。",
                connection_id, client_session.addr
            );
        } else {
            warn!(
                "[连接管理器] 尝试移除客户端 {} 时失败：该客户端未在活动客户端列表中找到。可能已被移除或从未添加。",
                connection_id
            );
        }
        debug!("[连接管理器] 当前活动客户端总数: {}", self.clients.len());
    }

    /// 按连接 ID 查找会话。
    pub fn get_client(&self, connection_id: &Uuid) -> Option<Arc<ClientSession>> {
        self.clients.get(connection_id).map(|entry| entry.value().clone())
    }

    /// 获取当前所有活动客户端会话的一个快照。
    pub fn get_all_client_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// 获取当前连接的活动客户端总数。
    pub fn get_client_count(&self) -> usize {
        self.clients.len()
    }

    /// 向全部活动连接广播一帧。
    ///
    /// 广播是尽力而为的：使用 `try_send` 把帧推入各连接的发送队列，
    /// 队列已满（客户端消费过慢）或已关闭（连接正在拆除）时记录日志并
    /// 跳过该连接，绝不阻塞，也绝不让单个连接的问题波及其他连接。
    pub fn broadcast_frame(&self, frame: &OutboundFrame) {
        self.broadcast_frame_except(frame, None);
    }

    /// 同 [`broadcast_frame`](Self::broadcast_frame)，但可以排除一个连接
    /// （通常是已经以应答形式单独收到该帧的发起者）。
    pub fn broadcast_frame_except(&self, frame: &OutboundFrame, exclude: Option<&Uuid>) {
        let mut delivered = 0usize;
        for entry in self.clients.iter() {
            let session = entry.value();
            if exclude == Some(&session.connection_id) {
                continue;
            }
            match session.sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "[连接管理器] 向客户端 {} 广播帧失败: {}。该连接可能已断开或发送队列拥塞，已跳过。",
                        session.connection_id, e
                    );
                }
            }
        }
        debug!("[连接管理器] 广播完成，送达 {} 个连接。", delivered);
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 45678)
    }

    #[tokio::test]
    async fn test_add_and_remove_client() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::channel(8);
        let close_flag = Arc::new(AtomicBool::new(false));
        let session = manager.add_client(test_addr(), tx, Arc::clone(&close_flag)).await;
        assert_eq!(manager.get_client_count(), 1);
        assert!(manager.get_client(&session.connection_id).is_some());

        manager.remove_client(&session.connection_id).await;
        assert_eq!(manager.get_client_count(), 0);
        // 移除必须同时请求关闭底层连接
        assert!(close_flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_and_congested_clients() {
        let manager = ConnectionManager::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(1);
        let session_a = manager
            .add_client(test_addr(), tx_a, Arc::new(AtomicBool::new(false)))
            .await;
        let session_b = manager
            .add_client(test_addr(), tx_b, Arc::new(AtomicBool::new(false)))
            .await;

        // 塞满 B 的队列使其拥塞
        session_b
            .sender
            .try_send(OutboundFrame::Output { data: "x".into() })
            .unwrap();

        let frame = OutboundFrame::SessionEnded {
            message: "会话已结束".to_string(),
        };
        // B 拥塞不应影响 A 收到广播
        manager.broadcast_frame(&frame);
        assert_eq!(rx_a.try_recv().unwrap(), frame);

        // 排除 A 时 A 不应再收到
        manager.broadcast_frame_except(&frame, Some(&session_a.connection_id));
        assert!(rx_a.try_recv().is_err());
    }
}
