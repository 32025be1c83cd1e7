// gateway_server/src/ws_server/session_lock.rs

//! 进程级独占会话锁。
//!
//! 这不是一个包裹临界区的互斥量，而是一个跨越多条 WebSocket 消息的
//! **预约**：某个连接通过 `start_session` 取得锁之后，只有它能执行受门控的
//! 操作（交互式命令、SCP 传输），直到它发送 `end_session` 或断开连接。
//! 因此锁必须携带持有者身份：门控检查的不是"是否被锁"，而是"是否被我锁"。
//!
//! 实现上是一个由 `std::sync::Mutex` 保护的小值类型，所有临界区都是
//! 短小且不挂起的；每次状态迁移由调用方负责向全部连接广播。

use chrono::{DateTime, Utc};
use gateway_models::{LockStatusView, SessionStatusView};
use log::{debug, info};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::GatewayError;

/// 锁的内部状态。`owner` 为 `Some` 当且仅当锁被持有。
#[derive(Debug, Clone, Default)]
struct LockState {
    owner: Option<Uuid>,
    acquired_at: Option<DateTime<Utc>>,
}

/// 某一时刻的锁状态快照，用于 `welcome` 帧与广播。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub active: bool,
    pub owner: Option<Uuid>,
}

impl LockSnapshot {
    /// `welcome` 帧的 `lock_status` 视图。
    pub fn lock_status_view(&self) -> LockStatusView {
        LockStatusView {
            locked: self.active,
            lock_owner: self.owner.map(|id| id.to_string()),
        }
    }

    /// `welcome` 帧的 `session_status` 视图。
    pub fn session_status_view(&self) -> SessionStatusView {
        SessionStatusView {
            active: self.active,
            owner: self.owner.map(|id| id.to_string()),
        }
    }
}

/// 进程级单例会话锁。
pub struct SessionLock {
    state: Mutex<LockState>,
}

impl SessionLock {
    pub fn new() -> Self {
        info!("[会话锁] 正在创建进程级会话锁实例 (初始状态: 空闲)。");
        Self {
            state: Mutex::new(LockState::default()),
        }
    }

    fn locked_state(&self) -> std::sync::MutexGuard<'_, LockState> {
        // 临界区内不会 panic，中毒只可能来自内存不变量被破坏的进程
        self.state.lock().expect("[会话锁] 内部互斥量中毒")
    }

    /// 尝试为 `connection_id` 获取锁。
    ///
    /// 仅当锁空闲时成功，并原子地记录持有者与获取时刻；
    /// 否则返回携带当前持有者的 `SessionAlreadyActive`。
    pub fn acquire(&self, connection_id: Uuid) -> Result<(), GatewayError> {
        let mut state = self.locked_state();
        match state.owner {
            Some(owner) => {
                debug!(
                    "[会话锁] 连接 {} 获取锁失败：锁已被连接 {} 持有。",
                    connection_id, owner
                );
                Err(GatewayError::SessionAlreadyActive {
                    owner: owner.to_string(),
                })
            }
            None => {
                state.owner = Some(connection_id);
                state.acquired_at = Some(Utc::now());
                info!("[会话锁] 连接 {} 已获取会话锁。", connection_id);
                Ok(())
            }
        }
    }

    /// 释放锁。只有当前持有者可以释放。
    pub fn release(&self, connection_id: Uuid) -> Result<(), GatewayError> {
        let mut state = self.locked_state();
        match state.owner {
            None => {
                debug!("[会话锁] 连接 {} 释放锁失败：当前没有活动会话。", connection_id);
                Err(GatewayError::NoActiveSession)
            }
            Some(owner) if owner != connection_id => {
                debug!(
                    "[会话锁] 连接 {} 释放锁失败：锁由连接 {} 持有。",
                    connection_id, owner
                );
                Err(GatewayError::NotSessionOwner {
                    owner: owner.to_string(),
                })
            }
            Some(_) => {
                state.owner = None;
                state.acquired_at = None;
                info!("[会话锁] 连接 {} 已释放会话锁。", connection_id);
                Ok(())
            }
        }
    }

    /// 门控谓词：要求锁被持有且持有者是 `connection_id`。
    ///
    /// 锁空闲时返回 `NoActiveSession`，由他人持有时返回 `NotSessionOwner`。
    pub fn require(&self, connection_id: Uuid) -> Result<(), GatewayError> {
        let state = self.locked_state();
        match state.owner {
            None => Err(GatewayError::NoActiveSession),
            Some(owner) if owner != connection_id => Err(GatewayError::NotSessionOwner {
                owner: owner.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// 本连接是否为当前持有者（断连拆除时的条件释放判定）。
    pub fn is_owned_by(&self, connection_id: Uuid) -> bool {
        self.locked_state().owner == Some(connection_id)
    }

    /// 取当前状态快照。
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.locked_state();
        LockSnapshot {
            active: state.owner.is_some(),
            owner: state.owner,
        }
    }
}

impl Default for SessionLock {
    fn default() -> Self {
        Self::new()
    }
}
