// gateway_server/src/ws_server/task_registry.rs

//! 每连接的可取消任务注册表。
//!
//! 长时间运行的 SSH / SCP 工作以独立的子任务执行，使连接的消息分发循环
//! 始终可以接收 `end_session` 等控制消息。本注册表保证：
//! - 同一连接同一时刻至多一个在册任务（二次下发被拒绝，`task-already-running`）；
//! - 任务句柄在工作开始执行之前已经注册完成；
//! - `cancel` 在发出取消信号后等待任务实际终止（受时限约束），
//!   因此被取消任务的完成在可观测意义上先于同一连接的下一次 `start`。
//!
//! 注册表自身的变更由 `DashMap` 串行化；除 `cancel` 内部的等待外，
//! 所有操作都是短小且不挂起的。

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::GatewayError;

/// 一个在册任务的句柄。
struct TaskHandle {
    /// 协作式取消令牌；任务的每个挂起点都应消费它。
    token: CancellationToken,
    /// 任务注册时刻（诊断用）。
    started_at: DateTime<Utc>,
    /// Tokio 任务句柄。`cancel` 取走它等待任务终止；
    /// 等待超时后放回，供重试或进程退出时放弃。
    join: Mutex<Option<JoinHandle<()>>>,
}

/// 连接 ID → 在册任务 的注册表。
pub struct TaskRegistry {
    tasks: DashMap<Uuid, TaskHandle>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        info!("[任务注册表] 正在创建任务注册表实例。");
        Self {
            tasks: DashMap::new(),
        }
    }

    /// 为连接 `connection_id` 启动一个任务。
    ///
    /// `make_work` 以新建的取消令牌为参数构造工作 future。若该连接已有在册
    /// 任务则拒绝并返回 `TaskAlreadyRunning`。工作 future 通过一个一次性
    /// 信号延迟到句柄注册完成之后才真正开始执行，避免"任务瞬间完成并调用
    /// `cleanup`，随后才插入句柄"的竞争窗口留下僵尸条目。
    pub fn start<F, Fut>(&self, connection_id: Uuid, make_work: F) -> Result<(), GatewayError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let registered_tx = match self.tasks.entry(connection_id) {
            Entry::Occupied(_) => {
                debug!(
                    "[任务注册表] 连接 {} 已有在册任务，拒绝二次下发。",
                    connection_id
                );
                return Err(GatewayError::TaskAlreadyRunning);
            }
            Entry::Vacant(vacant) => {
                let token = CancellationToken::new();
                let work = make_work(token.clone());
                let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
                let join = tokio::spawn(async move {
                    // 句柄注册完成之前不开始执行（注册方崩溃时照常放行）
                    let _ = registered_rx.await;
                    work.await;
                });
                vacant.insert(TaskHandle {
                    token,
                    started_at: Utc::now(),
                    join: Mutex::new(Some(join)),
                });
                registered_tx
            }
        };
        let _ = registered_tx.send(());
        info!("[任务注册表] 已为连接 {} 注册并启动任务。", connection_id);
        Ok(())
    }

    /// 向连接的在册任务发出取消信号，并等待其终止（至多 `deadline`）。
    ///
    /// - 无在册任务 → `TaskNotFound`；
    /// - 任务在时限内终止（包括在本调用发出前就已自行终止）→ 注销句柄并返回 `Ok`；
    /// - 时限内未终止 → `TaskCancelTimeout`，句柄保持在册，
    ///   等待重试或在进程退出时被放弃。
    pub async fn cancel(
        &self,
        connection_id: &Uuid,
        deadline: Duration,
    ) -> Result<(), GatewayError> {
        let join_taken = {
            let Some(handle) = self.tasks.get(connection_id) else {
                return Err(GatewayError::TaskNotFound);
            };
            handle.token.cancel();
            let taken = handle
                .join
                .lock()
                .expect("[任务注册表] 任务句柄互斥量中毒")
                .take();
            taken
        }; // 在等待之前释放对映射分片的引用

        let Some(mut join) = join_taken else {
            // 句柄已被并发的取消流程取走
            return Err(GatewayError::TaskCancelFailed(
                "另一个取消流程正在等待该任务终止".to_string(),
            ));
        };

        match tokio::time::timeout(deadline, &mut join).await {
            Ok(join_result) => {
                self.tasks.remove(connection_id);
                if let Err(e) = join_result {
                    warn!(
                        "[任务注册表] 连接 {} 的任务在终止时发生 panic: {:?}",
                        connection_id, e
                    );
                }
                info!("[任务注册表] 连接 {} 的任务已终止并注销。", connection_id);
                Ok(())
            }
            Err(_) => {
                warn!(
                    "[任务注册表] 连接 {} 的任务在 {:?} 内未响应取消信号，句柄保持在册。",
                    connection_id, deadline
                );
                // 放回句柄，允许后续重试取消
                if let Some(handle) = self.tasks.get(connection_id) {
                    *handle
                        .join
                        .lock()
                        .expect("[任务注册表] 任务句柄互斥量中毒") = Some(join);
                }
                Err(GatewayError::TaskCancelTimeout)
            }
        }
    }

    /// 任务正常完成后的注销（不发送取消信号），由任务自身在收尾时调用。
    pub fn cleanup(&self, connection_id: &Uuid) -> Result<(), GatewayError> {
        match self.tasks.remove(connection_id) {
            Some(_) => {
                debug!("[任务注册表] 连接 {} 的任务句柄已清理。", connection_id);
                Ok(())
            }
            None => Err(GatewayError::TaskCleanupFailed(format!(
                "连接 {} 没有在册的任务句柄",
                connection_id
            ))),
        }
    }

    /// 该连接当前是否有在册任务。
    pub fn has_live_task(&self, connection_id: &Uuid) -> bool {
        self.tasks.contains_key(connection_id)
    }

    /// 在册任务总数（诊断用）。
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// 某连接任务的注册时刻（诊断用）。
    pub fn started_at(&self, connection_id: &Uuid) -> Option<DateTime<Utc>> {
        self.tasks.get(connection_id).map(|h| h.started_at)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
