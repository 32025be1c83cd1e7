// gateway_server/src/ssh/mod.rs

//! 面向单连接的 SSH 执行器模块。
//!
//! 每个 WebSocket 连接至多持有一个 [`runner::SshRunner`]，由任务注册表保证
//! 同一时刻只有一个任务在使用它。执行器提供三个操作：建立连接、在伪终端
//! 中流式执行交互式命令（以终止短语判定完成）、驱动服务器间 SCP 文件传输。
//!
//! 输出通过 [`OutputSink`] 回写到连接的发送队列；发送队列关闭（意味着
//! WebSocket 已断开）时，sink 会向任务的取消令牌发出信号，使阻塞中的
//! 读循环在一个读片周期内退出。

pub mod output;
pub mod runner;

pub use runner::{RunnerPhase, SshRunner, StreamOutcome, StreamTuning};

use gateway_models::OutboundFrame;
use log::warn;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 任务输出的下发端：把输出批次写入所属连接的 WebSocket 发送队列。
///
/// 发送队列是有界的，`send` 的背压使远端输出速率受限于客户端的消费速率，
/// 这正是输出节流语义的一部分。队列关闭视为连接断开，立即取消任务。
pub struct OutputSink {
    connection_id: Uuid,
    sender: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl OutputSink {
    pub fn new(
        connection_id: Uuid,
        sender: mpsc::Sender<OutboundFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            sender,
            cancel,
        }
    }

    /// 下发一批输出。空批次直接忽略。
    ///
    /// 写入本身也是一个挂起点（队列满时产生背压），因此同样消费取消令牌：
    /// 令牌触发时放弃本批输出立即返回。发送失败说明连接的发送任务已经退出
    /// （WebSocket 写失败或连接已拆除），此时向任务的取消令牌发出信号，
    /// 让持有本 sink 的读循环尽快终止。
    pub async fn send_output(&self, data: String) {
        if data.is_empty() {
            return;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            result = self.sender.send(OutboundFrame::Output { data }) => {
                if result.is_err() {
                    warn!(
                        "[输出通道] 连接 {} 的 WebSocket 发送队列已关闭，向进行中的任务发出取消信号。",
                        self.connection_id
                    );
                    self.cancel.cancel();
                }
            }
        }
    }
}
