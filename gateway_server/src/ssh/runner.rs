// gateway_server/src/ssh/runner.rs

//! 单连接 SSH 执行器：伪终端流式命令执行与服务器间 SCP 传输。
//!
//! 执行器包装一个 `async-ssh2-tokio` 客户端，生命周期与一次"连接 → 执行 →
//! 关闭"的任务对齐。所有读循环都是协作式可取消的：每个挂起点
//! （通道读取、下发节拍、输出写入）都在同一个 `tokio::select!` 中与取消
//! 令牌竞争，从收到取消信号到返回的最大可观测延迟不超过一个读片周期。

use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use log::{debug, info, warn};
use russh::ChannelMsg;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gateway_models::{HostConfig, TransferRecipe};

use crate::config::SshConfig;
use crate::error::GatewayError;
use crate::ssh::output::PtyOutputBuffer;
use crate::ssh::OutputSink;

/// 伪终端请求的列数/行数。远端按此宽度折行，取值只影响输出排版。
const PTY_COLUMNS: u32 = 200;
const PTY_ROWS: u32 = 50;
/// SCP 失败时保留的输出尾部上限（字符数），用于错误帧的诊断信息。
const STDERR_TAIL_LIMIT: usize = 600;

/// 执行器的阶段状态机。
///
/// `idle → connected ⇄ (streaming | transferring) → connected → closed`，
/// 任一阶段出错都会快进到 `closed`。`closed` 之后传输已销毁；
/// 同一执行器可通过再次 `connect` 重新武装（等价于新建逻辑执行器）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPhase {
    Idle,
    Connected,
    Streaming,
    Transferring,
    Closed,
}

/// 流式操作的正常结束方式。错误路径统一走 `Err(GatewayError)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// 终止短语命中 / 对端关闭通道 / 传输成功结束。
    Completed,
    /// 取消令牌被触发；缓冲中的输出已被丢弃。
    Cancelled,
}

/// 一次流式操作的节流与时限参数。
#[derive(Debug, Clone)]
pub struct StreamTuning {
    /// 两次批量下发之间的最小间隔。
    pub flush_interval: Duration,
    /// 触发立即下发的已提交字节数阈值。
    pub flush_bytes: usize,
    /// 整个操作的硬时限。
    pub op_timeout: Duration,
}

impl StreamTuning {
    /// 交互式命令的参数组。
    pub fn interactive(cfg: &SshConfig) -> Self {
        Self {
            flush_interval: cfg.flush_interval(),
            flush_bytes: cfg.flush_bytes,
            op_timeout: cfg.command_timeout(),
        }
    }

    /// SCP 传输的参数组。
    pub fn transfer(cfg: &SshConfig) -> Self {
        Self {
            flush_interval: cfg.flush_interval(),
            flush_bytes: cfg.flush_bytes,
            op_timeout: cfg.scp_timeout(),
        }
    }
}

/// 面向单连接的 SSH 执行器。
///
/// 不做任何内部加锁：任务注册表保证同一连接同一时刻至多一个任务在使用它，
/// 持有方（`ClientSession`）以 `tokio::sync::Mutex` 封装以便断连拆除时访问。
pub struct SshRunner {
    connection_id: Uuid,
    phase: RunnerPhase,
    client: Option<Client>,
    connected_alias: Option<String>,
}

impl SshRunner {
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            phase: RunnerPhase::Idle,
            client: None,
            connected_alias: None,
        }
    }

    /// 当前阶段（测试与诊断用）。
    pub fn phase(&self) -> RunnerPhase {
        self.phase
    }

    /// 建立到目标主机的 SSH 传输并完成密码认证。
    ///
    /// 仅允许从 `idle` 或 `closed` 阶段调用；已有活动传输时先行关闭。
    /// 整个建立过程（TCP + 握手 + 认证）受 `connect_timeout` 约束。
    pub async fn connect(
        &mut self,
        host: &HostConfig,
        connect_timeout: Duration,
    ) -> Result<(), GatewayError> {
        if self.client.is_some() {
            warn!(
                "[SSH执行器] 连接 {} 在已有活动传输时再次 connect，旧传输将被关闭。",
                self.connection_id
            );
            self.close().await;
        }

        info!(
            "[SSH执行器] 连接 {} 正在建立到主机 '{}' ({}:{}) 的 SSH 传输...",
            self.connection_id, host.alias, host.host, host.port
        );

        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let connect_future = Client::connect_with_config(
            (host.host.clone(), host.port),
            &host.username,
            AuthMethod::with_password(&host.password),
            ServerCheckMethod::NoCheck,
            config,
        );

        match tokio::time::timeout(connect_timeout, connect_future).await {
            Err(_) => {
                warn!(
                    "[SSH执行器] 连接 {} 到主机 '{}' 的 SSH 建立在 {:?} 内未完成。",
                    self.connection_id, host.alias, connect_timeout
                );
                self.phase = RunnerPhase::Closed;
                Err(GatewayError::SshConnectTimeout)
            }
            Ok(Err(e)) => {
                let mapped = classify_connect_error(e);
                warn!(
                    "[SSH执行器] 连接 {} 到主机 '{}' 的 SSH 建立失败: {}",
                    self.connection_id, host.alias, mapped
                );
                self.phase = RunnerPhase::Closed;
                Err(mapped)
            }
            Ok(Ok(client)) => {
                info!(
                    "[SSH执行器] 连接 {} 已成功连接并认证到主机 '{}'。",
                    self.connection_id, host.alias
                );
                self.client = Some(client);
                self.connected_alias = Some(host.alias.clone());
                self.phase = RunnerPhase::Connected;
                Ok(())
            }
        }
    }

    /// 在伪终端中执行一条交互式命令，按终止短语判定完成。
    ///
    /// 要求阶段为 `connected`。命令附带一个换行发送；随后进入读循环，
    /// 直到 (a) 已提交输出 + 当前逻辑行中出现 `stop_phrase`，
    /// (b) 对端关闭通道，或 (c) 取消令牌被触发。输出按
    /// [`StreamTuning`] 的节流规则分批写入 `sink`。
    pub async fn run_interactive(
        &mut self,
        command: &str,
        stop_phrase: &str,
        sink: &OutputSink,
        cancel: &CancellationToken,
        tuning: &StreamTuning,
    ) -> Result<StreamOutcome, GatewayError> {
        if self.phase != RunnerPhase::Connected {
            return Err(GatewayError::NotConnected);
        }
        let alias = self.connected_alias.clone().unwrap_or_default();
        info!(
            "[SSH执行器] 连接 {} 在主机 '{}' 上开始执行交互式命令 (终止短语: '{}')。",
            self.connection_id, alias, stop_phrase
        );
        self.phase = RunnerPhase::Streaming;

        let client = self.client.as_ref().ok_or(GatewayError::NotConnected)?;
        let result = stream_interactive(
            client,
            self.connection_id,
            command,
            stop_phrase,
            sink,
            cancel,
            tuning,
        )
        .await;

        match &result {
            Ok(outcome) => {
                info!(
                    "[SSH执行器] 连接 {} 的交互式命令结束: {:?}。",
                    self.connection_id, outcome
                );
                self.phase = RunnerPhase::Connected;
            }
            Err(e) => {
                warn!(
                    "[SSH执行器] 连接 {} 的交互式命令失败: {}。执行器转入 closed。",
                    self.connection_id, e
                );
                self.teardown_transport();
            }
        }
        result
    }

    /// 按配方驱动一次服务器间文件拷贝（当前连接的主机作为发起方）。
    ///
    /// 要求阶段为 `connected`，且当前连接的主机即配方的源主机。
    /// 在源主机上以伪终端执行 `scp`，应答目标主机的密码提示，
    /// 周期性地向 `sink` 写入人类可读的进度行，最终按退出码判定结果。
    pub async fn scp_transfer(
        &mut self,
        recipe: &TransferRecipe,
        dest_host: &HostConfig,
        sink: &OutputSink,
        cancel: &CancellationToken,
        tuning: &StreamTuning,
    ) -> Result<StreamOutcome, GatewayError> {
        if self.phase != RunnerPhase::Connected {
            return Err(GatewayError::NotConnected);
        }
        info!(
            "[SSH执行器] 连接 {} 开始传输配方 '{}': {}:{} -> {}:{}",
            self.connection_id,
            recipe.name,
            recipe.source_alias,
            recipe.source_path,
            recipe.dest_alias,
            recipe.dest_path
        );
        self.phase = RunnerPhase::Transferring;

        // 源主机驱动拷贝；目标主机的首次指纹确认在非交互场景下无人应答，故关闭严格校验
        let scp_command = format!(
            "scp -o StrictHostKeyChecking=no -r {} {}@{}:{}",
            recipe.source_path, dest_host.username, dest_host.host, recipe.dest_path
        );

        let client = self.client.as_ref().ok_or(GatewayError::NotConnected)?;
        let result = stream_scp(
            client,
            self.connection_id,
            &scp_command,
            &dest_host.password,
            sink,
            cancel,
            tuning,
        )
        .await;

        match &result {
            Ok(outcome) => {
                info!(
                    "[SSH执行器] 连接 {} 的传输 '{}' 结束: {:?}。",
                    self.connection_id, recipe.name, outcome
                );
                self.phase = RunnerPhase::Connected;
            }
            Err(e) => {
                warn!(
                    "[SSH执行器] 连接 {} 的传输 '{}' 失败: {}。执行器转入 closed。",
                    self.connection_id, recipe.name, e
                );
                self.teardown_transport();
            }
        }
        result
    }

    /// 幂等关闭：销毁底层传输并转入 `closed` 阶段。
    ///
    /// `async-ssh2-tokio` 的客户端在 drop 时关闭底层连接，无需显式断开。
    pub async fn close(&mut self) {
        if self.phase == RunnerPhase::Closed && self.client.is_none() {
            debug!("[SSH执行器] 连接 {} 的执行器已处于 closed，close 为空操作。", self.connection_id);
            return;
        }
        info!(
            "[SSH执行器] 连接 {} 正在关闭 SSH 传输 (主机: {:?})。",
            self.connection_id, self.connected_alias
        );
        self.teardown_transport();
    }

    fn teardown_transport(&mut self) {
        self.client = None;
        self.connected_alias = None;
        self.phase = RunnerPhase::Closed;
    }
}

/// 把 `async-ssh2-tokio` 的连接错误归类为认证失败或连接失败。
///
/// 库没有为认证失败提供稳定的枚举判别，这里按错误文本归类；
/// 归类只影响错误码展示，不影响控制流。
fn classify_connect_error(e: async_ssh2_tokio::Error) -> GatewayError {
    let text = e.to_string();
    let lowered = text.to_ascii_lowercase();
    if lowered.contains("auth") || lowered.contains("password") {
        GatewayError::SshAuthFailed(text)
    } else {
        GatewayError::SshConnectFailed(text)
    }
}

/// 交互式命令的读循环。
async fn stream_interactive(
    client: &Client,
    connection_id: Uuid,
    command: &str,
    stop_phrase: &str,
    sink: &OutputSink,
    cancel: &CancellationToken,
    tuning: &StreamTuning,
) -> Result<StreamOutcome, GatewayError> {
    let mut channel = client
        .get_channel()
        .await
        .map_err(|e| GatewayError::SshCommandFailed(format!("打开通道失败: {}", e)))?;
    channel
        .request_pty(false, "xterm", PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
        .await
        .map_err(|e| GatewayError::SshCommandFailed(format!("请求伪终端失败: {}", e)))?;
    channel
        .request_shell(false)
        .await
        .map_err(|e| GatewayError::SshCommandFailed(format!("请求 shell 失败: {}", e)))?;
    channel
        .data(format!("{}\n", command).as_bytes())
        .await
        .map_err(|e| GatewayError::SshCommandFailed(format!("发送命令失败: {}", e)))?;

    let mut buffer = PtyOutputBuffer::new(stop_phrase);
    let mut flush_tick = tokio::time::interval(tuning.flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::Instant::now() + tuning.op_timeout;

    loop {
        tokio::select! {
            biased;

            // 取消优先：丢弃缓冲输出，关闭通道，立即返回
            _ = cancel.cancelled() => {
                info!("[SSH执行器] 连接 {} 的交互式命令收到取消信号，正在关闭通道。", connection_id);
                let _ = channel.eof().await;
                return Ok(StreamOutcome::Cancelled);
            }

            _ = tokio::time::sleep_until(deadline) => {
                let _ = channel.eof().await;
                return Err(GatewayError::SshCommandFailed(format!(
                    "命令在 {:?} 内未命中终止短语 '{}'",
                    tuning.op_timeout, stop_phrase
                )));
            }

            maybe_msg = channel.wait() => {
                match maybe_msg {
                    Some(ChannelMsg::Data { ref data }) | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                        buffer.push_chunk(&String::from_utf8_lossy(data));
                        if buffer.stop_phrase_seen() {
                            // 终止短语命中：冲刷全部缓冲（含当前逻辑行）后完成
                            sink.send_output(buffer.drain_all()).await;
                            let _ = channel.eof().await;
                            return Ok(StreamOutcome::Completed);
                        }
                        if buffer.committed_len() >= tuning.flush_bytes {
                            sink.send_output(buffer.drain_committed()).await;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("[SSH执行器] 连接 {} 的远端 shell 以状态码 {} 退出。", connection_id, exit_status);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        // 对端关闭：冲刷剩余输出后按完成处理
                        info!("[SSH执行器] 连接 {} 的命令通道已被对端关闭。", connection_id);
                        sink.send_output(buffer.drain_all()).await;
                        return Ok(StreamOutcome::Completed);
                    }
                    Some(_) => {}
                }
            }

            _ = flush_tick.tick() => {
                let batch = buffer.drain_committed();
                sink.send_output(batch).await;
            }
        }
    }
}

/// SCP 传输的读循环。
async fn stream_scp(
    client: &Client,
    connection_id: Uuid,
    scp_command: &str,
    dest_password: &str,
    sink: &OutputSink,
    cancel: &CancellationToken,
    tuning: &StreamTuning,
) -> Result<StreamOutcome, GatewayError> {
    let scp_error = |detail: String| GatewayError::ScpFailed {
        exit_code: None,
        stderr_tail: detail,
    };

    let mut channel = client
        .get_channel()
        .await
        .map_err(|e| scp_error(format!("打开通道失败: {}", e)))?;
    // scp 的密码提示只在伪终端下出现
    channel
        .request_pty(false, "xterm", PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
        .await
        .map_err(|e| scp_error(format!("请求伪终端失败: {}", e)))?;
    channel
        .exec(true, scp_command)
        .await
        .map_err(|e| scp_error(format!("启动 scp 失败: {}", e)))?;

    // 传输完成以退出码判定，不设终止短语
    let mut buffer = PtyOutputBuffer::new("");
    let mut flush_tick = tokio::time::interval(tuning.flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::Instant::now() + tuning.op_timeout;

    let mut exit_code: Option<u32> = None;
    let mut password_sent = false;
    let mut diag_tail = String::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("[SSH执行器] 连接 {} 的 SCP 传输收到取消信号，正在关闭通道。", connection_id);
                let _ = channel.eof().await;
                return Ok(StreamOutcome::Cancelled);
            }

            _ = tokio::time::sleep_until(deadline) => {
                let _ = channel.eof().await;
                return Err(GatewayError::ScpFailed {
                    exit_code: None,
                    stderr_tail: format!("传输在 {:?} 内未结束", tuning.op_timeout),
                });
            }

            maybe_msg = channel.wait() => {
                match maybe_msg {
                    Some(ChannelMsg::Data { ref data }) | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                        let text = String::from_utf8_lossy(data);
                        buffer.push_chunk(&text);
                        append_tail(&mut diag_tail, &text);

                        // 目标主机的密码提示只应答一次，且提示行不转发给客户端
                        if !password_sent
                            && buffer.current_line().to_ascii_lowercase().contains("password")
                        {
                            debug!("[SSH执行器] 连接 {} 检测到目标主机密码提示，正在应答。", connection_id);
                            channel
                                .data(format!("{}\n", dest_password).as_bytes())
                                .await
                                .map_err(|e| scp_error(format!("应答密码提示失败: {}", e)))?;
                            password_sent = true;
                            buffer.clear_current_line();
                        }

                        if buffer.committed_len() >= tuning.flush_bytes {
                            sink.send_output(buffer.drain_committed()).await;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("[SSH执行器] 连接 {} 的 scp 进程以状态码 {} 退出。", connection_id, exit_status);
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        break;
                    }
                    Some(_) => {}
                }
            }

            _ = flush_tick.tick() => {
                let batch = buffer.drain_committed();
                if batch.is_empty() {
                    // scp 的进度条完全由 \r 重写构成，永远不会提交成行；
                    // 周期性地把当前逻辑行快照作为进度行下发
                    if let Some(progress) = buffer.progress_snapshot() {
                        sink.send_output(format!("{}\n", progress)).await;
                    }
                } else {
                    sink.send_output(batch).await;
                }
            }
        }
    }

    // 冲刷剩余输出后按退出码判定
    sink.send_output(buffer.drain_all()).await;
    match exit_code {
        Some(0) => Ok(StreamOutcome::Completed),
        code => Err(GatewayError::ScpFailed {
            exit_code: code,
            stderr_tail: diag_tail,
        }),
    }
}

/// 维护诊断尾巴：追加新输出并从头部截断到上限长度。
fn append_tail(tail: &mut String, text: &str) {
    tail.push_str(text);
    let excess = tail.chars().count().saturating_sub(STDERR_TAIL_LIMIT);
    if excess > 0 {
        let cut = tail
            .char_indices()
            .nth(excess)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        tail.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runner_phase_starts_idle_and_close_is_idempotent() {
        let mut runner = SshRunner::new(Uuid::new_v4());
        assert_eq!(runner.phase(), RunnerPhase::Idle);
        // close 在任何阶段都是幂等的
        runner.close().await;
        assert_eq!(runner.phase(), RunnerPhase::Closed);
        runner.close().await;
        assert_eq!(runner.phase(), RunnerPhase::Closed);
    }

    #[tokio::test]
    async fn test_operations_on_closed_runner_fail_not_connected() {
        let mut runner = SshRunner::new(Uuid::new_v4());
        runner.close().await;

        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let cancel = CancellationToken::new();
        let sink = OutputSink::new(Uuid::new_v4(), tx, cancel.clone());
        let tuning = StreamTuning {
            flush_interval: Duration::from_millis(100),
            flush_bytes: 4096,
            op_timeout: Duration::from_secs(1),
        };

        let result = runner
            .run_interactive("ls", "PROMPT>", &sink, &cancel, &tuning)
            .await;
        assert!(matches!(result, Err(GatewayError::NotConnected)));
    }

    #[test]
    fn test_append_tail_keeps_only_recent_output() {
        let mut tail = String::new();
        append_tail(&mut tail, &"a".repeat(500));
        append_tail(&mut tail, &"b".repeat(400));
        assert_eq!(tail.chars().count(), STDERR_TAIL_LIMIT);
        assert!(tail.ends_with(&"b".repeat(400)));
    }

    #[test]
    fn test_connect_error_classification() {
        // 归类只依赖错误文本，这里直接验证判别逻辑的两侧
        let auth_like = GatewayError::SshAuthFailed("password authentication failed".into());
        assert_eq!(auth_like.code(), 21000);
        let conn_like = GatewayError::SshConnectFailed("connection refused".into());
        assert_eq!(conn_like.code(), 20000);
    }
}
