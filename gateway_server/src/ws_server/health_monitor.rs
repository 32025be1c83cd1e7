// gateway_server/src/ws_server/health_monitor.rs

//! 主机健康监视器模块。
//!
//! 该模块的核心职责是定期探测所有已注册主机的 TCP 可达性，维护每台主机的
//! 健康真值，并在健康判定发生迁移时（且仅在迁移时）向订阅者广播新的快照。
//! 判定带滞回去抖：健康 → 不健康需要连续 `failure_threshold` 次失败，
//! 不健康 → 健康需要连续 `success_threshold` 次成功，避免网络抖动导致
//! 状态来回翻转刷屏。
//!
//! 监视器随进程启动、随进程关闭（通过取消令牌），自身永不使进程失败：
//! DNS 或网络错误只是一次失败的探测，仅此而已。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use gateway_models::HealthSnapshot;
use log::{debug, info, warn};
use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::host_registry::HostRegistry;

/// 广播通道容量。迁移事件稀疏，积压到该深度说明订阅者已经停摆。
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// 单台主机的健康状态行。只有监视器会修改它。
#[derive(Debug, Clone)]
pub struct HostHealth {
    pub alias: String,
    pub host: String,
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl HostHealth {
    fn new(alias: String, host: String) -> Self {
        Self {
            alias,
            host,
            // 首轮探测之前乐观地视为健康
            healthy: true,
            last_checked: Utc::now(),
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    /// 吸收一次探测结果，返回健康判定是否发生迁移。
    ///
    /// 成功使 `consecutive_successes` 递增并清零失败计数，失败则相反。
    /// 迁移规则（滞回）：
    /// - healthy → unhealthy 当 `consecutive_failures` 达到 `failure_threshold`；
    /// - unhealthy → healthy 当 `consecutive_successes` 达到 `success_threshold`。
    pub fn apply_probe(
        &mut self,
        success: bool,
        failure_threshold: u32,
        success_threshold: u32,
    ) -> bool {
        self.last_checked = Utc::now();
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if !self.healthy && self.consecutive_successes >= success_threshold {
                self.healthy = true;
                return true;
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.healthy && self.consecutive_failures >= failure_threshold {
                self.healthy = false;
                return true;
            }
        }
        false
    }

    /// 生成对外快照。
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            server_name: self.alias.clone(),
            host: self.host.clone(),
            is_healthy: self.healthy,
            last_checked: self.last_checked,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
        }
    }
}

/// 一个探测目标（别名 + 地址 + 端口），启动时从注册表固化。
#[derive(Debug, Clone)]
struct ProbeTarget {
    alias: String,
    host: String,
    port: u16,
}

/// 主机健康监视器。
pub struct HealthMonitor {
    /// 每台主机一行，行内部由读写锁保护，保证读者看到一致的快照。
    rows: DashMap<String, Arc<RwLock<HostHealth>>>,
    targets: Vec<ProbeTarget>,
    health_cfg: HealthConfig,
    /// 迁移事件的广播端。落后的订阅者只会丢失自己的消息，不会阻塞监视器。
    notifier: broadcast::Sender<HealthSnapshot>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    /// 从主机注册表构建监视器。所有主机初始乐观健康。
    pub fn new(registry: &HostRegistry, health_cfg: HealthConfig) -> Self {
        let rows = DashMap::new();
        let mut targets = Vec::with_capacity(registry.host_count());
        for host in registry.all_hosts() {
            rows.insert(
                host.alias.clone(),
                Arc::new(RwLock::new(HostHealth::new(
                    host.alias.clone(),
                    host.host.clone(),
                ))),
            );
            targets.push(ProbeTarget {
                alias: host.alias.clone(),
                host: host.host.clone(),
                port: host.port,
            });
        }
        let (notifier, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        info!(
            "[健康监视器] 已创建健康监视器。主机数: {}, 探测周期: {:?}, 探测超时: {:?}, 失败阈值: {}, 成功阈值: {}",
            targets.len(),
            health_cfg.probe_interval(),
            health_cfg.probe_timeout(),
            health_cfg.failure_threshold,
            health_cfg.success_threshold
        );
        Self {
            rows,
            targets,
            health_cfg,
            notifier,
            shutdown: CancellationToken::new(),
        }
    }

    /// 订阅健康迁移事件。
    pub fn subscribe(&self) -> broadcast::Receiver<HealthSnapshot> {
        self.notifier.subscribe()
    }

    /// 请求监视器停机。停机后不再产生任何迁移通知。
    pub fn shutdown(&self) {
        info!("[健康监视器] 收到停机请求，正在取消后台探测循环。");
        self.shutdown.cancel();
    }

    /// 取全部主机健康快照（`welcome` 帧用）。按别名排序以获得确定的输出。
    pub async fn snapshot_all(&self) -> BTreeMap<String, HealthSnapshot> {
        let mut snapshots = BTreeMap::new();
        for entry in self.rows.iter() {
            let row = entry.value().read().await;
            snapshots.insert(entry.key().clone(), row.snapshot());
        }
        snapshots
    }

    /// 监视器主循环。应通过 `tokio::spawn` 在进程启动时派生到后台执行，
    /// 循环持续到停机令牌被取消为止。
    pub async fn run(self: Arc<Self>) {
        info!(
            "[健康监视器] 后台探测循环已启动。将每 {:?} 探测一轮全部主机。",
            self.health_cfg.probe_interval()
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("[健康监视器] 停机令牌已触发，探测循环退出。");
                    break;
                }
                _ = sleep(self.health_cfg.probe_interval()) => {
                    let transitions = self.probe_round().await;
                    // 迁移通知串行发送，保持订阅者观察到的顺序
                    for snapshot in transitions {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        info!(
                            "[健康监视器] 主机 '{}' 健康迁移: is_healthy={} (连续失败 {}, 连续成功 {})。",
                            snapshot.server_name,
                            snapshot.is_healthy,
                            snapshot.consecutive_failures,
                            snapshot.consecutive_successes
                        );
                        if let Err(e) = self.notifier.send(snapshot) {
                            // 没有任何订阅者在线；迁移已记录在行内，不影响监视器
                            debug!("[健康监视器] 迁移通知没有接收者: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// 并行探测全部主机一轮，返回本轮发生迁移的主机快照列表。
    pub(crate) async fn probe_round(&self) -> Vec<HealthSnapshot> {
        let probes = self.targets.iter().map(|target| self.probe_one(target));
        join_all(probes).await.into_iter().flatten().collect()
    }

    /// 探测单台主机：带超时的 TCP connect。返回迁移后的快照（若发生迁移）。
    async fn probe_one(&self, target: &ProbeTarget) -> Option<HealthSnapshot> {
        let success = matches!(
            tokio::time::timeout(
                self.health_cfg.probe_timeout(),
                tokio::net::TcpStream::connect((target.host.clone(), target.port)),
            )
            .await,
            Ok(Ok(_))
        );
        debug!(
            "[健康监视器] 主机 '{}' ({}:{}) 探测结果: {}",
            target.alias,
            target.host,
            target.port,
            if success { "可达" } else { "不可达" }
        );

        let Some(row_entry) = self.rows.get(&target.alias) else {
            warn!("[健康监视器] 探测目标 '{}' 在状态表中不存在，已跳过。", target.alias);
            return None;
        };
        let row_lock = Arc::clone(row_entry.value());
        drop(row_entry);

        let mut row = row_lock.write().await;
        let transitioned = row.apply_probe(
            success,
            self.health_cfg.failure_threshold,
            self.health_cfg.success_threshold,
        );
        if transitioned {
            Some(row.snapshot())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use gateway_models::HostConfig;

    fn thresholds() -> (u32, u32) {
        (2, 2)
    }

    #[test]
    fn test_demotion_requires_consecutive_failures() {
        let (fail_t, ok_t) = thresholds();
        let mut row = HostHealth::new("mypap1d".into(), "10.0.0.2".into());
        assert!(row.healthy);
        // 第一次失败不迁移
        assert!(!row.apply_probe(false, fail_t, ok_t));
        assert!(row.healthy);
        // 第二次连续失败触发迁移
        assert!(row.apply_probe(false, fail_t, ok_t));
        assert!(!row.healthy);
        // 继续失败不再重复迁移
        assert!(!row.apply_probe(false, fail_t, ok_t));
    }

    #[test]
    fn test_single_success_does_not_resurrect_with_threshold_two() {
        let (fail_t, ok_t) = thresholds();
        let mut row = HostHealth::new("mypap1d".into(), "10.0.0.2".into());
        row.apply_probe(false, fail_t, ok_t);
        row.apply_probe(false, fail_t, ok_t);
        assert!(!row.healthy);
        // 单次成功不足以复活
        assert!(!row.apply_probe(true, fail_t, ok_t));
        assert!(!row.healthy);
        // 中间再失败一次会清零成功计数
        assert!(!row.apply_probe(false, fail_t, ok_t));
        assert!(!row.apply_probe(true, fail_t, ok_t));
        assert!(!row.healthy);
        // 连续两次成功才迁移回健康
        assert!(row.apply_probe(true, fail_t, ok_t));
        assert!(row.healthy);
    }

    #[test]
    fn test_failure_resets_success_counter() {
        let (fail_t, ok_t) = thresholds();
        let mut row = HostHealth::new("h".into(), "x".into());
        row.apply_probe(true, fail_t, ok_t);
        assert_eq!(row.consecutive_successes, 1);
        row.apply_probe(false, fail_t, ok_t);
        assert_eq!(row.consecutive_successes, 0);
        assert_eq!(row.consecutive_failures, 1);
    }

    fn registry_for(hosts: Vec<HostConfig>) -> HostRegistry {
        let settings = GatewaySettings {
            hosts,
            ..Default::default()
        };
        HostRegistry::from_settings(&settings).unwrap()
    }

    #[tokio::test]
    async fn test_probe_round_against_real_listener() {
        // 一台主机指向真实监听器（可达），另一台指向刚释放的端口（不可达）
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reachable_port = listener.local_addr().unwrap().port();
        let unreachable_port = {
            let tmp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tmp.local_addr().unwrap().port()
        };

        let registry = registry_for(vec![
            HostConfig {
                alias: "up".into(),
                host: "127.0.0.1".into(),
                port: reachable_port,
                username: "u".into(),
                password: "p".into(),
            },
            HostConfig {
                alias: "down".into(),
                host: "127.0.0.1".into(),
                port: unreachable_port,
                username: "u".into(),
                password: "p".into(),
            },
        ]);
        let monitor = HealthMonitor::new(
            &registry,
            HealthConfig {
                probe_interval_seconds: 1,
                probe_timeout_seconds: 1,
                failure_threshold: 2,
                success_threshold: 1,
            },
        );

        // 第一轮：可达主机保持健康（无迁移），不可达主机累积一次失败
        let transitions = monitor.probe_round().await;
        assert!(transitions.is_empty(), "首轮不应有迁移: {:?}", transitions);

        // 第二轮：不可达主机达到失败阈值，发生降级迁移
        let transitions = monitor.probe_round().await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].server_name, "down");
        assert!(!transitions[0].is_healthy);
        assert_eq!(transitions[0].consecutive_failures, 2);

        let snapshots = monitor.snapshot_all().await;
        assert!(snapshots.get("up").unwrap().is_healthy);
        assert!(!snapshots.get("down").unwrap().is_healthy);
        drop(listener);
    }
}
