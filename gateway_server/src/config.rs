// gateway_server/src/config.rs

//! 应用配置的加载、校验与全局访问。
//!
//! 配置从一个 JSON 设置文件读取，文件路径由环境变量 `GATEWAY_SETTINGS_PATH`
//! 指定（缺省为当前目录下的 `gateway_settings.json`）。配置只在进程启动时
//! 读取一次；任何解析或校验失败都会使启动失败，而不是退回默认值 ——
//! 主机凭据与传输配方没有可用的默认值。

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use gateway_models::{HostConfig, TransferRecipe};

use crate::error::GatewayError;

/// 设置文件路径的环境变量名。
pub const SETTINGS_PATH_ENV: &str = "GATEWAY_SETTINGS_PATH";
/// WebSocket 服务的默认主机地址。
pub const DEFAULT_WS_HOST: &str = "0.0.0.0";
/// WebSocket 服务的默认端口号。
pub const DEFAULT_WS_PORT: u16 = 8088;

/// WebSocket 服务端详细配置结构体。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebSocketConfig {
    /// WebSocket 服务绑定的主机地址
    pub host: String,
    /// WebSocket 服务监听的端口号
    pub port: u16,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_WS_HOST.to_string(), // 默认监听所有网络接口
            port: DEFAULT_WS_PORT,             // 默认监听 8088 端口
        }
    }
}

/// 主机健康监视器的配置。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthConfig {
    /// 探测轮次之间的间隔（单位：秒）
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    /// 单次 TCP 探测的超时（单位：秒）
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    /// 健康 → 不健康 所需的连续失败次数
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// 不健康 → 健康 所需的连续成功次数
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_probe_interval_seconds() -> u64 {
    30
}
fn default_probe_timeout_seconds() -> u64 {
    5
}
fn default_failure_threshold() -> u32 {
    2
}
fn default_success_threshold() -> u32 {
    1
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval_seconds(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }
}

/// SSH 执行器相关的超时与节流配置。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SshConfig {
    /// SSH 连接建立（含认证）的超时（单位：秒）
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// 单条交互式命令的缺省超时（单位：秒）
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    /// 单次 SCP 传输的超时（单位：秒）
    #[serde(default = "default_scp_timeout_seconds")]
    pub scp_timeout_seconds: u64,
    /// 输出批量下发的最小间隔（单位：毫秒）
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// 触发立即下发的缓冲字节数阈值
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,
    /// 任务取消等待的时限（单位：秒）
    #[serde(default = "default_cancel_deadline_seconds")]
    pub cancel_deadline_seconds: u64,
}

fn default_connect_timeout_seconds() -> u64 {
    10
}
fn default_command_timeout_seconds() -> u64 {
    30
}
fn default_scp_timeout_seconds() -> u64 {
    600
}
fn default_flush_interval_ms() -> u64 {
    100
}
fn default_flush_bytes() -> usize {
    4096
}
fn default_cancel_deadline_seconds() -> u64 {
    5
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout_seconds(),
            command_timeout_seconds: default_command_timeout_seconds(),
            scp_timeout_seconds: default_scp_timeout_seconds(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_bytes: default_flush_bytes(),
            cancel_deadline_seconds: default_cancel_deadline_seconds(),
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
    pub fn scp_timeout(&self) -> Duration {
        Duration::from_secs(self.scp_timeout_seconds)
    }
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
    pub fn cancel_deadline(&self) -> Duration {
        Duration::from_secs(self.cancel_deadline_seconds)
    }
}

/// 应用的主配置结构体。
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GatewaySettings {
    /// WebSocket 服务的相关配置
    #[serde(default)]
    pub websocket: WebSocketConfig,
    /// 受管 SSH 主机表（按别名解析）
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    /// 服务器间传输配方表
    #[serde(default)]
    pub transfers: Vec<TransferRecipe>,
    /// 主机健康监视配置
    #[serde(default)]
    pub health: HealthConfig,
    /// SSH 执行器配置
    #[serde(default)]
    pub ssh: SshConfig,
}

impl GatewaySettings {
    /// 对配置做一次整体校验。任何一条不变量被破坏都使启动失败。
    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut seen_aliases = std::collections::HashSet::new();
        for host in &self.hosts {
            if host.alias.trim().is_empty() {
                return Err(GatewayError::ConfigError("主机别名不允许为空".to_string()));
            }
            if host.host.trim().is_empty() {
                return Err(GatewayError::ConfigError(format!(
                    "主机 '{}' 的地址不允许为空",
                    host.alias
                )));
            }
            if host.port == 0 {
                return Err(GatewayError::ConfigError(format!(
                    "主机 '{}' 的端口号必须在 1..=65535 范围内",
                    host.alias
                )));
            }
            if !seen_aliases.insert(host.alias.clone()) {
                return Err(GatewayError::ConfigError(format!(
                    "主机别名 '{}' 重复定义",
                    host.alias
                )));
            }
        }

        let mut seen_transfers = std::collections::HashSet::new();
        for recipe in &self.transfers {
            if recipe.name.trim().is_empty() {
                return Err(GatewayError::ConfigError("传输配方名称不允许为空".to_string()));
            }
            if !seen_transfers.insert(recipe.name.clone()) {
                return Err(GatewayError::ConfigError(format!(
                    "传输配方 '{}' 重复定义",
                    recipe.name
                )));
            }
            for alias in [&recipe.source_alias, &recipe.dest_alias] {
                if !seen_aliases.contains(alias) {
                    return Err(GatewayError::ConfigError(format!(
                        "传输配方 '{}' 引用了未定义的主机别名 '{}'",
                        recipe.name, alias
                    )));
                }
            }
        }

        if self.health.failure_threshold == 0 || self.health.success_threshold == 0 {
            return Err(GatewayError::ConfigError(
                "健康监视的迁移阈值必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}

// 全局静态应用配置实例
static GATEWAY_SETTINGS: OnceLock<GatewaySettings> = OnceLock::new();

/// 获取配置文件路径：优先使用 `GATEWAY_SETTINGS_PATH` 环境变量，
/// 否则退回当前目录下的 `gateway_settings.json`。
fn settings_file_path() -> PathBuf {
    match env::var(SETTINGS_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => {
            let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            current_dir.join("gateway_settings.json")
        }
    }
}

/// 从设置文件加载并校验配置。
///
/// 与"文件缺失则落默认值"的宽松策略不同，这里任何一步失败都向上返回错误：
/// 没有主机凭据的网关不具备可用性，静默启动只会把故障推迟到第一次使用。
pub fn load_settings() -> Result<GatewaySettings, GatewayError> {
    let path = settings_file_path();
    info!("[配置模块] 正在从 {:?} 加载网关配置...", path);

    let content = fs::read_to_string(&path).map_err(|e| {
        GatewayError::ConfigError(format!("读取配置文件 {:?} 失败: {}", path, e))
    })?;
    let settings: GatewaySettings = serde_json::from_str(&content).map_err(|e| {
        GatewayError::ConfigError(format!("解析配置文件 {:?} 失败: {}", path, e))
    })?;
    settings.validate()?;

    info!(
        "[配置模块] 网关配置加载完毕。主机数: {}, 传输配方数: {}, 监听地址: {}:{}",
        settings.hosts.len(),
        settings.transfers.len(),
        settings.websocket.host,
        settings.websocket.port
    );
    Ok(settings)
}

/// 初始化全局应用配置。失败时返回错误，由 `main` 终止启动。
pub fn init_config() -> Result<(), GatewayError> {
    let loaded = load_settings()?;
    if GATEWAY_SETTINGS.set(loaded).is_err() {
        warn!("[配置模块] 全局应用配置已被初始化，本次 init_config 调用未覆盖已有配置。请检查初始化流程。");
    }
    info!("[配置模块] 应用配置已成功初始化完毕。");
    Ok(())
}

/// 获取已加载的全局应用配置。
pub fn get_config() -> &'static GatewaySettings {
    GATEWAY_SETTINGS
        .get()
        .expect("[配置模块] 全局应用配置尚未初始化，请先调用 init_config()")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_host(alias: &str) -> HostConfig {
        HostConfig {
            alias: alias.to_string(),
            host: "10.1.2.3".to_string(),
            port: 22,
            username: "batch".to_string(),
            password: "pw".to_string(),
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_settings() {
        let settings = GatewaySettings {
            hosts: vec![sample_host("mdwap1p"), sample_host("mypap1d")],
            transfers: vec![TransferRecipe {
                name: "stub_data_transfer".to_string(),
                source_alias: "mdwap1p".to_string(),
                source_path: "/out/*.dat".to_string(),
                dest_alias: "mypap1d".to_string(),
                dest_path: "/in/".to_string(),
            }],
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_alias() {
        let settings = GatewaySettings {
            hosts: vec![sample_host("mdwap1p"), sample_host("mdwap1p")],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut host = sample_host("mdwap1p");
        host.port = 0;
        let settings = GatewaySettings {
            hosts: vec![host],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unresolved_recipe_alias() {
        let settings = GatewaySettings {
            hosts: vec![sample_host("mdwap1p")],
            transfers: vec![TransferRecipe {
                name: "broken".to_string(),
                source_alias: "mdwap1p".to_string(),
                source_path: "/out".to_string(),
                dest_alias: "no_such_host".to_string(),
                dest_path: "/in".to_string(),
            }],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_defaults_fill_timeouts() {
        let settings: GatewaySettings = serde_json::from_str(r#"{"hosts":[],"transfers":[]}"#)
            .expect("最小配置应可解析");
        assert_eq!(settings.ssh.command_timeout_seconds, 30);
        assert_eq!(settings.ssh.scp_timeout_seconds, 600);
        assert_eq!(settings.ssh.flush_interval_ms, 100);
        assert_eq!(settings.ssh.flush_bytes, 4096);
        assert_eq!(settings.health.probe_interval_seconds, 30);
        assert_eq!(settings.health.failure_threshold, 2);
    }
}
