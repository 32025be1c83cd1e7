// gateway_server/src/host_registry.rs

//! 主机别名与传输配方的只读注册表。
//!
//! 注册表在启动时由已校验的配置构建一次，之后只读。所有查询是 O(1) 的
//! `HashMap` 查找；未命中的别名/配方名是领域错误，由调用方转换为对客户端
//! 的 `error` 帧，而不是 panic。

use std::collections::HashMap;

use gateway_models::{HostConfig, TransferRecipe};
use log::info;

use crate::config::GatewaySettings;
use crate::error::GatewayError;

/// 不可变的主机/配方查找表。
#[derive(Debug, Clone)]
pub struct HostRegistry {
    hosts: HashMap<String, HostConfig>,
    transfers: HashMap<String, TransferRecipe>,
}

impl HostRegistry {
    /// 由已通过 `GatewaySettings::validate` 的配置构建注册表。
    ///
    /// 别名唯一性已在配置校验阶段保证，这里再做一次防御性检查，
    /// 重复键视为配置错误向上返回。
    pub fn from_settings(settings: &GatewaySettings) -> Result<Self, GatewayError> {
        let mut hosts = HashMap::with_capacity(settings.hosts.len());
        for host in &settings.hosts {
            if hosts.insert(host.alias.clone(), host.clone()).is_some() {
                return Err(GatewayError::ConfigError(format!(
                    "主机别名 '{}' 重复定义",
                    host.alias
                )));
            }
        }
        let mut transfers = HashMap::with_capacity(settings.transfers.len());
        for recipe in &settings.transfers {
            if transfers.insert(recipe.name.clone(), recipe.clone()).is_some() {
                return Err(GatewayError::ConfigError(format!(
                    "传输配方 '{}' 重复定义",
                    recipe.name
                )));
            }
        }
        info!(
            "[主机注册表] 已构建只读注册表。主机数: {}, 传输配方数: {}",
            hosts.len(),
            transfers.len()
        );
        Ok(Self { hosts, transfers })
    }

    /// 将主机别名解析为连接配置。
    pub fn resolve_host(&self, alias: &str) -> Result<&HostConfig, GatewayError> {
        self.hosts
            .get(alias)
            .ok_or_else(|| GatewayError::UnknownHostAlias(alias.to_string()))
    }

    /// 将传输配方名解析为配方定义。
    pub fn resolve_transfer(&self, name: &str) -> Result<&TransferRecipe, GatewayError> {
        self.transfers
            .get(name)
            .ok_or_else(|| GatewayError::UnknownTransferRecipe(name.to_string()))
    }

    /// 返回全部已注册主机（遍历用，不保证顺序）。
    pub fn all_hosts(&self) -> impl Iterator<Item = &HostConfig> {
        self.hosts.values()
    }

    /// 已注册主机数量。
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_two_hosts() -> HostRegistry {
        let settings = GatewaySettings {
            hosts: vec![
                HostConfig {
                    alias: "mdwap1p".to_string(),
                    host: "10.0.0.1".to_string(),
                    port: 22,
                    username: "batch".to_string(),
                    password: "pw1".to_string(),
                },
                HostConfig {
                    alias: "mypap1d".to_string(),
                    host: "10.0.0.2".to_string(),
                    port: 22,
                    username: "batch".to_string(),
                    password: "pw2".to_string(),
                },
            ],
            transfers: vec![TransferRecipe {
                name: "stub_data_transfer".to_string(),
                source_alias: "mdwap1p".to_string(),
                source_path: "/out/*.dat".to_string(),
                dest_alias: "mypap1d".to_string(),
                dest_path: "/in/".to_string(),
            }],
            ..Default::default()
        };
        HostRegistry::from_settings(&settings).expect("注册表构建失败")
    }

    #[test]
    fn test_resolve_host_hit_and_miss() {
        let registry = registry_with_two_hosts();
        assert_eq!(registry.resolve_host("mdwap1p").unwrap().host, "10.0.0.1");
        let miss = registry.resolve_host("wdexgm1p");
        assert!(matches!(miss, Err(GatewayError::UnknownHostAlias(alias)) if alias == "wdexgm1p"));
    }

    #[test]
    fn test_resolve_transfer_hit_and_miss() {
        let registry = registry_with_two_hosts();
        let recipe = registry.resolve_transfer("stub_data_transfer").unwrap();
        assert_eq!(recipe.dest_alias, "mypap1d");
        assert!(matches!(
            registry.resolve_transfer("nope"),
            Err(GatewayError::UnknownTransferRecipe(_))
        ));
    }

    #[test]
    fn test_all_hosts_enumerates_every_entry() {
        let registry = registry_with_two_hosts();
        assert_eq!(registry.host_count(), 2);
        let mut aliases: Vec<_> = registry.all_hosts().map(|h| h.alias.clone()).collect();
        aliases.sort();
        assert_eq!(aliases, vec!["mdwap1p", "mypap1d"]);
    }
}
