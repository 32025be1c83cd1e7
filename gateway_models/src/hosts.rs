// gateway_models/src/hosts.rs

//! 主机别名与服务器间传输配方的配置模型。
//!
//! 这两个结构体在服务启动时从配置文件反序列化一次，之后在进程生命周期内
//! 保持不可变。`HostConfig` 将一个符号化的主机别名（例如 `mdwap1p`）解析为
//! 具体的 SSH 端点与凭据；`TransferRecipe` 描述一条命名的服务器间文件
//! 拷贝规则（源别名 + 源路径 → 目标别名 + 目标路径）。

use serde::{Deserialize, Serialize};

/// 单个受管 SSH 主机的连接配置。
///
/// 注意：`password` 字段绝不允许出现在任何日志输出中，
/// 因此本类型手动实现 `Debug` 并对密码做脱敏处理。
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct HostConfig {
    /// 主机的符号化别名，在配置表内唯一。客户端只通过别名引用主机。
    pub alias: String,
    /// 主机地址（IP 或域名），不允许为空。
    pub host: String,
    /// SSH 端口号，取值范围 1..=65535。
    pub port: u16,
    /// SSH 登录用户名。
    pub username: String,
    /// SSH 登录密码（仅支持密码认证）。
    pub password: String,
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 密码脱敏，凭据不落日志
        f.debug_struct("HostConfig")
            .field("alias", &self.alias)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// 一条命名的服务器间文件传输配方。
///
/// `source_alias` 与 `dest_alias` 都必须能在主机配置表中解析成功，
/// 这一约束在配置加载阶段校验，运行期可以假定其成立。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferRecipe {
    /// 配方名称，客户端通过该名称发起传输。
    pub name: String,
    /// 源主机别名。传输由源主机驱动。
    pub source_alias: String,
    /// 源路径（允许 glob 模式，由远端 shell 展开）。
    pub source_path: String,
    /// 目标主机别名。
    pub dest_alias: String,
    /// 目标路径。
    pub dest_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_debug_redacts_password() {
        let host = HostConfig {
            alias: "mdwap1p".to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            username: "batch".to_string(),
            password: "super-secret".to_string(),
        };
        let rendered = format!("{:?}", host);
        assert!(!rendered.contains("super-secret"), "Debug 输出不应包含明文密码");
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("mdwap1p"));
    }

    #[test]
    fn test_transfer_recipe_serialization_roundtrip() {
        let recipe = TransferRecipe {
            name: "stub_data_transfer".to_string(),
            source_alias: "mdwap1p".to_string(),
            source_path: "/data/out/*.dat".to_string(),
            dest_alias: "mypap1d".to_string(),
            dest_path: "/data/in/".to_string(),
        };
        let json = serde_json::to_string(&recipe).expect("TransferRecipe 序列化失败");
        let back: TransferRecipe = serde_json::from_str(&json).expect("TransferRecipe 反序列化失败");
        assert_eq!(recipe, back);
    }
}
