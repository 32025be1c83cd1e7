// gateway_models/src/codes.rs

//! 协议层统一的数字错误码定义。
//!
//! 所有通过 WebSocket 下发给客户端的 `error` 帧都必须携带本模块中定义的
//! 五位数字错误码。错误码按来源分组：
//! - `2xxxx`: SSH / SCP 传输层错误；
//! - `3xxxx`: WebSocket 协议层错误；
//! - `5xxxx`: 会话 / 锁 / 任务管理错误。
//!
//! 前端 TypeScript 侧持有同一张表，双方通过数字而非字符串对齐语义，
//! 因此这些常量一旦发布就不应再变更取值。

/// SSH 连接建立失败（主机不可达、握手失败等）。
pub const SSH_CONNECT_FAILED: u32 = 20000;
/// SSH 连接在规定时限内未完成。
pub const SSH_CONNECT_TIMEOUT: u32 = 20001;
/// SSH 认证被远端拒绝。
pub const SSH_AUTH_FAILED: u32 = 21000;
/// 交互式命令执行失败（含执行超时与取消）。
pub const SSH_COMMAND_FAILED: u32 = 22000;
/// SCP 服务器间文件传输失败（含取消）。
pub const SCP_FAILED: u32 = 24000;
/// 主机健康检查子系统错误。
pub const HEALTH_CHECK_FAILED: u32 = 25000;

/// WebSocket 连接建立失败。
pub const WS_CONNECT_FAILED: u32 = 30000;
/// 入站消息不是合法的 JSON，或缺少必需字段。
pub const WS_MESSAGE_INVALID: u32 = 31000;
/// 入站消息的 `type` 不对应任何已注册的处理器。
pub const WS_HANDLER_NOT_FOUND: u32 = 32000;

/// 会话锁已被其他连接持有。
pub const SESSION_ALREADY_ACTIVE: u32 = 50004;
/// 当前没有任何活动会话。
pub const NO_ACTIVE_SESSION: u32 = 50005;
/// 会话锁由其他连接持有，调用方不是持有者。
pub const NOT_SESSION_OWNER: u32 = 50006;
/// 目标资源已被锁定。
pub const RESOURCE_LOCKED: u32 = 50008;
/// 该连接已有一个任务在执行中。
pub const TASK_ALREADY_RUNNING: u32 = 50010;
/// 该连接当前没有进行中的任务。
pub const TASK_NOT_FOUND: u32 = 50011;
/// 任务在取消等待时限内未终止。
pub const TASK_CANCEL_TIMEOUT: u32 = 50012;
/// 任务取消流程本身失败。
pub const TASK_CANCEL_FAILED: u32 = 50013;
/// 任务句柄清理失败。
pub const TASK_CLEANUP_FAILED: u32 = 50014;
