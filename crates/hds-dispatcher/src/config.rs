//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 收敛分发器构造期的全部静态参数：流表大小、超时（上限一天）、短消息容量、最大包长，
//!   以及内置 `control` 协议的版本常量；
//! - 支持从 TOML 文本加载，使宿主可以在部署配置中调整而无需重新编译。
//!
//! ## 设计要求（What）
//! - 所有字段都有默认值，缺省时与协议规定的常量一致；
//! - 未知字段一律拒绝，避免拼写错误被静默忽略；
//! - 解析后立即校验取值范围，非法配置通过 [`ConfigError::Invalid`] 报告。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 传输层允许的最大包长（`2^20 - 1` 字节）。
pub const MAX_PACKET_LEN: u32 = (1 << 20) - 1;

/// 事务超时的上限（一天，毫秒）；更长的时限会让定时器截止时间越过 `Instant` 的表示范围。
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// 分发器构造期配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    /// 流表大小，即可同时接入的最大流数量。
    pub max_streams: usize,
    /// 发送事件事务的超时（毫秒）。
    pub event_timeout_ms: u64,
    /// 发送请求事务的超时（毫秒），覆盖从入队到收到响应的全过程。
    pub request_timeout_ms: u64,
    /// 短接收允许的最大消息体长度；超过该长度的“短接收”会被自动跳过。
    pub short_message_capacity: usize,
    /// 单个入站包允许的最大长度。
    pub max_packet_len: u32,
    /// 内置 `control` 协议参数。
    pub control: ControlConfig,
}

/// 内置 `control` 协议参数。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    /// 在 `control.version` 响应中报告的本端版本。
    pub accessory_version: f64,
    /// 握手后、收到 `control.version` 之前假定的对端版本。
    pub default_peer_version: f64,
    /// 允许发送 hello 心跳的最低对端版本。
    pub min_peer_version_for_ping: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_streams: 2,
            event_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            short_message_capacity: 200,
            max_packet_len: MAX_PACKET_LEN,
            control: ControlConfig::default(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            accessory_version: 1.1,
            default_peer_version: 1.0,
            min_peer_version_for_ping: 1.1,
        }
    }
}

/// 配置加载错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 文本无法解析，或包含未知字段。
    #[error("failed to parse dispatcher config: {0}")]
    Parse(#[from] toml::de::Error),

    /// 字段取值越界。
    #[error("invalid dispatcher config field `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl DispatcherConfig {
    /// 从 TOML 文本解析并校验配置。
    ///
    /// # 契约说明（What）
    /// - 缺省字段取默认值；
    /// - 出现未知字段时返回 [`ConfigError::Parse`]；
    /// - 取值越界时返回 [`ConfigError::Invalid`]。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });
        if self.max_streams == 0 {
            return invalid("max_streams", "stream table must hold at least one stream");
        }
        if usize::from(u16::MAX) < self.max_streams {
            return invalid("max_streams", "stream handles are limited to 16 bits");
        }
        if self.event_timeout_ms == 0 || self.event_timeout_ms > MAX_TIMEOUT_MS {
            return invalid("event_timeout_ms", "timeout must be within 1..=86400000");
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return invalid("request_timeout_ms", "timeout must be within 1..=86400000");
        }
        if self.max_packet_len == 0 || self.max_packet_len > MAX_PACKET_LEN {
            return invalid("max_packet_len", "must be within 1..=1048575");
        }
        if !self.control.accessory_version.is_finite()
            || !self.control.default_peer_version.is_finite()
            || !self.control.min_peer_version_for_ping.is_finite()
        {
            return invalid("control", "versions must be finite numbers");
        }
        Ok(())
    }

    pub(crate) fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
