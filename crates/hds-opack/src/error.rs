//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 汇总 OPACK 读写过程中可能出现的全部失败，供分发器统一映射为“数据非法”或“资源不足”；
//! - 每个变体附带稳定错误码，日志与测试可以基于错误码断言而不是匹配文本。
//!
//! ## 设计要求（What）
//! - 读取侧错误一律代表输入字节不可信，调用方不应尝试部分恢复；
//! - 写入侧仅会返回 [`OpackError::OutOfResources`]，且失败时缓冲区保持调用前的内容。

use thiserror::Error;

/// OPACK 编解码错误的稳定错误码集合。
pub mod codes {
    /// 输入在读取完整条目前结束。
    pub const TRUNCATED: &str = "opack.truncated";
    /// 标签合法但与期望的条目类型不符。
    pub const UNEXPECTED_TAG: &str = "opack.unexpected_tag";
    /// 标签未定义。
    pub const UNKNOWN_TAG: &str = "opack.unknown_tag";
    /// 嵌套层级超过上限。
    pub const RECURSION_LIMIT: &str = "opack.recursion_limit";
    /// 字符串不是合法 UTF-8 或包含 NUL。
    pub const INVALID_STRING: &str = "opack.invalid_string";
    /// 数值无法精确表示为目标类型。
    pub const NOT_EXACT: &str = "opack.not_exact";
    /// 字典中同一个被请求的键出现多次。
    pub const DUPLICATE_KEY: &str = "opack.duplicate_key";
    /// 顶层条目之后仍有多余字节。
    pub const TRAILING_ITEMS: &str = "opack.trailing_items";
    /// 写入器容量不足。
    pub const OUT_OF_RESOURCES: &str = "opack.out_of_resources";
}

/// OPACK 读写错误。
///
/// # 教案式说明
/// - **意图 (Why)**：把“数据非法 / 空间不足”两类粗粒度错误细化为可诊断的变体，
///   同时保留 [`OpackError::is_invalid_data`] 让调用方按粗粒度分类处理；
/// - **契约 (What)**：除 `OutOfResources` 外的变体都表示输入数据非法；
/// - **风险 (Trade-offs)**：`what` 字段使用 `&'static str`，避免在热路径上分配字符串。
#[derive(Clone, Debug, Error, PartialEq)]
pub enum OpackError {
    /// 数据在读取 `what` 时提前结束。
    #[error("opack data truncated while reading {what}")]
    Truncated { what: &'static str },

    /// 读取到的标签不是 `expected` 类型。
    #[error("opack tag 0x{tag:02X} is not a {expected}")]
    UnexpectedTag { tag: u8, expected: &'static str },

    /// 标签未定义。
    #[error("unknown opack tag 0x{tag:02X}")]
    UnknownTag { tag: u8 },

    /// 嵌套层级过深。
    #[error("opack item exceeds the maximum nesting depth")]
    RecursionLimit,

    /// 字符串内容非法。
    #[error("opack string is invalid: {reason}")]
    InvalidString { reason: &'static str },

    /// 数值无法精确转换。
    #[error("opack number is not an exact {what}")]
    NotExact { what: &'static str },

    /// 重复的字典键。
    #[error("duplicate opack dictionary key `{key}`")]
    DuplicateKey { key: String },

    /// 顶层条目之后存在多余内容。
    #[error("additional opack items present after the top-level item")]
    TrailingItems,

    /// 写入所需字节数超过剩余容量。
    #[error("not enough room to write opack item: needed {needed} bytes, {available} available")]
    OutOfResources { needed: usize, available: usize },
}

impl OpackError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => codes::TRUNCATED,
            Self::UnexpectedTag { .. } => codes::UNEXPECTED_TAG,
            Self::UnknownTag { .. } => codes::UNKNOWN_TAG,
            Self::RecursionLimit => codes::RECURSION_LIMIT,
            Self::InvalidString { .. } => codes::INVALID_STRING,
            Self::NotExact { .. } => codes::NOT_EXACT,
            Self::DuplicateKey { .. } => codes::DUPLICATE_KEY,
            Self::TrailingItems => codes::TRAILING_ITEMS,
            Self::OutOfResources { .. } => codes::OUT_OF_RESOURCES,
        }
    }

    /// 是否属于“输入数据非法”一类。
    pub fn is_invalid_data(&self) -> bool {
        !matches!(self, Self::OutOfResources { .. })
    }
}

/// crate 内统一使用的结果别名。
pub type Result<T, E = OpackError> = core::result::Result<T, E>;
