//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为分发器对外暴露的错误语义提供集中定义：处理器调用 API 时的同步失败，
//!   以及异步完成回调中唯一可能出现的 `InvalidState`；
//! - 区分“与流失效竞态”“线上数据非法”“出站消息超预算”三类根因，方便排障与告警。
//!
//! ## 设计要求（What）
//! - 完成回调只会携带 `Ok(())` 或 [`DispatchError::InvalidState`]；
//! - [`DispatchError::InvalidData`] 仅在内部出现，它总会导致整条流失效，不会被递交给事务；
//! - 每个变体都有稳定错误码，见 [`codes`]。
//!
//! ## 扩展建议（How）
//! - 新增变体时同步补充错误码，并确认它不会出现在完成回调路径上。

use thiserror::Error;

use crate::header::MessageKind;

/// 分发器稳定错误码。
///
/// 错误码遵循 `<领域>.<语义>` 命名，便于在日志中检索与聚合。
pub mod codes {
    /// 操作与流失效竞态，或在错误的流/事务状态下调用。
    pub const INVALID_STATE: &str = "hds.dispatch.invalid_state";
    /// 线上字节格式非法。
    pub const INVALID_DATA: &str = "hds.dispatch.invalid_data";
    /// 出站消息超出暂存或报文头预算。
    pub const OUT_OF_RESOURCES: &str = "hds.dispatch.out_of_resources";
    /// 协议名与主题无法组成不超过 255 字节的报文头。
    pub const HEADER_BUDGET_EXCEEDED: &str = "hds.dispatch.header_budget_exceeded";
    /// 流句柄不存在或已被复用。
    pub const UNKNOWN_STREAM: &str = "hds.dispatch.unknown_stream";
    /// 事务标识不存在或已被回收。
    pub const UNKNOWN_TRANSACTION: &str = "hds.dispatch.unknown_transaction";
}

/// 分发器错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：以枚举取代裸整数错误码，让调用方通过模式匹配区分失败原因；
/// - **契约 (What)**：所有变体均可克隆、比较，测试可直接断言具体变体；
/// - **设计权衡 (Trade-offs)**：上下文使用 `&'static str` 描述触发位置，只有报文头预算错误
///   携带拥有所有权的协议名与主题，便于日志中完整还原被拒绝的组合。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DispatchError {
    /// 操作在当前状态下不可执行，或所在流已经失效。
    ///
    /// - **意图 (Why)**：这是完成回调中唯一可能出现的错误，表示操作被流失效中止；
    /// - **契约 (What)**：不可重试，调用方应放弃该操作并释放相关资源。
    #[error("invalid state: {context}")]
    InvalidState { context: &'static str },

    /// 线上字节格式非法。
    ///
    /// - **契约 (What)**：内部检测到后会立即使整条流失效，不会出现在完成回调中。
    #[error("invalid data: {context}")]
    InvalidData { context: &'static str },

    /// 出站消息无法放入暂存空间。
    ///
    /// - **契约 (What)**：同步返回给构造消息的调用方，不经过完成回调。
    #[error("out of resources: {context}")]
    OutOfResources { context: &'static str },

    /// 协议名与主题组合无法形成合法报文头。
    ///
    /// - **意图 (Why)**：在创建事务之前拒绝，避免已入队的事务在发送阶段才暴露问题；
    /// - **风险 (Trade-offs)**：请求类消息以“响应报文头”预算校验，因为对端必须能回复。
    #[error("{kind:?} header for `{protocol}.{topic}` exceeds 255 bytes")]
    HeaderBudgetExceeded {
        protocol: String,
        topic: String,
        kind: MessageKind,
    },

    /// 流句柄不属于任何活跃的流。
    #[error("unknown or stale stream handle")]
    UnknownStream,

    /// 事务标识不属于该流上的活跃事务。
    #[error("unknown or stale transaction")]
    UnknownTransaction,
}

impl DispatchError {
    /// 返回稳定错误码，供日志聚合或测试断言使用。
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidState { .. } => codes::INVALID_STATE,
            Self::InvalidData { .. } => codes::INVALID_DATA,
            Self::OutOfResources { .. } => codes::OUT_OF_RESOURCES,
            Self::HeaderBudgetExceeded { .. } => codes::HEADER_BUDGET_EXCEEDED,
            Self::UnknownStream => codes::UNKNOWN_STREAM,
            Self::UnknownTransaction => codes::UNKNOWN_TRANSACTION,
        }
    }

    pub(crate) fn invalid_state(context: &'static str) -> Self {
        Self::InvalidState { context }
    }

    pub(crate) fn invalid_data(context: &'static str) -> Self {
        Self::InvalidData { context }
    }
}

impl From<hds_opack::OpackError> for DispatchError {
    fn from(error: hds_opack::OpackError) -> Self {
        if error.is_invalid_data() {
            Self::invalid_data("malformed opack payload")
        } else {
            Self::OutOfResources {
                context: "opack writer capacity exhausted",
            }
        }
    }
}

/// crate 内统一使用的结果别名。
pub type Result<T, E = DispatchError> = core::result::Result<T, E>;
