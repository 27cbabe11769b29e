//! # transport 模块说明
//!
//! ## 角色定位（Why）
//! - 分发器本身不做 I/O：所有字节收发都委托给宿主的可靠有序传输，
//!   由宿主在操作完成后调用 `Dispatcher::handle_*_complete` 回送结果；
//! - 本模块定义两者之间的契约：分发器发出的命令（[`DataStreamTransport`]）、
//!   传输流标识与优先级、以及完成结果中可能出现的 [`TransportError`]。
//!
//! ## 契约说明（What）
//! - 同一条流上，`prepare`/`send` 与 `receive`/`skip` 各自至多只有一个未完成操作；
//! - 命令方法在调用期间不得回调分发器，完成通知必须在调用返回后再投递；
//! - `invalidate` 由分发器在内部判定流失效时调用，随后该流的迟到完成通知会被丢弃。

use bytes::Bytes;
use thiserror::Error;

/// 宿主传输层为每条流分配的标识。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TransportStreamId(pub u64);

/// 流的最低发送优先级。
///
/// 数值与平台定义保持一致，宿主可以直接映射到底层调度器。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum StreamPriority {
    #[default]
    NoPriority = 0,
    High = 5,
}

/// 传输操作失败。
///
/// 任何一个完成通知携带错误，分发器都会让整条流失效。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// 连接已断开。
    #[error("transport stream closed")]
    Closed,
    /// 其他底层失败。
    #[error("transport failure: {reason}")]
    Failed { reason: String },
}

/// 分发器向传输层发出的命令。
///
/// # 教案式说明
/// - **意图 (Why)**：把“准备发送 N 字节 / 发送一段字节 / 接收 N 字节 / 跳过 N 字节”这四个原语
///   抽象出来，使状态机与具体的加密通道、帧格式解耦；
/// - **契约 (What)**：
///   - `prepare` 声明即将发送的消息总长，完成后分发器才开始 `send` 各段字节；
///   - `send` 的各段按调用顺序写出，总长度等于 `prepare` 声明的值；
///   - `receive` 读取当前入站包中接下来的 `len` 字节，`skip` 丢弃它们；
///   - 每个命令对应恰好一次完成通知；
/// - **风险 (Trade-offs)**：方法不返回错误，失败统一经由完成通知报告，保持单一失败路径。
pub trait DataStreamTransport {
    fn prepare(&mut self, stream: TransportStreamId, total_len: usize);

    fn send(&mut self, stream: TransportStreamId, bytes: Bytes);

    fn receive(&mut self, stream: TransportStreamId, len: usize);

    fn skip(&mut self, stream: TransportStreamId, len: usize);

    /// 立即拆除该流；之后不会再有完成通知被处理。
    fn invalidate(&mut self, stream: TransportStreamId);

    fn set_minimum_priority(&mut self, stream: TransportStreamId, priority: StreamPriority);
}
