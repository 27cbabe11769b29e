//! # protocol 模块说明
//!
//! ## 角色定位（Why）
//! - 定义协议处理器的能力集 [`DataStreamProtocol`]：分发器按报文头中的协议名把入站事件、
//!   请求与响应派发给对应处理器，并把异步操作的结果以 [`Completion`] 回送；
//! - 维护协议注册表：名称两两不同，且都不能占用保留名 `control`。
//!
//! ## 契约说明（What）
//! - 处理器的所有回调都在分发器排空回调队列时被调用，同一处理器不会被重入；
//! - 回调中通过 [`DispatchContext`] 以“当前协议”的身份调用分发器 API；
//! - 完成事件只携带 `Ok(())` 或 [`DispatchError::InvalidState`](crate::DispatchError::InvalidState)，
//!   并把调用方交出的缓冲原样交还。

use core::fmt;

use bytes::{Bytes, BytesMut};

use crate::context::DispatchContext;
use crate::error::Result;
use crate::status::ResponseStatus;
use crate::stream::StreamHandle;
use crate::transaction::TransactionId;

/// 内置握手协议的保留名称。
pub const CONTROL_PROTOCOL_NAME: &str = "control";

/// 注册表中的协议编号；`0` 固定为内置 `control` 协议，其余按注册顺序递增。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProtocolId(u16);

impl ProtocolId {
    pub const CONTROL: Self = Self(0);

    pub const fn is_control(self) -> bool {
        self.0 == 0
    }

    /// 在用户协议列表中的下标。
    pub(crate) fn user_index(self) -> Option<usize> {
        usize::from(self.0).checked_sub(1)
    }

    pub(crate) fn from_user_index(index: usize) -> Self {
        Self((index + 1) as u16)
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol#{}", self.0)
    }
}

/// 待发送的消息体。
///
/// `Shared` 只会被读取；`Mutable` 允许分发器在发送过程中占用并改写，完成时交还。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutgoingMessage {
    Shared(Bytes),
    Mutable(BytesMut),
}

impl OutgoingMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Shared(bytes) => bytes.len(),
            Self::Mutable(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 生成交给传输层的字节视图。
    pub(crate) fn to_bytes(&self) -> Bytes {
        match self {
            Self::Shared(bytes) => bytes.clone(),
            Self::Mutable(bytes) => Bytes::copy_from_slice(bytes),
        }
    }
}

impl Default for OutgoingMessage {
    fn default() -> Self {
        Self::Shared(Bytes::new())
    }
}

/// 接收完成时交还的消息体。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReceivedMessage {
    /// 调用方提供的缓冲，内容已替换为消息体。
    Buffer(BytesMut),
    /// 短接收得到的消息体，长度不超过短消息容量。
    Short(Bytes),
    /// 消息体被跳过，包括短接收因超长而自动跳过的情况。
    Skipped { len: usize },
}

impl ReceivedMessage {
    /// 消息体字节；被跳过时为空。
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Buffer(bytes) => bytes,
            Self::Short(bytes) => bytes,
            Self::Skipped { .. } => &[],
        }
    }
}

/// 异步操作的完成事件。
///
/// 每个变体对应一种 API 调用，`result` 为 `Err` 时表示所在流在操作完成前失效。
#[derive(Debug)]
pub enum Completion {
    /// `receive_event` / `skip_event` / `receive_short_event`。
    EventReceived {
        stream: StreamHandle,
        topic: String,
        message: ReceivedMessage,
        result: Result<()>,
    },
    /// `send_event` / `send_mutable_event`。
    EventSent {
        stream: StreamHandle,
        transaction: TransactionId,
        topic: String,
        message: OutgoingMessage,
        result: Result<()>,
    },
    /// `send_request` / `send_mutable_request` 的请求已写出。
    RequestSent {
        stream: StreamHandle,
        transaction: TransactionId,
        topic: String,
        message: OutgoingMessage,
        result: Result<()>,
    },
    /// `receive_request` / `skip_request` / `receive_short_request`。
    RequestReceived {
        stream: StreamHandle,
        transaction: TransactionId,
        topic: String,
        message: ReceivedMessage,
        result: Result<()>,
    },
    /// `send_response` / `send_mutable_response`。
    ResponseSent {
        stream: StreamHandle,
        transaction: TransactionId,
        topic: String,
        status: ResponseStatus,
        message: OutgoingMessage,
        result: Result<()>,
    },
    /// `receive_response` / `skip_response` / `receive_short_response`。
    ResponseReceived {
        stream: StreamHandle,
        transaction: TransactionId,
        topic: String,
        status: ResponseStatus,
        message: ReceivedMessage,
        result: Result<()>,
    },
    /// `skip_and_reply_to_request`。
    RequestReplied {
        stream: StreamHandle,
        topic: String,
        status: ResponseStatus,
        result: Result<()>,
    },
}

impl Completion {
    pub fn stream(&self) -> StreamHandle {
        match self {
            Self::EventReceived { stream, .. }
            | Self::EventSent { stream, .. }
            | Self::RequestSent { stream, .. }
            | Self::RequestReceived { stream, .. }
            | Self::ResponseSent { stream, .. }
            | Self::ResponseReceived { stream, .. }
            | Self::RequestReplied { stream, .. } => *stream,
        }
    }

    pub fn result(&self) -> &Result<()> {
        match self {
            Self::EventReceived { result, .. }
            | Self::EventSent { result, .. }
            | Self::RequestSent { result, .. }
            | Self::RequestReceived { result, .. }
            | Self::ResponseSent { result, .. }
            | Self::ResponseReceived { result, .. }
            | Self::RequestReplied { result, .. } => result,
        }
    }
}

/// 协议处理器能力集。
///
/// # 教案式说明
/// - **意图 (Why)**：以 trait 取代函数指针回调表，编译器即可保证事件与请求两个入口都已实现；
/// - **契约 (What)**：
///   - `handle_event_available` / `handle_request_available` 被调用后，处理器必须（同步或稍后
///     通过 [`Dispatcher::with_protocol`](crate::Dispatcher::with_protocol)）选择接收、短接收或跳过，
///     在此之前该流不会再读取新的入站包；
///   - `handle_invalidate` 中不得再发起收发操作，只允许清理自身状态；
/// - **风险 (Trade-offs)**：默认的 `handle_response_available` 直接跳过响应体，
///   需要读取响应的协议必须覆写它。
pub trait DataStreamProtocol {
    /// 协议名，注册后不可变化。
    fn name(&self) -> &str;

    /// 流完成握手后按注册顺序通知。
    fn handle_accept(&mut self, ctx: &mut DispatchContext<'_>, stream: StreamHandle);

    /// 已完成握手的流失效后按注册顺序通知。
    fn handle_invalidate(&mut self, ctx: &mut DispatchContext<'_>, stream: StreamHandle);

    fn handle_event_available(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        topic: &str,
        len: usize,
    );

    fn handle_request_available(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        topic: &str,
        len: usize,
    );

    /// 本协议发出的请求收到了响应报文头。
    fn handle_response_available(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        transaction: TransactionId,
        topic: &str,
        status: ResponseStatus,
        len: usize,
    ) {
        let _ = (topic, status, len);
        if let Err(err) = ctx.skip_response(stream, transaction) {
            tracing::debug!(
                target: "hds_dispatcher::protocol",
                stream = %stream,
                error = %err,
                "failed to skip unhandled response"
            );
        }
    }

    fn handle_completion(&mut self, ctx: &mut DispatchContext<'_>, completion: Completion);
}

/// 协议名注册表。
pub(crate) struct ProtocolRegistry {
    names: Vec<String>,
}

impl ProtocolRegistry {
    /// 以内置 `control` 协议打头建立注册表。
    ///
    /// # Panics
    /// 名称为空、重复或等于 `control` 时 panic：注册表属于构造期静态配置。
    pub(crate) fn new<'a>(user_names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut names = vec![CONTROL_PROTOCOL_NAME.to_owned()];
        for name in user_names {
            assert!(!name.is_empty(), "data stream protocol names must not be empty");
            assert!(
                name != CONTROL_PROTOCOL_NAME,
                "data stream protocol name `{CONTROL_PROTOCOL_NAME}` is reserved"
            );
            assert!(
                !names.iter().any(|existing| existing == name),
                "data stream protocol `{name}` is registered twice"
            );
            assert!(
                names.len() <= usize::from(u16::MAX),
                "too many data stream protocols"
            );
            names.push(name.to_owned());
        }
        Self { names }
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<ProtocolId> {
        self.names
            .iter()
            .position(|candidate| candidate == name)
            .map(|index| ProtocolId(index as u16))
    }

    pub(crate) fn name(&self, id: ProtocolId) -> Option<&str> {
        self.names.get(usize::from(id.0)).map(String::as_str)
    }

    /// 除 `control` 外的协议编号，按注册顺序。
    pub(crate) fn user_ids(&self) -> impl Iterator<Item = ProtocolId> + '_ {
        (0..self.names.len() - 1).map(ProtocolId::from_user_index)
    }
}
