//! # context 模块说明
//!
//! ## 角色定位（Why）
//! - [`DispatchContext`] 是处理器回调中可用的分发器 API，每个实例绑定一个协议身份；
//! - 所有针对事务的操作都会校验“事务属于当前协议”，防止一个协议误操作另一个协议的事务。
//!
//! ## 契约说明（What）
//! - 接收类 API 只能在对应的“可用”通知之后、且仅对本协议的消息调用，否则返回
//!   [`DispatchError::InvalidState`](crate::DispatchError::InvalidState)；
//! - 异步操作的结果以 [`Completion`](crate::Completion) 回送，不会在本次调用中同步回调处理器。

use bytes::{Bytes, BytesMut};

use crate::engine::{DispatchCore, Upcall};
use crate::error::Result;
use crate::protocol::{OutgoingMessage, ProtocolId};
use crate::status::ResponseStatus;
use crate::stream::{HandshakePhase, InboundTarget, StreamHandle};
use crate::transaction::TransactionId;
use crate::transport::StreamPriority;

/// 以某个协议身份调用分发器的句柄。
pub struct DispatchContext<'a> {
    core: &'a mut DispatchCore,
    protocol: ProtocolId,
}

impl<'a> DispatchContext<'a> {
    pub(crate) fn new(core: &'a mut DispatchCore, protocol: ProtocolId) -> Self {
        Self { core, protocol }
    }

    /// 当前身份对应的协议编号。
    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    pub fn handshake_phase(&self, stream: StreamHandle) -> Result<HandshakePhase> {
        Ok(self.core.streams.get(stream)?.phase)
    }

    /// 把可用事件的消息体读入 `buffer`，原有内容被替换。
    pub fn receive_event(&mut self, stream: StreamHandle, buffer: BytesMut) -> Result<()> {
        self.core
            .receive_event(self.protocol, stream, InboundTarget::Buffer(buffer))
    }

    pub fn skip_event(&mut self, stream: StreamHandle) -> Result<()> {
        self.core.receive_event(self.protocol, stream, InboundTarget::Skip)
    }

    /// 消息体不超过短消息容量时整体交付，否则自动跳过。
    pub fn receive_short_event(&mut self, stream: StreamHandle) -> Result<()> {
        self.core.receive_event(self.protocol, stream, InboundTarget::Short)
    }

    pub fn send_event(
        &mut self,
        stream: StreamHandle,
        topic: &str,
        message: Bytes,
    ) -> Result<TransactionId> {
        self.core
            .send_event(self.protocol, stream, topic, OutgoingMessage::Shared(message))
    }

    pub fn send_mutable_event(
        &mut self,
        stream: StreamHandle,
        topic: &str,
        message: BytesMut,
    ) -> Result<TransactionId> {
        self.core
            .send_event(self.protocol, stream, topic, OutgoingMessage::Mutable(message))
    }

    /// 认领可用请求并把消息体读入 `buffer`；返回的事务用于稍后回复。
    pub fn receive_request(&mut self, stream: StreamHandle, buffer: BytesMut) -> Result<TransactionId> {
        self.core
            .receive_request(self.protocol, stream, InboundTarget::Buffer(buffer))
    }

    pub fn skip_request(&mut self, stream: StreamHandle) -> Result<TransactionId> {
        self.core.receive_request(self.protocol, stream, InboundTarget::Skip)
    }

    pub fn receive_short_request(&mut self, stream: StreamHandle) -> Result<TransactionId> {
        self.core.receive_request(self.protocol, stream, InboundTarget::Short)
    }

    pub fn send_response(
        &mut self,
        stream: StreamHandle,
        transaction: TransactionId,
        status: ResponseStatus,
        message: Bytes,
    ) -> Result<()> {
        self.core.send_response(
            self.protocol,
            stream,
            transaction,
            status,
            OutgoingMessage::Shared(message),
        )
    }

    pub fn send_mutable_response(
        &mut self,
        stream: StreamHandle,
        transaction: TransactionId,
        status: ResponseStatus,
        message: BytesMut,
    ) -> Result<()> {
        self.core.send_response(
            self.protocol,
            stream,
            transaction,
            status,
            OutgoingMessage::Mutable(message),
        )
    }

    /// 跳过可用请求的消息体，并以 `status` 与空字典回复，不创建事务。
    pub fn skip_and_reply_to_request(
        &mut self,
        stream: StreamHandle,
        status: ResponseStatus,
    ) -> Result<()> {
        self.core.skip_and_reply(self.protocol, stream, status)
    }

    pub fn send_request(
        &mut self,
        stream: StreamHandle,
        topic: &str,
        message: Bytes,
    ) -> Result<TransactionId> {
        self.core
            .send_request(self.protocol, stream, topic, OutgoingMessage::Shared(message))
    }

    pub fn send_mutable_request(
        &mut self,
        stream: StreamHandle,
        topic: &str,
        message: BytesMut,
    ) -> Result<TransactionId> {
        self.core
            .send_request(self.protocol, stream, topic, OutgoingMessage::Mutable(message))
    }

    pub fn receive_response(
        &mut self,
        stream: StreamHandle,
        transaction: TransactionId,
        buffer: BytesMut,
    ) -> Result<()> {
        self.core.receive_response(
            self.protocol,
            stream,
            transaction,
            InboundTarget::Buffer(buffer),
        )
    }

    pub fn skip_response(&mut self, stream: StreamHandle, transaction: TransactionId) -> Result<()> {
        self.core
            .receive_response(self.protocol, stream, transaction, InboundTarget::Skip)
    }

    pub fn receive_short_response(
        &mut self,
        stream: StreamHandle,
        transaction: TransactionId,
    ) -> Result<()> {
        self.core
            .receive_response(self.protocol, stream, transaction, InboundTarget::Short)
    }

    /// 把最低优先级转交给传输层。
    pub fn set_minimum_priority(&mut self, stream: StreamHandle, priority: StreamPriority) -> Result<()> {
        self.core.set_minimum_priority(stream, priority)
    }

    /// 放弃一条不在收发中的事务。
    ///
    /// 流已失效时视为成功；事务正在收发时返回 `InvalidState`。
    pub fn clear_transaction(&mut self, stream: StreamHandle, transaction: TransactionId) -> Result<()> {
        self.core.clear_transaction(self.protocol, stream, transaction)
    }

    /// 主动让流失效，同时通知传输层拆除连接。
    pub fn invalidate(&mut self, stream: StreamHandle) -> Result<()> {
        self.core.streams.get(stream)?;
        self.core.invalidate(stream, true);
        Ok(())
    }

    pub(crate) fn set_handshake_phase(&mut self, stream: StreamHandle, phase: HandshakePhase) -> Result<()> {
        self.core.streams.get_mut(stream)?.phase = phase;
        Ok(())
    }

    /// 握手完成后按注册顺序通知其余协议。
    pub(crate) fn announce_accept(&mut self, stream: StreamHandle) {
        let protocols: Vec<ProtocolId> = self.core.registry.user_ids().collect();
        for protocol in protocols {
            self.core.push(Upcall::Accept { protocol, stream });
        }
    }
}
