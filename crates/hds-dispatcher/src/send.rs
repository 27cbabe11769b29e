//! # send 模块说明
//!
//! ## 角色定位（Why）
//! - 发送泵：每条流同一时刻只写出一条消息，先向传输层申请整包长度，再依次写出
//!   “`HeaderLen` + 报文头”与消息体两个片段；
//! - 跳过请求体后的状态回复优先于所有排队事务，其余事务按创建顺序发送。
//!
//! ## 契约说明（What）
//! - 入队前即检查报文头预算，超出时直接返回 [`DispatchError::HeaderBudgetExceeded`]；
//! - 未完成握手的流只接受 `control` 协议的发送。

use std::collections::VecDeque;
use std::mem;

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use tracing::{debug, warn};

use crate::engine::{CompletionOwner, DispatchCore};
use crate::error::{DispatchError, Result};
use crate::header::{MAX_HEADER_LEN, MessageHeader, MessageKind, check_budget, header_len};
use crate::protocol::{CONTROL_PROTOCOL_NAME, Completion, OutgoingMessage, ProtocolId};
use crate::status::ResponseStatus;
use crate::stream::{
    HandshakePhase, PendingRequest, ReceiveState, SendStage, SendState, SendUnit, StreamHandle,
};
use crate::transaction::{Transaction, TransactionId, TransactionKind, TransactionState};
use crate::transport::{StreamPriority, TransportError};

/// 握手响应的消息体：`{"capability-version": true}`。
const HELLO_CAPABILITIES: &[u8] = &[
    0xE1, 0x52, b'c', b'a', b'p', b'a', b'b', b'i', b'l', b'i', b't', b'y', b'-', b'v', b'e', b'r',
    b's', b'i', b'o', b'n', 0x01,
];

/// 空字典。
const EMPTY_DICTIONARY: &[u8] = &[0xE0];

/// 状态回复的消息体：`control.hello` 附带能力字典，其余为空字典。
pub(crate) fn status_only_payload(request: &PendingRequest) -> Bytes {
    if request.protocol_name == CONTROL_PROTOCOL_NAME && request.topic == "hello" {
        Bytes::from_static(HELLO_CAPABILITIES)
    } else {
        Bytes::from_static(EMPTY_DICTIONARY)
    }
}

impl DispatchCore {
    /// 发送泵空闲时挑选下一条待发送的消息并申请发送空间。
    pub(crate) fn begin_sending(&mut self, handle: StreamHandle) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        if !matches!(stream.send, SendState::Idle) {
            return;
        }
        let transport = stream.transport;

        let reply_len = match mem::take(&mut stream.receive) {
            ReceiveState::WaitingForResponse(reply) => {
                let len = 1
                    + header_len(
                        MessageKind::Response,
                        &reply.request.protocol_name,
                        &reply.request.topic,
                    )
                    + status_only_payload(&reply.request).len();
                stream.receive = ReceiveState::SendingResponse(reply);
                Some(len)
            }
            other => {
                stream.receive = other;
                None
            }
        };
        if let Some(total_len) = reply_len {
            stream.send = SendState::Sending {
                unit: SendUnit::StatusOnlyResponse,
                stage: SendStage::Preparing,
            };
            debug!(
                target: "hds_dispatcher::send",
                stream = %handle,
                total_len,
                "preparing status reply"
            );
            self.transport.prepare(transport, total_len);
            return;
        }

        let Some(id) = stream
            .transactions
            .iter()
            .find(|(_, txn)| txn.state == TransactionState::WaitingForSend)
            .map(|(id, _)| id)
        else {
            return;
        };
        let Some(txn) = stream.transactions.get_mut(id) else {
            return;
        };
        let (kind, state) = match txn.kind {
            TransactionKind::SendEvent => (MessageKind::Event, TransactionState::SendingEvent),
            TransactionKind::SendRequest => (MessageKind::Request, TransactionState::SendingRequest),
            TransactionKind::ReceiveRequest => {
                (MessageKind::Response, TransactionState::SendingResponse)
            }
        };
        txn.state = state;
        let name = self.registry.name(txn.protocol).unwrap_or_default();
        let total_len = 1
            + header_len(kind, name, &txn.topic)
            + txn.message.as_ref().map_or(0, OutgoingMessage::len);
        debug!(
            target: "hds_dispatcher::send",
            stream = %handle,
            transaction = %id,
            protocol = name,
            topic = txn.topic.as_str(),
            total_len,
            "preparing message"
        );
        stream.send = SendState::Sending {
            unit: SendUnit::Transaction(id),
            stage: SendStage::Preparing,
        };
        self.transport.prepare(transport, total_len);
    }

    pub(crate) fn handle_prepare_complete(
        &mut self,
        handle: StreamHandle,
        result: Result<(), TransportError>,
    ) {
        if let Err(err) = result {
            warn!(
                target: "hds_dispatcher::send",
                stream = %handle,
                error = %err,
                "transport prepare failed"
            );
            self.invalidate(handle, true);
            return;
        }
        let pieces = match self.build_pieces(handle) {
            Ok(pieces) => pieces,
            Err(err) => {
                warn!(
                    target: "hds_dispatcher::send",
                    stream = %handle,
                    error = %err,
                    "cannot write prepared message"
                );
                self.invalidate(handle, true);
                return;
            }
        };
        if let Ok(stream) = self.streams.get_mut(handle) {
            if let SendState::Sending { stage, .. } = &mut stream.send {
                *stage = SendStage::Writing { pieces };
            }
        }
        self.send_next_piece(handle);
    }

    /// 把当前发送单元编码为待写出的片段。
    fn build_pieces(&self, handle: StreamHandle) -> Result<VecDeque<Bytes>> {
        let stream = self.streams.get(handle)?;
        let SendState::Sending {
            unit,
            stage: SendStage::Preparing,
        } = &stream.send
        else {
            return Err(DispatchError::invalid_state("no message is being prepared"));
        };
        let mut header = BytesMut::with_capacity(1 + MAX_HEADER_LEN);
        let payload = match *unit {
            SendUnit::StatusOnlyResponse => {
                let ReceiveState::SendingResponse(reply) = &stream.receive else {
                    return Err(DispatchError::invalid_state("no status reply is pending"));
                };
                let request = &reply.request;
                MessageHeader::response(
                    &request.protocol_name,
                    &request.topic,
                    request.request_id,
                    reply.status,
                )
                .encode(&mut header)?;
                status_only_payload(request)
            }
            SendUnit::Transaction(id) => {
                let txn = stream
                    .transactions
                    .get(id)
                    .ok_or(DispatchError::UnknownTransaction)?;
                let name = self
                    .registry
                    .name(txn.protocol)
                    .ok_or(DispatchError::invalid_state("transaction owner is not registered"))?;
                let message_header = match txn.kind {
                    TransactionKind::SendEvent => MessageHeader::event(name, &txn.topic),
                    TransactionKind::SendRequest => {
                        MessageHeader::request(name, &txn.topic, txn.request_id)
                    }
                    TransactionKind::ReceiveRequest => MessageHeader::response(
                        name,
                        &txn.topic,
                        txn.request_id,
                        txn.status.unwrap_or(ResponseStatus::Success),
                    ),
                };
                message_header.encode(&mut header)?;
                txn.message
                    .as_ref()
                    .map(OutgoingMessage::to_bytes)
                    .unwrap_or_default()
            }
        };
        let mut pieces = VecDeque::with_capacity(2);
        pieces.push_back(header.freeze());
        if !payload.is_empty() {
            pieces.push_back(payload);
        }
        Ok(pieces)
    }

    pub(crate) fn handle_send_complete(
        &mut self,
        handle: StreamHandle,
        result: Result<(), TransportError>,
    ) {
        if let Err(err) = result {
            warn!(
                target: "hds_dispatcher::send",
                stream = %handle,
                error = %err,
                "transport send failed"
            );
            self.invalidate(handle, true);
            return;
        }
        let Ok(stream) = self.streams.get(handle) else {
            return;
        };
        let state = match &stream.send {
            SendState::Sending {
                stage: SendStage::Writing { .. },
                ..
            } => None,
            SendState::Sending { .. } => Some("send-preparing"),
            SendState::Idle => Some("send-idle"),
        };
        match state {
            Some(state) => self.unexpected_completion(handle, "send", state),
            None => self.send_next_piece(handle),
        }
    }

    fn send_next_piece(&mut self, handle: StreamHandle) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let transport = stream.transport;
        let piece = match &mut stream.send {
            SendState::Sending {
                stage: SendStage::Writing { pieces },
                ..
            } => pieces.pop_front(),
            _ => return,
        };
        match piece {
            Some(bytes) => self.transport.send(transport, bytes),
            None => self.message_sent(handle),
        }
    }

    fn message_sent(&mut self, handle: StreamHandle) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let SendState::Sending { unit, .. } = mem::take(&mut stream.send) else {
            return;
        };
        match unit {
            SendUnit::StatusOnlyResponse => {
                let reply = match mem::take(&mut stream.receive) {
                    ReceiveState::SendingResponse(reply) => reply,
                    other => {
                        stream.receive = other;
                        return;
                    }
                };
                debug!(
                    target: "hds_dispatcher::send",
                    stream = %handle,
                    topic = reply.request.topic.as_str(),
                    status = %reply.status,
                    "status reply sent"
                );
                self.complete(
                    reply.request.protocol,
                    Completion::RequestReplied {
                        stream: handle,
                        topic: reply.request.topic,
                        status: reply.status,
                        result: Ok(()),
                    },
                );
                self.begin_receiving_packet(handle);
            }
            SendUnit::Transaction(id) => self.transaction_sent(handle, id),
        }
        self.begin_sending(handle);
    }

    fn transaction_sent(&mut self, handle: StreamHandle, id: TransactionId) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let Some(txn) = stream.transactions.get_mut(id) else {
            return;
        };
        debug!(
            target: "hds_dispatcher::send",
            stream = %handle,
            transaction = %id,
            topic = txn.topic.as_str(),
            "message sent"
        );
        match txn.kind {
            TransactionKind::SendRequest => {
                txn.state = TransactionState::WaitingForResponse;
                let completion = Completion::RequestSent {
                    stream: handle,
                    transaction: id,
                    topic: txn.topic.clone(),
                    message: txn.message.take().unwrap_or_default(),
                    result: Ok(()),
                };
                let owner = CompletionOwner::Protocol(txn.protocol);
                self.complete(owner, completion);
            }
            TransactionKind::SendEvent => {
                if let Some(txn) = self.deregister(handle, id) {
                    self.complete(
                        CompletionOwner::Protocol(txn.protocol),
                        Completion::EventSent {
                            stream: handle,
                            transaction: id,
                            topic: txn.topic,
                            message: txn.message.unwrap_or_default(),
                            result: Ok(()),
                        },
                    );
                }
            }
            TransactionKind::ReceiveRequest => {
                if let Some(txn) = self.deregister(handle, id) {
                    self.complete(
                        CompletionOwner::Protocol(txn.protocol),
                        Completion::ResponseSent {
                            stream: handle,
                            transaction: id,
                            topic: txn.topic,
                            status: txn.status.unwrap_or(ResponseStatus::Success),
                            message: txn.message.unwrap_or_default(),
                            result: Ok(()),
                        },
                    );
                }
            }
        }
    }

    /// 发送前的公共检查：协议已注册、流仍存活、握手门限。
    fn check_can_send(
        &self,
        protocol: ProtocolId,
        handle: StreamHandle,
        kind: MessageKind,
        topic: &str,
    ) -> Result<()> {
        let name = self
            .registry
            .name(protocol)
            .ok_or(DispatchError::invalid_state("protocol is not registered"))?;
        let stream = self.streams.get(handle)?;
        if !protocol.is_control() && stream.phase != HandshakePhase::Connected {
            return Err(DispatchError::invalid_state("data stream handshake is not complete"));
        }
        check_budget(kind, name, topic)
    }

    /// 将事件加入发送队列。
    pub(crate) fn send_event(
        &mut self,
        protocol: ProtocolId,
        handle: StreamHandle,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<TransactionId> {
        self.check_can_send(protocol, handle, MessageKind::Event, topic)?;
        let mut txn = Transaction::new(
            TransactionKind::SendEvent,
            TransactionState::WaitingForSend,
            protocol,
            topic.to_owned(),
        );
        txn.ttl = Some(self.config.event_timeout());
        txn.message = Some(message);
        let id = self.register(handle, txn)?;
        self.begin_sending(handle);
        Ok(id)
    }

    /// 将请求加入发送队列，请求标识在流内唯一。
    pub(crate) fn send_request(
        &mut self,
        protocol: ProtocolId,
        handle: StreamHandle,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<TransactionId> {
        self.check_can_send(protocol, handle, MessageKind::Request, topic)?;
        let request_id = self.draw_request_id(handle)?;
        let mut txn = Transaction::new(
            TransactionKind::SendRequest,
            TransactionState::WaitingForSend,
            protocol,
            topic.to_owned(),
        );
        txn.request_id = request_id;
        txn.ttl = Some(self.config.request_timeout());
        txn.message = Some(message);
        let id = self.register(handle, txn)?;
        self.begin_sending(handle);
        Ok(id)
    }

    fn draw_request_id(&mut self, handle: StreamHandle) -> Result<i64> {
        loop {
            let candidate = self.rng.next_u64() as i64;
            let stream = self.streams.get(handle)?;
            let taken = stream.transactions.iter().any(|(_, txn)| {
                txn.kind == TransactionKind::SendRequest && txn.request_id == candidate
            });
            if !taken {
                return Ok(candidate);
            }
            debug!(
                target: "hds_dispatcher::send",
                stream = %handle,
                request_id = candidate,
                "request id already outstanding; drawing again"
            );
        }
    }

    /// 为已接收的请求排队响应。
    pub(crate) fn send_response(
        &mut self,
        protocol: ProtocolId,
        handle: StreamHandle,
        transaction: TransactionId,
        status: ResponseStatus,
        message: OutgoingMessage,
    ) -> Result<()> {
        let stream = self.streams.get_mut(handle)?;
        let txn = stream
            .transactions
            .get_mut(transaction)
            .ok_or(DispatchError::UnknownTransaction)?;
        if txn.protocol != protocol {
            return Err(DispatchError::invalid_state("transaction belongs to another protocol"));
        }
        if txn.kind != TransactionKind::ReceiveRequest
            || txn.state != TransactionState::WaitingForResponse
        {
            return Err(DispatchError::invalid_state("request is not waiting for a response"));
        }
        txn.state = TransactionState::WaitingForSend;
        txn.status = Some(status);
        txn.message = Some(message);
        self.begin_sending(handle);
        Ok(())
    }

    /// 放弃一条不在收发中的事务，不产生完成事件。
    pub(crate) fn clear_transaction(
        &mut self,
        protocol: ProtocolId,
        handle: StreamHandle,
        transaction: TransactionId,
    ) -> Result<()> {
        let Ok(stream) = self.streams.get(handle) else {
            return Ok(());
        };
        let Some(txn) = stream.transactions.get(transaction) else {
            return Err(DispatchError::UnknownTransaction);
        };
        if txn.protocol != protocol {
            return Err(DispatchError::invalid_state("transaction belongs to another protocol"));
        }
        if txn.is_in_flight()
            || self.active_send_unit(handle) == Some(SendUnit::Transaction(transaction))
        {
            return Err(DispatchError::invalid_state("transaction is in flight"));
        }
        debug!(
            target: "hds_dispatcher::send",
            stream = %handle,
            transaction = %transaction,
            "clearing transaction"
        );
        self.deregister(handle, transaction);
        Ok(())
    }

    pub(crate) fn set_minimum_priority(
        &mut self,
        handle: StreamHandle,
        priority: StreamPriority,
    ) -> Result<()> {
        let transport = self.streams.get(handle)?.transport;
        self.transport.set_minimum_priority(transport, priority);
        Ok(())
    }
}
