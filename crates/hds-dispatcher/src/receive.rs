//! # receive 模块说明
//!
//! ## 角色定位（Why）
//! - 接收泵：每条流同一时刻只处理一个入站包，依次读取 `HeaderLen`、报文头与消息体；
//! - 报文头解码后按协议名派发：已注册协议收到“可用”通知并自行决定接收或跳过，
//!   未注册协议的事件被自动跳过，请求被自动回复 `MissingProtocol`。
//!
//! ## 状态迁移（What）
//! `Idle → ReceivingHeaderLength → ReceivingHeader → {Event|Request|Response}Available
//! → ReceivingMessage → Idle`；跳过并回复走
//! `RequestAvailable → SkippingRequestMessage → WaitingForResponse → SendingResponse → Idle`。
//!
//! ## 风险提示（Trade-offs）
//! - 任何线上格式或关联校验失败都会让整条流失效，不尝试在同一连接上恢复分帧。

use std::mem;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::engine::{CompletionOwner, DispatchCore, Upcall};
use crate::error::{DispatchError, Result};
use crate::header::{MessageHeader, MessageKind, check_budget};
use crate::protocol::{CONTROL_PROTOCOL_NAME, Completion, ProtocolId, ReceivedMessage};
use crate::status::ResponseStatus;
use crate::stream::{
    HandshakePhase, InboundMessage, InboundOwner, InboundTarget, PendingRequest, ReceiveState,
    StatusReply, StreamHandle,
};
use crate::transaction::{Transaction, TransactionId, TransactionKind, TransactionState};
use crate::transport::TransportError;

/// 接收完成时接收泵所处的步骤。
enum ReceiveStep {
    HeaderLength,
    Header { len: usize },
    Message,
    Unexpected(&'static str),
}

impl DispatchCore {
    /// 传输层报告一个新的入站包。
    pub(crate) fn handle_data(&mut self, handle: StreamHandle, len: usize) {
        let max_packet_len = self.config.max_packet_len as usize;
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        if len > max_packet_len {
            warn!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                len,
                max_packet_len,
                "inbound packet exceeds the maximum packet length"
            );
            self.invalidate(handle, true);
            return;
        }
        if stream.pending_packet.is_some() || stream.remaining > 0 {
            warn!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                len,
                "inbound packet arrived before the previous packet was consumed"
            );
            self.invalidate(handle, true);
            return;
        }
        stream.pending_packet = Some(len);
        if matches!(stream.receive, ReceiveState::Idle) {
            self.begin_receiving_packet(handle);
        } else {
            info!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                "delaying packet until the previous packet is handled"
            );
        }
    }

    /// 接收泵空闲且有待处理包时开始读取 `HeaderLen`。
    pub(crate) fn begin_receiving_packet(&mut self, handle: StreamHandle) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        if !matches!(stream.receive, ReceiveState::Idle) {
            return;
        }
        let Some(len) = stream.pending_packet.take() else {
            return;
        };
        stream.remaining = len;
        stream.receive = ReceiveState::ReceivingHeaderLength;
        let transport = stream.transport;
        if len < 1 {
            warn!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                "packet is too short for HeaderLen"
            );
            self.invalidate(handle, true);
            return;
        }
        debug!(target: "hds_dispatcher::receive", stream = %handle, len, "receiving HeaderLen");
        self.transport.receive(transport, 1);
    }

    pub(crate) fn handle_receive_complete(
        &mut self,
        handle: StreamHandle,
        result: Result<Bytes, TransportError>,
    ) {
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    target: "hds_dispatcher::receive",
                    stream = %handle,
                    error = %err,
                    "transport receive failed"
                );
                self.invalidate(handle, true);
                return;
            }
        };
        let Ok(stream) = self.streams.get(handle) else {
            return;
        };
        let step = match &stream.receive {
            ReceiveState::ReceivingHeaderLength => ReceiveStep::HeaderLength,
            ReceiveState::ReceivingHeader { len } => ReceiveStep::Header { len: *len },
            ReceiveState::ReceivingMessage(InboundMessage {
                target: InboundTarget::Buffer(_) | InboundTarget::Short,
                ..
            }) => ReceiveStep::Message,
            other => ReceiveStep::Unexpected(other.name()),
        };
        match step {
            ReceiveStep::HeaderLength => self.header_length_received(handle, bytes),
            ReceiveStep::Header { len } => self.header_received(handle, len, bytes),
            ReceiveStep::Message => self.message_received(handle, bytes),
            ReceiveStep::Unexpected(state) => self.unexpected_completion(handle, "receive", state),
        }
    }

    pub(crate) fn handle_skip_complete(
        &mut self,
        handle: StreamHandle,
        result: Result<(), TransportError>,
    ) {
        if let Err(err) = result {
            warn!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                error = %err,
                "transport skip failed"
            );
            self.invalidate(handle, true);
            return;
        }
        let Ok(stream) = self.streams.get(handle) else {
            return;
        };
        match &stream.receive {
            ReceiveState::SkippingRequestMessage(_) => self.request_skipped(handle),
            ReceiveState::ReceivingMessage(InboundMessage {
                target: InboundTarget::Skip,
                ..
            }) => self.message_received(handle, Bytes::new()),
            other => {
                let state = other.name();
                self.unexpected_completion(handle, "skip", state);
            }
        }
    }

    pub(crate) fn unexpected_completion(
        &mut self,
        handle: StreamHandle,
        operation: &'static str,
        state: &'static str,
    ) {
        warn!(
            target: "hds_dispatcher::engine",
            stream = %handle,
            operation,
            state,
            "transport completion does not match the stream state"
        );
        self.invalidate(handle, true);
    }

    fn header_length_received(&mut self, handle: StreamHandle, bytes: Bytes) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let &[header_len] = bytes.as_ref() else {
            warn!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                received = bytes.len(),
                "transport delivered a malformed HeaderLen"
            );
            self.invalidate(handle, true);
            return;
        };
        let header_len = usize::from(header_len);
        stream.remaining = stream.remaining.saturating_sub(1);
        debug!(target: "hds_dispatcher::receive", stream = %handle, header_len, "received HeaderLen");
        if stream.remaining < header_len {
            warn!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                remaining = stream.remaining,
                header_len,
                "packet is too short for the announced header"
            );
            self.invalidate(handle, true);
            return;
        }
        stream.receive = ReceiveState::ReceivingHeader { len: header_len };
        let transport = stream.transport;
        if header_len == 0 {
            self.header_received(handle, 0, Bytes::new());
        } else {
            self.transport.receive(transport, header_len);
        }
    }

    fn header_received(&mut self, handle: StreamHandle, expected: usize, bytes: Bytes) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        if bytes.len() != expected {
            warn!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                expected,
                received = bytes.len(),
                "transport delivered a truncated header"
            );
            self.invalidate(handle, true);
            return;
        }
        stream.remaining = stream.remaining.saturating_sub(expected);
        let payload_len = stream.remaining;
        let phase = stream.phase;

        let header = match MessageHeader::decode(&bytes) {
            Ok(header) => header,
            Err(err) => {
                warn!(
                    target: "hds_dispatcher::receive",
                    stream = %handle,
                    error = %err,
                    "received malformed header"
                );
                self.invalidate(handle, true);
                return;
            }
        };
        if header.protocol != CONTROL_PROTOCOL_NAME && phase != HandshakePhase::Connected {
            warn!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                protocol = header.protocol,
                topic = header.topic,
                phase = ?phase,
                "received message before the handshake completed"
            );
            self.invalidate(handle, true);
            return;
        }
        let protocol = self.registry.resolve(header.protocol);
        match header.kind {
            MessageKind::Event => self.event_header_received(handle, protocol, &header, payload_len),
            MessageKind::Request => {
                self.request_header_received(handle, protocol, &header, payload_len)
            }
            MessageKind::Response => {
                self.response_header_received(handle, protocol, &header, payload_len)
            }
        }
    }

    fn event_header_received(
        &mut self,
        handle: StreamHandle,
        protocol: Option<ProtocolId>,
        header: &MessageHeader<'_>,
        len: usize,
    ) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let topic = header.topic.to_owned();
        stream.receive = ReceiveState::EventAvailable {
            protocol,
            topic: topic.clone(),
        };
        match protocol {
            Some(protocol) => {
                debug!(
                    target: "hds_dispatcher::receive",
                    stream = %handle,
                    protocol = header.protocol,
                    topic = header.topic,
                    len,
                    "event available"
                );
                self.push(Upcall::EventAvailable {
                    protocol,
                    stream: handle,
                    topic,
                    len,
                });
            }
            None => {
                info!(
                    target: "hds_dispatcher::receive",
                    stream = %handle,
                    protocol = header.protocol,
                    topic = header.topic,
                    "skipping event for unregistered protocol"
                );
                self.start_message(
                    handle,
                    InboundOwner::Event {
                        protocol: None,
                        topic,
                    },
                    InboundTarget::Skip,
                );
            }
        }
    }

    fn request_header_received(
        &mut self,
        handle: StreamHandle,
        protocol: Option<ProtocolId>,
        header: &MessageHeader<'_>,
        len: usize,
    ) {
        let request_id = match (header.id, check_budget(MessageKind::Request, header.protocol, header.topic)) {
            (Some(request_id), Ok(())) => request_id,
            _ => {
                warn!(
                    target: "hds_dispatcher::receive",
                    stream = %handle,
                    protocol = header.protocol,
                    topic = header.topic,
                    "request cannot be answered within the header budget"
                );
                self.invalidate(handle, true);
                return;
            }
        };
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        stream.receive = ReceiveState::RequestAvailable(PendingRequest {
            protocol,
            protocol_name: header.protocol.to_owned(),
            topic: header.topic.to_owned(),
            request_id,
        });
        match protocol {
            Some(protocol) => {
                debug!(
                    target: "hds_dispatcher::receive",
                    stream = %handle,
                    protocol = header.protocol,
                    topic = header.topic,
                    request_id,
                    len,
                    "request available"
                );
                self.push(Upcall::RequestAvailable {
                    protocol,
                    stream: handle,
                    topic: header.topic.to_owned(),
                    len,
                });
            }
            None => {
                info!(
                    target: "hds_dispatcher::receive",
                    stream = %handle,
                    protocol = header.protocol,
                    topic = header.topic,
                    request_id,
                    "rejecting request for unregistered protocol"
                );
                self.begin_skip_and_reply(handle, ResponseStatus::MissingProtocol);
            }
        }
    }

    fn response_header_received(
        &mut self,
        handle: StreamHandle,
        protocol: Option<ProtocolId>,
        header: &MessageHeader<'_>,
        len: usize,
    ) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let (Some(request_id), Some(status)) = (header.id, header.status) else {
            return self.reject_response(handle, header, "response header without id or status");
        };
        let outstanding = stream
            .transactions
            .iter()
            .find(|(_, txn)| {
                txn.kind == TransactionKind::SendRequest
                    && txn.state == TransactionState::WaitingForResponse
                    && txn.request_id == request_id
            })
            .map(|(id, txn)| (id, txn.protocol, txn.topic == header.topic));
        let (transaction, owner) = match outstanding {
            None => return self.reject_response(handle, header, "response matches no outstanding request"),
            Some((_, owner, _)) if Some(owner) != protocol => {
                return self.reject_response(handle, header, "response protocol differs from the request");
            }
            Some((_, _, false)) => {
                return self.reject_response(handle, header, "response topic differs from the request");
            }
            Some((transaction, owner, true)) => (transaction, owner),
        };
        if let Some(txn) = stream.transactions.get_mut(transaction) {
            txn.state = TransactionState::ResponseAvailable;
            txn.status = Some(status);
        }
        stream.receive = ReceiveState::ResponseAvailable(transaction);
        debug!(
            target: "hds_dispatcher::receive",
            stream = %handle,
            protocol = header.protocol,
            topic = header.topic,
            request_id,
            %status,
            len,
            "response available"
        );
        self.push(Upcall::ResponseAvailable {
            protocol: owner,
            stream: handle,
            transaction,
            topic: header.topic.to_owned(),
            status,
            len,
        });
    }

    fn reject_response(&mut self, handle: StreamHandle, header: &MessageHeader<'_>, reason: &'static str) {
        warn!(
            target: "hds_dispatcher::receive",
            stream = %handle,
            protocol = header.protocol,
            topic = header.topic,
            request_id = header.id,
            reason,
            "rejecting response"
        );
        self.invalidate(handle, true);
    }

    /// 处理器认领一个可用事件。
    pub(crate) fn receive_event(
        &mut self,
        protocol: ProtocolId,
        handle: StreamHandle,
        target: InboundTarget,
    ) -> Result<()> {
        let stream = self.streams.get_mut(handle)?;
        let topic = match &stream.receive {
            ReceiveState::EventAvailable {
                protocol: Some(owner),
                topic,
            } if *owner == protocol => topic.clone(),
            _ => return Err(DispatchError::invalid_state("no event is available for this protocol")),
        };
        self.start_message(
            handle,
            InboundOwner::Event {
                protocol: Some(protocol),
                topic,
            },
            target,
        );
        Ok(())
    }

    /// 处理器认领一个可用请求，创建接收请求事务。
    pub(crate) fn receive_request(
        &mut self,
        protocol: ProtocolId,
        handle: StreamHandle,
        target: InboundTarget,
    ) -> Result<TransactionId> {
        let stream = self.streams.get_mut(handle)?;
        let (topic, request_id) = match &stream.receive {
            ReceiveState::RequestAvailable(request) if request.protocol == Some(protocol) => {
                (request.topic.clone(), request.request_id)
            }
            _ => return Err(DispatchError::invalid_state("no request is available for this protocol")),
        };
        let mut transaction = Transaction::new(
            TransactionKind::ReceiveRequest,
            TransactionState::ReceivingRequest,
            protocol,
            topic,
        );
        transaction.request_id = request_id;
        let id = self.register(handle, transaction)?;
        self.start_message(handle, InboundOwner::Request(id), target);
        Ok(id)
    }

    /// 处理器跳过请求体并只回复状态。
    pub(crate) fn skip_and_reply(
        &mut self,
        protocol: ProtocolId,
        handle: StreamHandle,
        status: ResponseStatus,
    ) -> Result<()> {
        let stream = self.streams.get(handle)?;
        match &stream.receive {
            ReceiveState::RequestAvailable(request) if request.protocol == Some(protocol) => {}
            _ => return Err(DispatchError::invalid_state("no request is available for this protocol")),
        }
        self.begin_skip_and_reply(handle, status);
        Ok(())
    }

    /// 处理器认领本协议请求的响应体。
    pub(crate) fn receive_response(
        &mut self,
        protocol: ProtocolId,
        handle: StreamHandle,
        transaction: TransactionId,
        target: InboundTarget,
    ) -> Result<()> {
        let stream = self.streams.get_mut(handle)?;
        if !matches!(stream.receive, ReceiveState::ResponseAvailable(id) if id == transaction) {
            return Err(DispatchError::invalid_state("no response is available for this transaction"));
        }
        let txn = stream
            .transactions
            .get_mut(transaction)
            .ok_or(DispatchError::UnknownTransaction)?;
        if txn.protocol != protocol {
            return Err(DispatchError::invalid_state("transaction belongs to another protocol"));
        }
        txn.state = TransactionState::ReceivingResponse;
        self.start_message(handle, InboundOwner::Response(transaction), target);
        Ok(())
    }

    fn begin_skip_and_reply(&mut self, handle: StreamHandle, status: ResponseStatus) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let request = match mem::take(&mut stream.receive) {
            ReceiveState::RequestAvailable(request) => request,
            other => {
                stream.receive = other;
                return;
            }
        };
        debug!(
            target: "hds_dispatcher::receive",
            stream = %handle,
            topic = request.topic.as_str(),
            %status,
            "skipping request message"
        );
        stream.receive = ReceiveState::SkippingRequestMessage(StatusReply { request, status });
        let remaining = stream.remaining;
        let transport = stream.transport;
        if remaining == 0 {
            self.request_skipped(handle);
        } else {
            self.transport.skip(transport, remaining);
        }
    }

    fn request_skipped(&mut self, handle: StreamHandle) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let reply = match mem::take(&mut stream.receive) {
            ReceiveState::SkippingRequestMessage(reply) => reply,
            other => {
                stream.receive = other;
                return;
            }
        };
        stream.remaining = 0;
        stream.receive = ReceiveState::WaitingForResponse(reply);
        if self.active_send_unit(handle).is_none() {
            self.begin_sending(handle);
        } else {
            info!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                "delaying status reply until the current message is sent"
            );
        }
    }

    fn start_message(&mut self, handle: StreamHandle, owner: InboundOwner, target: InboundTarget) {
        let capacity = self.config.short_message_capacity;
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let len = stream.remaining;
        let target = match target {
            InboundTarget::Short if len > capacity => {
                debug!(
                    target: "hds_dispatcher::receive",
                    stream = %handle,
                    len,
                    capacity,
                    "short message is too long; skipping"
                );
                InboundTarget::Skip
            }
            other => other,
        };
        let skip = matches!(target, InboundTarget::Skip);
        stream.receive = ReceiveState::ReceivingMessage(InboundMessage { owner, target, len });
        let transport = stream.transport;
        if len == 0 {
            self.message_received(handle, Bytes::new());
        } else if skip {
            self.transport.skip(transport, len);
        } else {
            self.transport.receive(transport, len);
        }
    }

    fn message_received(&mut self, handle: StreamHandle, bytes: Bytes) {
        let Ok(stream) = self.streams.get_mut(handle) else {
            return;
        };
        let expected = match &stream.receive {
            ReceiveState::ReceivingMessage(InboundMessage {
                target: InboundTarget::Skip,
                ..
            }) => 0,
            ReceiveState::ReceivingMessage(message) => message.len,
            _ => return,
        };
        if bytes.len() != expected {
            warn!(
                target: "hds_dispatcher::receive",
                stream = %handle,
                expected,
                received = bytes.len(),
                "transport delivered a truncated message"
            );
            self.invalidate(handle, true);
            return;
        }
        let ReceiveState::ReceivingMessage(InboundMessage { owner, target, len }) =
            mem::take(&mut stream.receive)
        else {
            return;
        };
        stream.remaining = 0;
        let message = match target {
            InboundTarget::Buffer(mut buffer) => {
                buffer.clear();
                buffer.extend_from_slice(&bytes);
                ReceivedMessage::Buffer(buffer)
            }
            InboundTarget::Short => ReceivedMessage::Short(bytes),
            InboundTarget::Skip => ReceivedMessage::Skipped { len },
        };
        debug!(target: "hds_dispatcher::receive", stream = %handle, len, "message received");

        match owner {
            InboundOwner::Event { protocol, topic } => self.complete(
                protocol,
                Completion::EventReceived {
                    stream: handle,
                    topic,
                    message,
                    result: Ok(()),
                },
            ),
            InboundOwner::Request(transaction) => {
                if let Some(txn) = stream.transactions.get_mut(transaction) {
                    txn.state = TransactionState::WaitingForResponse;
                    let completion = Completion::RequestReceived {
                        stream: handle,
                        transaction,
                        topic: txn.topic.clone(),
                        message,
                        result: Ok(()),
                    };
                    let owner = CompletionOwner::Protocol(txn.protocol);
                    self.complete(owner, completion);
                }
            }
            InboundOwner::Response(transaction) => {
                if let Some(txn) = self.deregister(handle, transaction) {
                    self.complete(
                        CompletionOwner::Protocol(txn.protocol),
                        Completion::ResponseReceived {
                            stream: handle,
                            transaction,
                            topic: txn.topic,
                            status: txn.status.unwrap_or(ResponseStatus::Success),
                            message,
                            result: Ok(()),
                        },
                    );
                }
            }
        }
        self.begin_receiving_packet(handle);
    }
}
