//! # engine 模块说明
//!
//! ## 角色定位（Why）
//! - [`DispatchCore`] 是分发器中与处理器无关的部分：流表、协议名注册表、传输命令、
//!   超时调度器、请求标识随机源，以及待派发给处理器的回调队列；
//! - 接收泵、发送泵分别在 `receive.rs` 与 `send.rs` 中为它追加方法，本文件负责
//!   接入、失效、事务登记与超时重算。
//!
//! ## 并发模型（How）
//! - 单线程、回调驱动：宿主每投递一次传输完成，状态机推进一步，需要处理器参与的地方
//!   只向队列追加 [`Upcall`]，由 `Dispatcher` 在入口返回前统一排空；
//! - 因此处理器回调永远不会在状态机修改流表的中途被调用。
//!
//! ## 失效顺序（What）
//! 1. 中止尚未完成的“跳过并回复”（`RequestReplied` 携带 `InvalidState`）；
//! 2. 中止正在接收的事件体（`EventReceived` 携带 `InvalidState`）；
//! 3. 从链表头依次摘除事务：发送事件总是回送 `InvalidState`；发送请求与接收请求只有在
//!    消息收发尚未完成时才回送，其余情况静默移除；
//! 4. 通知 `control` 协议；若流已完成握手，再按注册顺序通知其余协议；
//! 5. 清空槽位并重算定时器。

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tracing::{error, info};

use crate::clock::Clock;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::protocol::{Completion, ProtocolId, ProtocolRegistry, ReceivedMessage};
use crate::status::ResponseStatus;
use crate::stream::{
    HandshakePhase, InboundMessage, InboundOwner, InboundTarget, ReceiveState, SendState,
    SendUnit, StreamHandle, StreamTable,
};
use crate::timer::{TimeoutScheduler, age_ttl};
use crate::transaction::{Transaction, TransactionId, TransactionKind, TransactionState};
use crate::transport::{DataStreamTransport, TransportStreamId};

/// 完成事件的接收方。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CompletionOwner {
    Protocol(ProtocolId),
    /// 分发器代未注册协议完成的操作，只记录日志。
    Internal,
}

impl From<Option<ProtocolId>> for CompletionOwner {
    fn from(protocol: Option<ProtocolId>) -> Self {
        protocol.map_or(Self::Internal, Self::Protocol)
    }
}

/// 待派发给处理器的回调。
pub(crate) enum Upcall {
    Accept {
        protocol: ProtocolId,
        stream: StreamHandle,
    },
    Invalidate {
        protocol: ProtocolId,
        stream: StreamHandle,
    },
    EventAvailable {
        protocol: ProtocolId,
        stream: StreamHandle,
        topic: String,
        len: usize,
    },
    RequestAvailable {
        protocol: ProtocolId,
        stream: StreamHandle,
        topic: String,
        len: usize,
    },
    ResponseAvailable {
        protocol: ProtocolId,
        stream: StreamHandle,
        transaction: TransactionId,
        topic: String,
        status: ResponseStatus,
        len: usize,
    },
    Complete {
        owner: CompletionOwner,
        completion: Completion,
    },
}

pub(crate) struct DispatchCore {
    pub(crate) config: DispatcherConfig,
    pub(crate) registry: ProtocolRegistry,
    pub(crate) streams: StreamTable,
    pub(crate) transport: Box<dyn DataStreamTransport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) scheduler: TimeoutScheduler,
    pub(crate) rng: Box<dyn RngCore>,
    pub(crate) upcalls: VecDeque<Upcall>,
}

impl DispatchCore {
    pub(crate) fn new(
        config: DispatcherConfig,
        registry: ProtocolRegistry,
        transport: Box<dyn DataStreamTransport>,
        timer: Box<dyn crate::timer::TimerDriver>,
        clock: Arc<dyn Clock>,
        rng: Box<dyn RngCore>,
    ) -> Self {
        let now = clock.now();
        Self {
            streams: StreamTable::new(config.max_streams),
            config,
            registry,
            transport,
            scheduler: TimeoutScheduler::new(timer, now),
            clock,
            rng,
            upcalls: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, upcall: Upcall) {
        self.upcalls.push_back(upcall);
    }

    pub(crate) fn complete(&mut self, owner: impl Into<CompletionOwner>, completion: Completion) {
        self.push(Upcall::Complete {
            owner: owner.into(),
            completion,
        });
    }

    /// 接入一条新的传输流。
    pub(crate) fn accept(&mut self, transport: TransportStreamId) -> Option<StreamHandle> {
        if let Some(existing) = self.streams.find(transport) {
            info!(
                target: "hds_dispatcher::engine",
                stream = %existing,
                transport = transport.0,
                "transport stream already accepted"
            );
            return Some(existing);
        }
        let Some(stream) = self.streams.claim(transport) else {
            error!(
                target: "hds_dispatcher::engine",
                transport = transport.0,
                max_streams = self.streams.capacity(),
                "cannot accept data stream: stream table is full"
            );
            self.transport.invalidate(transport);
            return None;
        };
        info!(
            target: "hds_dispatcher::engine",
            stream = %stream,
            transport = transport.0,
            "data stream accepted; informing control protocol"
        );
        self.push(Upcall::Accept {
            protocol: ProtocolId::CONTROL,
            stream,
        });
        Some(stream)
    }

    /// 让整条流失效。
    ///
    /// `notify_transport` 为真时同时要求传输层拆除该流；由传输层发起的失效不需要回送。
    pub(crate) fn invalidate(&mut self, handle: StreamHandle, notify_transport: bool) {
        let Some(mut stream) = self.streams.release(handle) else {
            return;
        };
        info!(
            target: "hds_dispatcher::engine",
            stream = %handle,
            transport = stream.transport.0,
            transactions = stream.transactions.len(),
            "invalidating data stream"
        );
        if notify_transport {
            self.transport.invalidate(stream.transport);
        }
        // 正在接收的请求或响应事务需要交还调用方的缓冲。
        let mut inbound = None;
        match mem::take(&mut stream.receive) {
            ReceiveState::SkippingRequestMessage(reply)
            | ReceiveState::WaitingForResponse(reply)
            | ReceiveState::SendingResponse(reply) => {
                self.complete(
                    reply.request.protocol,
                    Completion::RequestReplied {
                        stream: handle,
                        topic: reply.request.topic,
                        status: reply.status,
                        result: aborted(),
                    },
                );
            }
            ReceiveState::ReceivingMessage(InboundMessage {
                owner: InboundOwner::Event { protocol, topic },
                target,
                len,
            }) => {
                self.complete(
                    protocol,
                    Completion::EventReceived {
                        stream: handle,
                        topic,
                        message: unfinished(target, len),
                        result: aborted(),
                    },
                );
            }
            ReceiveState::ReceivingMessage(InboundMessage {
                owner: InboundOwner::Request(id) | InboundOwner::Response(id),
                target,
                len,
            }) => inbound = Some((id, unfinished(target, len))),
            _ => {}
        }

        while let Some((id, txn)) = stream.transactions.pop_front() {
            let Transaction {
                kind,
                state,
                protocol,
                topic,
                message,
                status,
                ..
            } = txn;
            let message = message.unwrap_or_default();
            let status = status.unwrap_or(ResponseStatus::Success);
            let completion = match (kind, state) {
                (TransactionKind::SendEvent, _) => Completion::EventSent {
                    stream: handle,
                    transaction: id,
                    topic,
                    message,
                    result: aborted(),
                },
                (
                    TransactionKind::SendRequest,
                    TransactionState::WaitingForSend | TransactionState::SendingRequest,
                ) => Completion::RequestSent {
                    stream: handle,
                    transaction: id,
                    topic,
                    message,
                    result: aborted(),
                },
                (TransactionKind::SendRequest, TransactionState::ReceivingResponse) => {
                    Completion::ResponseReceived {
                        stream: handle,
                        transaction: id,
                        topic,
                        status,
                        message: take_inbound(&mut inbound, id),
                        result: aborted(),
                    }
                }
                (TransactionKind::ReceiveRequest, TransactionState::ReceivingRequest) => {
                    Completion::RequestReceived {
                        stream: handle,
                        transaction: id,
                        topic,
                        message: take_inbound(&mut inbound, id),
                        result: aborted(),
                    }
                }
                (
                    TransactionKind::ReceiveRequest,
                    TransactionState::WaitingForSend | TransactionState::SendingResponse,
                ) => Completion::ResponseSent {
                    stream: handle,
                    transaction: id,
                    topic,
                    status,
                    message,
                    result: aborted(),
                },
                _ => continue,
            };
            self.complete(CompletionOwner::Protocol(protocol), completion);
        }

        self.push(Upcall::Invalidate {
            protocol: ProtocolId::CONTROL,
            stream: handle,
        });
        if stream.phase == HandshakePhase::Connected {
            let others: Vec<ProtocolId> = self.registry.user_ids().collect();
            for protocol in others {
                self.push(Upcall::Invalidate {
                    protocol,
                    stream: handle,
                });
            }
        } else {
            info!(
                target: "hds_dispatcher::engine",
                stream = %handle,
                phase = ?stream.phase,
                "handshake incomplete; other protocols are not informed"
            );
        }

        self.update_timers(false);
    }

    /// 登记事务并重算定时器。
    pub(crate) fn register(&mut self, handle: StreamHandle, transaction: Transaction) -> Result<TransactionId> {
        let timed = transaction.ttl.is_some();
        if timed {
            self.update_timers(false);
        }
        let id = self.streams.get_mut(handle)?.transactions.push_back(transaction);
        if timed {
            self.update_timers(false);
        }
        Ok(id)
    }

    /// 注销事务并重算定时器。
    pub(crate) fn deregister(&mut self, handle: StreamHandle, id: TransactionId) -> Option<Transaction> {
        let transaction = self.streams.get_mut(handle).ok()?.transactions.remove(id)?;
        if transaction.ttl.is_some() {
            self.update_timers(false);
        }
        Some(transaction)
    }

    /// 扣减所有带时限事务的剩余时限并重新布置定时器。
    ///
    /// `collect_expired` 为真时返回含有已耗尽事务的流；否则耗尽的时限只被归零，
    /// 定时器会立即到期并在下一次 [`Self::handle_timer_expired`] 中处理。
    pub(crate) fn update_timers(&mut self, collect_expired: bool) -> Vec<StreamHandle> {
        let now = self.clock.now();
        let delta = self.scheduler.begin(now);
        let mut min_ttl = None;
        let mut expired = Vec::new();
        for (handle, stream) in self.streams.streams_mut() {
            let mut stream_expired = false;
            for ttl in stream.transactions.ttls_mut() {
                stream_expired |= age_ttl(ttl, delta);
                min_ttl = Some(min_ttl.map_or(*ttl, |current: Duration| current.min(*ttl)));
            }
            if stream_expired && collect_expired {
                expired.push(handle);
            }
        }
        self.scheduler.finish(now, min_ttl);
        expired
    }

    /// 定时器到期：所有存在超时事务的流一并失效。
    pub(crate) fn handle_timer_expired(&mut self) {
        for handle in self.update_timers(true) {
            info!(
                target: "hds_dispatcher::engine",
                stream = %handle,
                "transaction timed out; invalidating data stream"
            );
            self.invalidate(handle, true);
        }
    }

    /// 当前是否仍有等待处理器认领的入站消息。
    pub(crate) fn is_awaiting_decision(&self, handle: StreamHandle) -> bool {
        matches!(
            self.streams.get(handle).map(|stream| &stream.receive),
            Ok(ReceiveState::EventAvailable { .. }
                | ReceiveState::RequestAvailable(_)
                | ReceiveState::ResponseAvailable(_))
        )
    }

    /// 发送泵当前处理的单元。
    pub(crate) fn active_send_unit(&self, handle: StreamHandle) -> Option<SendUnit> {
        match &self.streams.get(handle).ok()?.send {
            SendState::Sending { unit, .. } => Some(*unit),
            SendState::Idle => None,
        }
    }
}

fn aborted() -> Result<()> {
    Err(DispatchError::invalid_state("data stream invalidated"))
}

fn take_inbound(
    inbound: &mut Option<(TransactionId, ReceivedMessage)>,
    id: TransactionId,
) -> ReceivedMessage {
    match inbound.take() {
        Some((inbound_id, message)) if inbound_id == id => message,
        other => {
            *inbound = other;
            ReceivedMessage::Skipped { len: 0 }
        }
    }
}

/// 失效时未读完的消息体：调用方的缓冲原样交还，其余视为跳过。
fn unfinished(target: InboundTarget, len: usize) -> ReceivedMessage {
    match target {
        InboundTarget::Buffer(buffer) => ReceivedMessage::Buffer(buffer),
        InboundTarget::Short | InboundTarget::Skip => ReceivedMessage::Skipped { len },
    }
}
