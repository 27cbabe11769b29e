//! # stream 模块说明
//!
//! ## 角色定位（Why）
//! - 维护固定大小的流表：接入时占用第一个空闲槽位，失效时清空槽位供后续接入复用；
//! - 每条流各自持有握手阶段、接收泵状态、发送泵状态、待处理入站包与事务链表。
//!
//! ## 契约说明（What）
//! - [`StreamHandle`] 由槽位下标与代数组成；槽位复用后旧句柄被拒绝；
//! - 接收泵与发送泵各自只有一个状态值，天然保证“同一时刻至多一个接收、一个发送”。

use core::fmt;
use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::error::{DispatchError, Result};
use crate::protocol::ProtocolId;
use crate::status::ResponseStatus;
use crate::transaction::{TransactionId, TransactionList};
use crate::transport::TransportStreamId;

/// 流句柄。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StreamHandle {
    index: u16,
    generation: u32,
}

impl StreamHandle {
    /// 流表中的槽位下标。
    pub fn index(self) -> usize {
        usize::from(self.index)
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// 握手阶段。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HandshakePhase {
    WaitingForHelloRequest,
    SendingHelloResponse,
    Connected,
}

/// 尚未被处理器认领的入站请求。
pub(crate) struct PendingRequest {
    /// 未注册的协议为 `None`。
    pub(crate) protocol: Option<ProtocolId>,
    /// 报文头中的原始协议名，状态回复需要原样带回。
    pub(crate) protocol_name: String,
    pub(crate) topic: String,
    pub(crate) request_id: i64,
}

/// 跳过请求体后待发送的状态回复。
pub(crate) struct StatusReply {
    pub(crate) request: PendingRequest,
    pub(crate) status: ResponseStatus,
}

pub(crate) enum InboundOwner {
    Event {
        protocol: Option<ProtocolId>,
        topic: String,
    },
    Request(TransactionId),
    Response(TransactionId),
}

pub(crate) enum InboundTarget {
    Buffer(BytesMut),
    Short,
    Skip,
}

pub(crate) struct InboundMessage {
    pub(crate) owner: InboundOwner,
    pub(crate) target: InboundTarget,
    pub(crate) len: usize,
}

/// 接收泵状态。
#[derive(Default)]
pub(crate) enum ReceiveState {
    #[default]
    Idle,
    ReceivingHeaderLength,
    ReceivingHeader {
        len: usize,
    },
    EventAvailable {
        protocol: Option<ProtocolId>,
        topic: String,
    },
    RequestAvailable(PendingRequest),
    ResponseAvailable(TransactionId),
    ReceivingMessage(InboundMessage),
    SkippingRequestMessage(StatusReply),
    WaitingForResponse(StatusReply),
    SendingResponse(StatusReply),
}

impl ReceiveState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ReceivingHeaderLength => "receiving-header-length",
            Self::ReceivingHeader { .. } => "receiving-header",
            Self::EventAvailable { .. } => "event-available",
            Self::RequestAvailable(_) => "request-available",
            Self::ResponseAvailable(_) => "response-available",
            Self::ReceivingMessage(_) => "receiving-message",
            Self::SkippingRequestMessage(_) => "skipping-request-message",
            Self::WaitingForResponse(_) => "waiting-for-response",
            Self::SendingResponse(_) => "sending-response",
        }
    }
}

/// 发送泵正在处理的单元。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SendUnit {
    Transaction(TransactionId),
    /// 跳过请求体后的状态回复，不对应任何事务。
    StatusOnlyResponse,
}

pub(crate) enum SendStage {
    Preparing,
    Writing { pieces: VecDeque<Bytes> },
}

/// 发送泵状态。
#[derive(Default)]
pub(crate) enum SendState {
    #[default]
    Idle,
    Sending {
        unit: SendUnit,
        stage: SendStage,
    },
}

pub(crate) struct Stream {
    pub(crate) transport: TransportStreamId,
    pub(crate) phase: HandshakePhase,
    pub(crate) receive: ReceiveState,
    pub(crate) send: SendState,
    /// 已到达但尚未开始读取的入站包长度。
    pub(crate) pending_packet: Option<usize>,
    /// 当前入站包中尚未读取的字节数。
    pub(crate) remaining: usize,
    pub(crate) transactions: TransactionList,
}

impl Stream {
    fn new(transport: TransportStreamId) -> Self {
        Self {
            transport,
            phase: HandshakePhase::WaitingForHelloRequest,
            receive: ReceiveState::Idle,
            send: SendState::Idle,
            pending_packet: None,
            remaining: 0,
            transactions: TransactionList::default(),
        }
    }
}

#[derive(Default)]
struct StreamSlot {
    generation: u32,
    stream: Option<Stream>,
}

/// 固定大小的流表。
pub(crate) struct StreamTable {
    slots: Vec<StreamSlot>,
}

impl StreamTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, StreamSlot::default);
        Self { slots }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 占用第一个空闲槽位；流表已满时返回 `None`。
    pub(crate) fn claim(&mut self, transport: TransportStreamId) -> Option<StreamHandle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.stream.is_none())?;
        slot.stream = Some(Stream::new(transport));
        Some(StreamHandle {
            index: index as u16,
            generation: slot.generation,
        })
    }

    /// 清空槽位并推进代数，返回原来的流。
    pub(crate) fn release(&mut self, handle: StreamHandle) -> Option<Stream> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        let stream = slot.stream.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(stream)
    }

    pub(crate) fn get(&self, handle: StreamHandle) -> Result<&Stream> {
        let slot = self
            .slots
            .get(handle.index())
            .ok_or(DispatchError::UnknownStream)?;
        match &slot.stream {
            Some(stream) if slot.generation == handle.generation => Ok(stream),
            _ => Err(DispatchError::invalid_state("stream is no longer attached")),
        }
    }

    pub(crate) fn get_mut(&mut self, handle: StreamHandle) -> Result<&mut Stream> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(DispatchError::UnknownStream)?;
        match &mut slot.stream {
            Some(stream) if slot.generation == handle.generation => Ok(stream),
            _ => Err(DispatchError::invalid_state("stream is no longer attached")),
        }
    }

    pub(crate) fn is_live(&self, handle: StreamHandle) -> bool {
        self.get(handle).is_ok()
    }

    pub(crate) fn find(&self, transport: TransportStreamId) -> Option<StreamHandle> {
        self.handles()
            .find(|handle| matches!(self.get(*handle), Ok(stream) if stream.transport == transport))
    }

    /// 当前所有活跃流的句柄，按槽位顺序。
    pub(crate) fn handles(&self) -> impl Iterator<Item = StreamHandle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.stream.is_some())
            .map(|(index, slot)| StreamHandle {
                index: index as u16,
                generation: slot.generation,
            })
    }

    pub(crate) fn streams_mut(&mut self) -> impl Iterator<Item = (StreamHandle, &mut Stream)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| {
                let generation = slot.generation;
                slot.stream.as_mut().map(|stream| {
                    (
                        StreamHandle {
                            index: index as u16,
                            generation,
                        },
                        stream,
                    )
                })
            })
    }
}
