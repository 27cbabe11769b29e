//! 集成测试共享夹具：记录命令的传输层、手动定时器、可配置的记录型协议处理器，
//! 以及把入站包逐段喂给分发器的驱动器。

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use hds_dispatcher::header::MessageHeader;
use hds_dispatcher::{
    Completion, DataStreamProtocol, DataStreamTransport, DispatchContext, Dispatcher,
    DispatcherConfig, HandshakePhase, ManualClock, ResponseStatus, StreamHandle, StreamPriority,
    TimerDriver, TimerError, TransactionId, TransportStreamId,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

pub const TCP: TransportStreamId = TransportStreamId(7);

/// 传输层收到的命令。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportCall {
    Prepare { stream: u64, len: usize },
    Send { stream: u64, bytes: Bytes },
    Receive { stream: u64, len: usize },
    Skip { stream: u64, len: usize },
    Invalidate { stream: u64 },
    Priority { stream: u64, priority: StreamPriority },
}

#[derive(Clone, Default)]
pub struct MockTransport {
    pending: Rc<RefCell<VecDeque<TransportCall>>>,
    history: Rc<RefCell<Vec<TransportCall>>>,
}

impl MockTransport {
    fn record(&self, call: TransportCall) {
        self.history.borrow_mut().push(call.clone());
        self.pending.borrow_mut().push_back(call);
    }

    pub fn next_pending(&self) -> Option<TransportCall> {
        self.pending.borrow_mut().pop_front()
    }

    pub fn pending(&self) -> Vec<TransportCall> {
        self.pending.borrow().iter().cloned().collect()
    }

    pub fn history(&self) -> Vec<TransportCall> {
        self.history.borrow().clone()
    }

    pub fn invalidated(&self, stream: TransportStreamId) -> bool {
        self.history
            .borrow()
            .iter()
            .any(|call| *call == TransportCall::Invalidate { stream: stream.0 })
    }
}

impl DataStreamTransport for MockTransport {
    fn prepare(&mut self, stream: TransportStreamId, total_len: usize) {
        self.record(TransportCall::Prepare {
            stream: stream.0,
            len: total_len,
        });
    }

    fn send(&mut self, stream: TransportStreamId, bytes: Bytes) {
        self.record(TransportCall::Send {
            stream: stream.0,
            bytes,
        });
    }

    fn receive(&mut self, stream: TransportStreamId, len: usize) {
        self.record(TransportCall::Receive {
            stream: stream.0,
            len,
        });
    }

    fn skip(&mut self, stream: TransportStreamId, len: usize) {
        self.record(TransportCall::Skip {
            stream: stream.0,
            len,
        });
    }

    fn invalidate(&mut self, stream: TransportStreamId) {
        self.record(TransportCall::Invalidate { stream: stream.0 });
    }

    fn set_minimum_priority(&mut self, stream: TransportStreamId, priority: StreamPriority) {
        self.record(TransportCall::Priority {
            stream: stream.0,
            priority,
        });
    }
}

/// 只记录最近一次布置的截止时间。
#[derive(Clone, Default)]
pub struct MockTimer {
    deadline: Rc<RefCell<Option<Instant>>>,
}

impl MockTimer {
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }
}

impl TimerDriver for MockTimer {
    fn arm(&mut self, deadline: Instant) -> Result<(), TimerError> {
        *self.deadline.borrow_mut() = Some(deadline);
        Ok(())
    }

    fn disarm(&mut self) {
        *self.deadline.borrow_mut() = None;
    }
}

/// 处理器对“可用”通知的反应。
#[derive(Clone, Debug)]
pub enum Policy {
    /// 不做决定，留给测试稍后通过 `with_protocol` 处理。
    Defer,
    Skip,
    Short,
    Buffer,
    Reply(ResponseStatus),
}

/// 处理器观察到的回调。
#[derive(Debug)]
pub enum Record {
    Accept(StreamHandle),
    Invalidate(StreamHandle),
    EventAvailable {
        stream: StreamHandle,
        topic: String,
        len: usize,
    },
    RequestAvailable {
        stream: StreamHandle,
        topic: String,
        len: usize,
    },
    ResponseAvailable {
        stream: StreamHandle,
        transaction: TransactionId,
        topic: String,
        status: ResponseStatus,
        len: usize,
    },
    Completion(Completion),
}

pub type Log = Rc<RefCell<Vec<(String, Record)>>>;

#[derive(Clone)]
pub struct RecordingProtocol {
    name: String,
    log: Log,
    pub on_event: Policy,
    pub on_request: Policy,
    pub on_response: Policy,
    /// 请求体接收完成后自动回复的状态与消息体。
    pub respond_with: Option<(ResponseStatus, Bytes)>,
}

impl RecordingProtocol {
    pub fn new(name: &str, log: &Log) -> Self {
        Self {
            name: name.to_owned(),
            log: Rc::clone(log),
            on_event: Policy::Short,
            on_request: Policy::Short,
            on_response: Policy::Short,
            respond_with: Some((ResponseStatus::Success, Bytes::from_static(&[0xE0]))),
        }
    }

    fn push(&self, record: Record) {
        self.log.borrow_mut().push((self.name.clone(), record));
    }
}

impl DataStreamProtocol for RecordingProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_accept(&mut self, _ctx: &mut DispatchContext<'_>, stream: StreamHandle) {
        self.push(Record::Accept(stream));
    }

    fn handle_invalidate(&mut self, _ctx: &mut DispatchContext<'_>, stream: StreamHandle) {
        self.push(Record::Invalidate(stream));
    }

    fn handle_event_available(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        topic: &str,
        len: usize,
    ) {
        self.push(Record::EventAvailable {
            stream,
            topic: topic.to_owned(),
            len,
        });
        let result = match self.on_event {
            Policy::Defer | Policy::Reply(_) => Ok(()),
            Policy::Skip => ctx.skip_event(stream),
            Policy::Short => ctx.receive_short_event(stream),
            Policy::Buffer => ctx.receive_event(stream, BytesMut::new()),
        };
        result.expect("接收事件");
    }

    fn handle_request_available(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        topic: &str,
        len: usize,
    ) {
        self.push(Record::RequestAvailable {
            stream,
            topic: topic.to_owned(),
            len,
        });
        let result = match self.on_request {
            Policy::Defer => Ok(()),
            Policy::Skip => ctx.skip_request(stream).map(drop),
            Policy::Short => ctx.receive_short_request(stream).map(drop),
            Policy::Buffer => ctx.receive_request(stream, BytesMut::new()).map(drop),
            Policy::Reply(status) => ctx.skip_and_reply_to_request(stream, status),
        };
        result.expect("接收请求");
    }

    fn handle_response_available(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        transaction: TransactionId,
        topic: &str,
        status: ResponseStatus,
        len: usize,
    ) {
        self.push(Record::ResponseAvailable {
            stream,
            transaction,
            topic: topic.to_owned(),
            status,
            len,
        });
        let result = match self.on_response {
            Policy::Defer | Policy::Reply(_) => Ok(()),
            Policy::Skip => ctx.skip_response(stream, transaction),
            Policy::Short => ctx.receive_short_response(stream, transaction),
            Policy::Buffer => ctx.receive_response(stream, transaction, BytesMut::new()),
        };
        result.expect("接收响应");
    }

    fn handle_completion(&mut self, ctx: &mut DispatchContext<'_>, completion: Completion) {
        if let Completion::RequestReceived {
            stream,
            transaction,
            result: Ok(()),
            ..
        } = &completion
        {
            if let Some((status, message)) = self.respond_with.clone() {
                ctx.send_response(*stream, *transaction, status, message)
                    .expect("回复请求");
            }
        }
        self.push(Record::Completion(completion));
    }
}

/// 已写出的一条完整消息。
#[derive(Clone, Debug)]
pub struct SentMessage {
    pub prepared_len: usize,
    pub bytes: Vec<u8>,
}

impl SentMessage {
    pub fn header(&self) -> MessageHeader<'_> {
        let len = usize::from(self.bytes[0]);
        MessageHeader::decode(&self.bytes[1..1 + len]).expect("出站报文头")
    }

    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.bytes[0]);
        &self.bytes[1 + len..]
    }
}

/// 分发器与全部测试替身的组合。
pub struct Harness {
    pub dispatcher: Dispatcher,
    pub transport: MockTransport,
    pub timer: MockTimer,
    pub clock: Arc<ManualClock>,
    pub log: Log,
    inbound: HashMap<u64, BytesMut>,
    outbound: HashMap<u64, Vec<SentMessage>>,
}

impl Harness {
    pub fn new(protocols: impl FnOnce(&Log) -> Vec<RecordingProtocol>) -> Self {
        Self::with_config(DispatcherConfig::default(), protocols)
    }

    pub fn with_config(
        config: DispatcherConfig,
        protocols: impl FnOnce(&Log) -> Vec<RecordingProtocol>,
    ) -> Self {
        let log: Log = Rc::default();
        let transport = MockTransport::default();
        let timer = MockTimer::default();
        let clock = Arc::new(ManualClock::new());
        let mut builder = Dispatcher::builder(transport.clone(), timer.clone())
            .config(config)
            .clock(clock.clone())
            .rng(StdRng::seed_from_u64(0x4844_5321));
        for protocol in protocols(&log) {
            builder = builder.protocol(protocol);
        }
        Self {
            dispatcher: builder.build(),
            transport,
            timer,
            clock,
            log,
            inbound: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    pub fn accept(&mut self, transport: TransportStreamId) -> StreamHandle {
        let stream = self.dispatcher.handle_accept(transport).expect("接入流");
        self.pump();
        stream
    }

    /// 接入并完成 hello 握手。
    pub fn connect(&mut self, transport: TransportStreamId) -> StreamHandle {
        let stream = self.accept(transport);
        self.deliver(transport, &packet(MessageHeader::request("control", "hello", 1), &[0xE0]));
        self.take_sent(transport);
        assert_eq!(
            self.dispatcher.handshake_phase(stream),
            Ok(HandshakePhase::Connected)
        );
        stream
    }

    /// 把一个完整入站包交给分发器，并驱动所有后续命令。
    pub fn deliver(&mut self, transport: TransportStreamId, packet: &[u8]) {
        self.inbound
            .entry(transport.0)
            .or_default()
            .extend_from_slice(packet);
        self.dispatcher.handle_data(transport, packet.len());
        self.pump();
    }

    /// 依次完成传输层收到的所有命令，直到没有新命令为止。
    pub fn pump(&mut self) {
        while let Some(call) = self.transport.next_pending() {
            self.complete(call);
        }
    }

    /// 只完成下一条命令。
    pub fn step(&mut self) -> Option<TransportCall> {
        let call = self.transport.next_pending()?;
        self.complete(call.clone());
        Some(call)
    }

    /// 完成一条命令，包括先前用 `MockTransport::next_pending` 暂扣的命令。
    pub fn complete(&mut self, call: TransportCall) {
        match call {
            TransportCall::Prepare { stream, len } => {
                self.outbound.entry(stream).or_default().push(SentMessage {
                    prepared_len: len,
                    bytes: Vec::new(),
                });
                self.dispatcher
                    .handle_prepare_complete(TransportStreamId(stream), Ok(()));
            }
            TransportCall::Send { stream, bytes } => {
                if let Some(message) = self.outbound.entry(stream).or_default().last_mut() {
                    message.bytes.extend_from_slice(&bytes);
                }
                self.dispatcher
                    .handle_send_complete(TransportStreamId(stream), Ok(()));
            }
            TransportCall::Receive { stream, len } => {
                let inbound = self.inbound.entry(stream).or_default();
                let bytes = inbound.split_to(len.min(inbound.len())).freeze();
                self.dispatcher
                    .handle_receive_complete(TransportStreamId(stream), Ok(bytes));
            }
            TransportCall::Skip { stream, len } => {
                let inbound = self.inbound.entry(stream).or_default();
                inbound.advance(len.min(inbound.len()));
                self.dispatcher
                    .handle_skip_complete(TransportStreamId(stream), Ok(()));
            }
            TransportCall::Invalidate { stream } => {
                self.inbound.remove(&stream);
            }
            TransportCall::Priority { .. } => {}
        }
    }

    /// 取走该流上已完整写出的消息。
    pub fn take_sent(&mut self, transport: TransportStreamId) -> Vec<SentMessage> {
        self.outbound.remove(&transport.0).unwrap_or_default()
    }

    pub fn advance(&mut self, delta: Duration) {
        self.clock.advance(delta);
    }

    /// 取走到目前为止的回调记录。
    pub fn drain_log(&self) -> Vec<(String, Record)> {
        self.log.borrow_mut().drain(..).collect()
    }
}

/// 组装 `HeaderLen + 报文头 + 消息体`。
pub fn packet(header: MessageHeader<'_>, payload: &[u8]) -> Vec<u8> {
    let mut bytes = BytesMut::new();
    header.encode(&mut bytes).expect("编码报文头");
    bytes.extend_from_slice(payload);
    bytes.to_vec()
}

/// `{"version": <value>}`，以 f64 编码。
pub fn version_payload(value: f64) -> Vec<u8> {
    let mut writer = hds_opack::OpackWriter::new();
    writer.begin_dictionary().expect("字典");
    writer.write_str("version").expect("键");
    writer.write_float(value).expect("值");
    writer.write_terminator().expect("终止符");
    writer.freeze().to_vec()
}

/// 只保留某个协议收到的完成事件。
pub fn completions<'a>(log: &'a [(String, Record)], protocol: &str) -> Vec<&'a Completion> {
    log.iter()
        .filter(|(name, _)| name == protocol)
        .filter_map(|(_, record)| match record {
            Record::Completion(completion) => Some(completion),
            _ => None,
        })
        .collect()
}
