//! # dispatcher 模块说明
//!
//! ## 角色定位（Why）
//! - [`Dispatcher`] 是宿主面对的入口：宿主把传输层事件（接入、数据到达、收发完成、失效）
//!   与定时器到期逐一投递进来，分发器推进状态机并回调已注册的协议处理器；
//! - [`DispatcherBuilder`] 在构造期固定配置、协议集合、时钟与随机源。
//!
//! ## 执行模型（How）
//! - 每个入口先推进 [`DispatchCore`] 的状态机，再排空回调队列；
//! - 排空时把处理器从分发器中“借出”，与核心状态分别可变借用，处理器在回调中通过
//!   [`DispatchContext`] 发起的新操作只会追加新的回调，由同一轮排空继续处理。
//!
//! ## 风险提示（Trade-offs）
//! - 分发器不是 `Send`：传输、定时器与处理器都在宿主的单一执行上下文中运行；
//! - 构造期的配置与协议名错误被视为编程错误，直接 panic。

use std::sync::Arc;

use bytes::Bytes;
use rand::SeedableRng;
use rand::RngCore;
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::DispatcherConfig;
use crate::context::DispatchContext;
use crate::control::ControlProtocol;
use crate::engine::{CompletionOwner, DispatchCore, Upcall};
use crate::error::Result;
use crate::protocol::{Completion, DataStreamProtocol, ProtocolId, ProtocolRegistry};
use crate::stream::{HandshakePhase, StreamHandle};
use crate::timer::TimerDriver;
use crate::transaction::{TransactionId, TransactionInfo};
use crate::transport::{DataStreamTransport, TransportError, TransportStreamId};

/// HomeKit 数据流分发器。
pub struct Dispatcher {
    core: DispatchCore,
    control: ControlProtocol,
    protocols: Vec<Box<dyn DataStreamProtocol>>,
}

/// [`Dispatcher`] 构造器。
pub struct DispatcherBuilder {
    transport: Box<dyn DataStreamTransport>,
    timer: Box<dyn TimerDriver>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    rng: Option<Box<dyn RngCore>>,
    protocols: Vec<Box<dyn DataStreamProtocol>>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// 替换时间源，测试中通常注入 [`ManualClock`](crate::ManualClock)。
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 替换请求标识的随机源；默认使用以系统熵播种的 [`StdRng`]。
    pub fn rng(mut self, rng: impl RngCore + 'static) -> Self {
        self.rng = Some(Box::new(rng));
        self
    }

    /// 追加一个协议处理器，注册顺序即握手完成与失效时的通知顺序。
    pub fn protocol(mut self, protocol: impl DataStreamProtocol + 'static) -> Self {
        self.protocols.push(Box::new(protocol));
        self
    }

    /// # Panics
    /// 配置校验失败、协议名为空、重复或占用 `control` 时 panic。
    pub fn build(self) -> Dispatcher {
        if let Err(err) = self.config.validate() {
            panic!("invalid data stream dispatcher configuration: {err}");
        }
        let registry = ProtocolRegistry::new(self.protocols.iter().map(|protocol| protocol.name()));
        let rng = self
            .rng
            .unwrap_or_else(|| Box::new(StdRng::from_entropy()));
        let control = ControlProtocol::new(self.config.control.clone());
        info!(
            target: "hds_dispatcher::dispatcher",
            max_streams = self.config.max_streams,
            protocols = self.protocols.len(),
            "data stream dispatcher created"
        );
        Dispatcher {
            core: DispatchCore::new(
                self.config,
                registry,
                self.transport,
                self.timer,
                self.clock,
                rng,
            ),
            control,
            protocols: self.protocols,
        }
    }
}

impl Dispatcher {
    pub fn builder(
        transport: impl DataStreamTransport + 'static,
        timer: impl TimerDriver + 'static,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            transport: Box::new(transport),
            timer: Box::new(timer),
            config: DispatcherConfig::default(),
            clock: Arc::new(SystemClock),
            rng: None,
            protocols: Vec::new(),
        }
    }

    /// 传输层接入了一条新流。
    ///
    /// 流表已满时要求传输层拆除该流并返回 `None`；同一传输流重复接入返回已有句柄。
    pub fn handle_accept(&mut self, transport: TransportStreamId) -> Option<StreamHandle> {
        let stream = self.core.accept(transport);
        self.drain();
        stream
    }

    /// 传输层报告一个长度为 `len` 的入站包。
    pub fn handle_data(&mut self, transport: TransportStreamId, len: usize) {
        if let Some(stream) = self.lookup(transport, "data") {
            self.core.handle_data(stream, len);
            self.drain();
        }
    }

    /// 传输层已拆除该流；分发器不再回送 `invalidate`。
    pub fn handle_invalidate(&mut self, transport: TransportStreamId) {
        if let Some(stream) = self.lookup(transport, "invalidate") {
            self.core.invalidate(stream, false);
            self.drain();
        }
    }

    pub fn handle_prepare_complete(
        &mut self,
        transport: TransportStreamId,
        result: core::result::Result<(), TransportError>,
    ) {
        if let Some(stream) = self.lookup(transport, "prepare") {
            self.core.handle_prepare_complete(stream, result);
            self.drain();
        }
    }

    pub fn handle_send_complete(
        &mut self,
        transport: TransportStreamId,
        result: core::result::Result<(), TransportError>,
    ) {
        if let Some(stream) = self.lookup(transport, "send") {
            self.core.handle_send_complete(stream, result);
            self.drain();
        }
    }

    pub fn handle_receive_complete(
        &mut self,
        transport: TransportStreamId,
        result: core::result::Result<Bytes, TransportError>,
    ) {
        if let Some(stream) = self.lookup(transport, "receive") {
            self.core.handle_receive_complete(stream, result);
            self.drain();
        }
    }

    pub fn handle_skip_complete(
        &mut self,
        transport: TransportStreamId,
        result: core::result::Result<(), TransportError>,
    ) {
        if let Some(stream) = self.lookup(transport, "skip") {
            self.core.handle_skip_complete(stream, result);
            self.drain();
        }
    }

    /// 宿主定时器到期。
    pub fn handle_timer_expired(&mut self) {
        self.core.handle_timer_expired();
        self.drain();
    }

    /// 在回调之外以 `protocol` 的身份调用分发器 API。
    ///
    /// 闭包返回后排空由此产生的回调。
    pub fn with_protocol<R>(
        &mut self,
        protocol: ProtocolId,
        f: impl FnOnce(&mut DispatchContext<'_>) -> R,
    ) -> R {
        let result = f(&mut DispatchContext::new(&mut self.core, protocol));
        self.drain();
        result
    }

    /// 向对端发送 `control.hello` 心跳请求。
    pub fn send_hello_ping(&mut self, stream: StreamHandle) -> Result<TransactionId> {
        let Self { core, control, .. } = self;
        let result = control.send_hello_ping(&mut DispatchContext::new(core, ProtocolId::CONTROL), stream);
        self.drain();
        result
    }

    /// 按名称查找协议编号。
    pub fn protocol_id(&self, name: &str) -> Option<ProtocolId> {
        self.core.registry.resolve(name)
    }

    pub fn handshake_phase(&self, stream: StreamHandle) -> Result<HandshakePhase> {
        Ok(self.core.streams.get(stream)?.phase)
    }

    /// 流上的事务快照，按创建顺序。
    pub fn transactions(&self, stream: StreamHandle) -> Result<Vec<TransactionInfo>> {
        Ok(self
            .core
            .streams
            .get(stream)?
            .transactions
            .iter()
            .map(|(id, txn)| TransactionInfo {
                id,
                kind: txn.kind,
                state: txn.state,
                protocol: txn.protocol,
                topic: txn.topic.clone(),
            })
            .collect())
    }

    /// 最近一次 `control.version` 交换得到的对端版本。
    pub fn peer_version(&self, stream: StreamHandle) -> Result<Option<f64>> {
        self.core.streams.get(stream)?;
        Ok(self.control.peer_version(stream))
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.core.config
    }

    fn lookup(&self, transport: TransportStreamId, event: &'static str) -> Option<StreamHandle> {
        let stream = self.core.streams.find(transport);
        if stream.is_none() {
            debug!(
                target: "hds_dispatcher::dispatcher",
                transport = transport.0,
                event,
                "ignoring event for unknown transport stream"
            );
        }
        stream
    }

    /// 依次派发回调队列中的所有回调。
    fn drain(&mut self) {
        while let Some(upcall) = self.core.upcalls.pop_front() {
            match upcall {
                Upcall::Accept { protocol, stream } => {
                    if self.core.streams.is_live(stream) {
                        self.dispatch(protocol, |handler, ctx| handler.handle_accept(ctx, stream));
                    }
                }
                Upcall::Invalidate { protocol, stream } => {
                    self.dispatch(protocol, |handler, ctx| handler.handle_invalidate(ctx, stream));
                }
                Upcall::EventAvailable {
                    protocol,
                    stream,
                    topic,
                    len,
                } => {
                    if self.core.is_awaiting_decision(stream) {
                        self.dispatch(protocol, |handler, ctx| {
                            handler.handle_event_available(ctx, stream, &topic, len)
                        });
                    }
                }
                Upcall::RequestAvailable {
                    protocol,
                    stream,
                    topic,
                    len,
                } => {
                    if self.core.is_awaiting_decision(stream) {
                        self.dispatch(protocol, |handler, ctx| {
                            handler.handle_request_available(ctx, stream, &topic, len)
                        });
                    }
                }
                Upcall::ResponseAvailable {
                    protocol,
                    stream,
                    transaction,
                    topic,
                    status,
                    len,
                } => {
                    if self.core.is_awaiting_decision(stream) {
                        self.dispatch(protocol, |handler, ctx| {
                            handler.handle_response_available(ctx, stream, transaction, &topic, status, len)
                        });
                    }
                }
                Upcall::Complete {
                    owner: CompletionOwner::Protocol(protocol),
                    completion,
                } => {
                    self.dispatch(protocol, |handler, ctx| handler.handle_completion(ctx, completion));
                }
                Upcall::Complete {
                    owner: CompletionOwner::Internal,
                    completion,
                } => log_internal_completion(&completion),
            }
        }
    }

    fn dispatch(
        &mut self,
        protocol: ProtocolId,
        f: impl FnOnce(&mut dyn DataStreamProtocol, &mut DispatchContext<'_>),
    ) {
        let Self {
            core,
            control,
            protocols,
        } = self;
        let handler: &mut dyn DataStreamProtocol = if protocol.is_control() {
            control
        } else {
            match protocol.user_index().and_then(|index| protocols.get_mut(index)) {
                Some(handler) => handler.as_mut(),
                None => return,
            }
        };
        f(handler, &mut DispatchContext::new(core, protocol));
    }
}

/// 分发器代未注册协议完成的操作只记录日志。
fn log_internal_completion(completion: &Completion) {
    match completion {
        Completion::EventReceived { stream, topic, result, .. } => debug!(
            target: "hds_dispatcher::dispatcher",
            stream = %stream,
            topic = topic.as_str(),
            ok = result.is_ok(),
            "skipped event from unregistered protocol"
        ),
        Completion::RequestReplied {
            stream,
            topic,
            status,
            result,
        } => debug!(
            target: "hds_dispatcher::dispatcher",
            stream = %stream,
            topic = topic.as_str(),
            %status,
            ok = result.is_ok(),
            "rejected request from unregistered protocol"
        ),
        other => debug!(
            target: "hds_dispatcher::dispatcher",
            stream = %other.stream(),
            "internal operation completed"
        ),
    }
}
