//! # hds-dispatcher
//!
//! ## 角色定位（Why）
//! - HomeKit Data Stream 在一条可靠、有序、已分包的字节流上复用多个应用协议；
//!   本 crate 负责该复用层：解析报文头、把事件/请求/响应派发给按名称注册的协议处理器、
//!   关联请求与响应、执行超时，并在任何协议错误时让整条流失效；
//! - 内置 `control` 协议完成 hello 握手，握手完成前其余协议既收不到消息也不能发送。
//!
//! ## 模块划分（What）
//! - [`Dispatcher`] / [`DispatcherBuilder`]：宿主入口，接收传输与定时器事件；
//! - [`DataStreamProtocol`] 与 [`DispatchContext`]：处理器能力集及其可调用的 API；
//! - [`DataStreamTransport`] / [`TimerDriver`] / [`Clock`]：宿主需要提供的外部能力；
//! - [`header`]：报文头编解码与 255 字节预算；
//! - [`DispatcherConfig`]：流数量、超时、短消息容量与控制协议参数，可从 TOML 加载。
//!
//! ## 使用建议（How）
//! - 宿主在单一执行上下文中投递所有事件，分发器在每个入口返回前完成所有处理器回调；
//! - 测试中注入 [`ManualClock`] 与固定种子的随机源，即可得到完全确定的行为。
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod clock;
mod config;
mod context;
mod control;
mod dispatcher;
mod engine;
mod error;
pub mod header;
mod protocol;
mod receive;
mod send;
mod status;
mod stream;
mod timer;
mod transaction;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ControlConfig, DispatcherConfig, MAX_PACKET_LEN, MAX_TIMEOUT_MS};
pub use context::DispatchContext;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{DispatchError, Result, codes};
pub use protocol::{
    CONTROL_PROTOCOL_NAME, Completion, DataStreamProtocol, OutgoingMessage, ProtocolId,
    ReceivedMessage,
};
pub use status::ResponseStatus;
pub use stream::{HandshakePhase, StreamHandle};
pub use timer::{TimerDriver, TimerError};
pub use transaction::{TransactionId, TransactionInfo, TransactionKind, TransactionState};
pub use transport::{DataStreamTransport, StreamPriority, TransportError, TransportStreamId};
