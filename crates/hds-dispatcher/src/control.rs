//! # control 模块说明
//!
//! ## 角色定位（Why）
//! - 内置 `control` 协议负责连接握手：对端必须先发送 `control.hello` 请求，
//!   本端回复带能力字典的成功响应后，流才进入 `Connected` 并通知其余协议；
//! - 握手完成后支持 `control.version` 版本交换，以及向对端发送 hello 心跳。
//!
//! ## 状态机（What）
//! - `WaitingForHelloRequest`：只接受 `hello` 请求，其余消息使流失效；
//! - `SendingHelloResponse`：握手回复尚未写完，任何入站控制消息都使流失效；
//! - `Connected`：控制事件被跳过；`version` 请求被应答；其余请求回复 `HeaderError`。
//!
//! ## 风险提示（Trade-offs）
//! - 对端版本按流槽位保存，流失效时清除；未收到 `version` 请求前使用配置中的默认值。

use bytes::Bytes;
use hds_opack::{OpackWriter, read_string_dictionary};
use tracing::{debug, info, warn};

use crate::config::ControlConfig;
use crate::context::DispatchContext;
use crate::error::{DispatchError, Result};
use crate::protocol::{CONTROL_PROTOCOL_NAME, Completion, DataStreamProtocol, ReceivedMessage};
use crate::status::ResponseStatus;
use crate::stream::{HandshakePhase, StreamHandle};
use crate::transaction::TransactionId;

const TOPIC_HELLO: &str = "hello";
const TOPIC_VERSION: &str = "version";
const KEY_VERSION: &str = "version";
const EMPTY_DICTIONARY: &[u8] = &[0xE0];

/// 内置握手协议。
pub(crate) struct ControlProtocol {
    config: ControlConfig,
    /// 以流槽位下标索引的对端版本。
    peers: Vec<Option<f64>>,
}

impl ControlProtocol {
    pub(crate) fn new(config: ControlConfig) -> Self {
        Self {
            config,
            peers: Vec::new(),
        }
    }

    pub(crate) fn peer_version(&self, stream: StreamHandle) -> Option<f64> {
        self.peers.get(stream.index()).copied().flatten()
    }

    fn set_peer_version(&mut self, stream: StreamHandle, version: Option<f64>) {
        let index = stream.index();
        if self.peers.len() <= index {
            self.peers.resize(index + 1, None);
        }
        self.peers[index] = version;
    }

    /// 向对端发送 `control.hello` 心跳。
    ///
    /// 流未完成握手或对端版本低于配置门限时返回 `InvalidState`。
    pub(crate) fn send_hello_ping(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
    ) -> Result<TransactionId> {
        if ctx.handshake_phase(stream)? != HandshakePhase::Connected {
            return Err(DispatchError::invalid_state("data stream handshake is not complete"));
        }
        let peer_version = self
            .peer_version(stream)
            .unwrap_or(self.config.default_peer_version);
        if peer_version < self.config.min_peer_version_for_ping {
            debug!(
                target: "hds_dispatcher::control",
                stream = %stream,
                peer_version,
                "peer does not support hello pings"
            );
            return Err(DispatchError::invalid_state("peer does not support hello pings"));
        }
        ctx.send_request(stream, TOPIC_HELLO, Bytes::from_static(EMPTY_DICTIONARY))
    }

    fn version_response(&self) -> Result<Bytes> {
        let mut writer = OpackWriter::new();
        writer.begin_dictionary()?;
        writer.write_str(KEY_VERSION)?;
        writer.write_float(self.config.accessory_version)?;
        writer.write_terminator()?;
        Ok(writer.freeze())
    }

    fn handle_version_request(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        transaction: TransactionId,
        message: &ReceivedMessage,
    ) {
        let (status, payload) = match parse_version(message) {
            Ok(peer_version) => {
                info!(
                    target: "hds_dispatcher::control",
                    stream = %stream,
                    peer_version,
                    "peer data stream version"
                );
                self.set_peer_version(stream, Some(peer_version));
                match self.version_response() {
                    Ok(payload) => (ResponseStatus::Success, payload),
                    Err(err) => {
                        warn!(
                            target: "hds_dispatcher::control",
                            stream = %stream,
                            error = %err,
                            "cannot encode version response"
                        );
                        (ResponseStatus::OutOfMemory, Bytes::from_static(EMPTY_DICTIONARY))
                    }
                }
            }
            Err(reason) => {
                warn!(
                    target: "hds_dispatcher::control",
                    stream = %stream,
                    reason,
                    "received malformed version request"
                );
                (ResponseStatus::PayloadError, Bytes::from_static(EMPTY_DICTIONARY))
            }
        };
        if let Err(err) = ctx.send_response(stream, transaction, status, payload) {
            warn!(
                target: "hds_dispatcher::control",
                stream = %stream,
                error = %err,
                "cannot send version response"
            );
        }
    }

    fn reply_or_invalidate(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        status: ResponseStatus,
    ) {
        if let Err(err) = ctx.skip_and_reply_to_request(stream, status) {
            warn!(
                target: "hds_dispatcher::control",
                stream = %stream,
                error = %err,
                "cannot reply to control request"
            );
            invalidate(ctx, stream);
        }
    }
}

fn parse_version(message: &ReceivedMessage) -> core::result::Result<f64, &'static str> {
    let ReceivedMessage::Short(bytes) = message else {
        return Err("version request is too long");
    };
    let mut values =
        read_string_dictionary(bytes, &[KEY_VERSION]).map_err(|_| "payload is not a dictionary")?;
    let mut version = values
        .pop()
        .flatten()
        .ok_or("payload does not contain `version`")?;
    version
        .next_number()
        .ok()
        .and_then(|number| number.as_f64())
        .ok_or("`version` is not a number")
}

fn invalidate(ctx: &mut DispatchContext<'_>, stream: StreamHandle) {
    if let Err(err) = ctx.invalidate(stream) {
        debug!(
            target: "hds_dispatcher::control",
            stream = %stream,
            error = %err,
            "stream already invalidated"
        );
    }
}

impl DataStreamProtocol for ControlProtocol {
    fn name(&self) -> &str {
        CONTROL_PROTOCOL_NAME
    }

    fn handle_accept(&mut self, ctx: &mut DispatchContext<'_>, stream: StreamHandle) {
        self.set_peer_version(stream, None);
        if let Err(err) = ctx.set_handshake_phase(stream, HandshakePhase::WaitingForHelloRequest) {
            debug!(
                target: "hds_dispatcher::control",
                stream = %stream,
                error = %err,
                "accepted stream vanished before handshake"
            );
            return;
        }
        debug!(target: "hds_dispatcher::control", stream = %stream, "waiting for hello request");
    }

    fn handle_invalidate(&mut self, _ctx: &mut DispatchContext<'_>, stream: StreamHandle) {
        self.set_peer_version(stream, None);
    }

    fn handle_event_available(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        topic: &str,
        len: usize,
    ) {
        match ctx.handshake_phase(stream) {
            Ok(HandshakePhase::Connected) => {
                info!(
                    target: "hds_dispatcher::control",
                    stream = %stream,
                    topic,
                    len,
                    "skipping unsupported control event"
                );
                if let Err(err) = ctx.skip_event(stream) {
                    warn!(
                        target: "hds_dispatcher::control",
                        stream = %stream,
                        error = %err,
                        "cannot skip control event"
                    );
                    invalidate(ctx, stream);
                }
            }
            phase => {
                warn!(
                    target: "hds_dispatcher::control",
                    stream = %stream,
                    topic,
                    phase = ?phase,
                    "received control event during handshake"
                );
                invalidate(ctx, stream);
            }
        }
    }

    fn handle_request_available(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        topic: &str,
        len: usize,
    ) {
        let phase = match ctx.handshake_phase(stream) {
            Ok(phase) => phase,
            Err(_) => return,
        };
        match (phase, topic) {
            (HandshakePhase::WaitingForHelloRequest, TOPIC_HELLO) => {
                info!(target: "hds_dispatcher::control", stream = %stream, "received hello request");
                self.set_peer_version(stream, Some(self.config.default_peer_version));
                if ctx
                    .set_handshake_phase(stream, HandshakePhase::SendingHelloResponse)
                    .is_ok()
                {
                    self.reply_or_invalidate(ctx, stream, ResponseStatus::Success);
                }
            }
            (HandshakePhase::WaitingForHelloRequest | HandshakePhase::SendingHelloResponse, _) => {
                warn!(
                    target: "hds_dispatcher::control",
                    stream = %stream,
                    topic,
                    phase = ?phase,
                    "received unexpected control request during handshake"
                );
                invalidate(ctx, stream);
            }
            (HandshakePhase::Connected, TOPIC_VERSION) => {
                if let Err(err) = ctx.receive_short_request(stream) {
                    warn!(
                        target: "hds_dispatcher::control",
                        stream = %stream,
                        error = %err,
                        "cannot receive version request"
                    );
                    invalidate(ctx, stream);
                }
            }
            (HandshakePhase::Connected, _) => {
                info!(
                    target: "hds_dispatcher::control",
                    stream = %stream,
                    topic,
                    len,
                    "rejecting unsupported control request"
                );
                self.reply_or_invalidate(ctx, stream, ResponseStatus::HeaderError);
            }
        }
    }

    fn handle_response_available(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        stream: StreamHandle,
        transaction: TransactionId,
        topic: &str,
        status: ResponseStatus,
        _len: usize,
    ) {
        if topic == TOPIC_HELLO {
            info!(target: "hds_dispatcher::control", stream = %stream, %status, "hello ping answered");
        }
        if let Err(err) = ctx.skip_response(stream, transaction) {
            warn!(
                target: "hds_dispatcher::control",
                stream = %stream,
                error = %err,
                "cannot skip control response"
            );
        }
    }

    fn handle_completion(&mut self, ctx: &mut DispatchContext<'_>, completion: Completion) {
        match completion {
            Completion::RequestReplied {
                stream,
                topic,
                status,
                result: Ok(()),
            } if topic == TOPIC_HELLO && status.is_success() => {
                if ctx.handshake_phase(stream) != Ok(HandshakePhase::SendingHelloResponse) {
                    return;
                }
                if ctx
                    .set_handshake_phase(stream, HandshakePhase::Connected)
                    .is_ok()
                {
                    info!(target: "hds_dispatcher::control", stream = %stream, "handshake complete");
                    ctx.announce_accept(stream);
                }
            }
            Completion::RequestReceived {
                stream,
                transaction,
                topic,
                message,
                result: Ok(()),
            } if topic == TOPIC_VERSION => {
                self.handle_version_request(ctx, stream, transaction, &message);
            }
            other => {
                if let Err(err) = other.result() {
                    debug!(
                        target: "hds_dispatcher::control",
                        stream = %other.stream(),
                        error = %err,
                        "control operation aborted"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_payload_is_parsed_from_short_messages() {
        let mut writer = OpackWriter::new();
        writer.begin_dictionary().expect("字典");
        writer.write_str("version").expect("键");
        writer.write_float(1.1).expect("值");
        writer.write_terminator().expect("终止符");
        let message = ReceivedMessage::Short(writer.freeze());
        assert_eq!(parse_version(&message), Ok(1.1));

        let integer = ReceivedMessage::Short(Bytes::from_static(&[
            0xE1, 0x47, b'v', b'e', b'r', b's', b'i', b'o', b'n', 0x09,
        ]));
        assert_eq!(parse_version(&integer), Ok(1.0));
    }

    #[test]
    fn malformed_version_payloads_are_rejected() {
        assert!(parse_version(&ReceivedMessage::Skipped { len: 500 }).is_err());
        assert!(parse_version(&ReceivedMessage::Short(Bytes::from_static(&[0xE0]))).is_err());
        assert!(parse_version(&ReceivedMessage::Short(Bytes::from_static(&[0x01]))).is_err());
    }

    #[test]
    fn version_response_reports_accessory_version() {
        let control = ControlProtocol::new(ControlConfig::default());
        let payload = control.version_response().expect("编码");
        let mut values = read_string_dictionary(&payload, &["version"]).expect("字典");
        let mut version = values.pop().flatten().expect("version 键");
        assert_eq!(version.next_float().expect("浮点"), 1.1);
    }
}
