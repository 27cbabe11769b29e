//! `control` 协议握手、版本交换与心跳的端到端测试。

mod support;

use bytes::Bytes;
use hds_dispatcher::header::{MessageHeader, MessageKind};
use hds_dispatcher::{DispatchError, HandshakePhase, ResponseStatus};
use hds_opack::read_string_dictionary;
use support::*;
use tracing_test::traced_test;

fn two_protocols() -> Harness {
    Harness::new(|log| {
        vec![
            RecordingProtocol::new("dataSend", log),
            RecordingProtocol::new("stream", log),
        ]
    })
}

#[test]
#[traced_test]
fn hello_request_completes_handshake_and_announces_protocols_in_order() {
    let mut h = two_protocols();
    let stream = h.accept(TCP);
    assert_eq!(
        h.dispatcher.handshake_phase(stream),
        Ok(HandshakePhase::WaitingForHelloRequest)
    );
    assert!(h.drain_log().is_empty(), "握手前不通知用户协议");

    h.deliver(TCP, &packet(MessageHeader::request("control", "hello", 42), &[0xE0]));

    let sent = h.take_sent(TCP);
    assert_eq!(sent.len(), 1);
    let reply = &sent[0];
    assert_eq!(reply.prepared_len, reply.bytes.len());
    let header = reply.header();
    assert_eq!(header.protocol, "control");
    assert_eq!(header.kind, MessageKind::Response);
    assert_eq!(header.topic, "hello");
    assert_eq!(header.id, Some(42));
    assert_eq!(header.status, Some(ResponseStatus::Success));
    let mut values =
        read_string_dictionary(reply.payload(), &["capability-version"]).expect("能力字典");
    let mut capability = values[0].take().expect("能力版本");
    assert!(capability.next_bool().expect("布尔值"));

    assert_eq!(
        h.dispatcher.handshake_phase(stream),
        Ok(HandshakePhase::Connected)
    );
    let accepted: Vec<String> = h
        .drain_log()
        .into_iter()
        .filter(|(_, record)| matches!(record, Record::Accept(s) if *s == stream))
        .map(|(name, _)| name)
        .collect();
    assert_eq!(accepted, ["dataSend", "stream"]);
    assert!(logs_contain("handshake complete"));
}

#[test]
#[traced_test]
fn control_request_other_than_hello_before_handshake_invalidates() {
    let mut h = two_protocols();
    let stream = h.accept(TCP);
    h.deliver(TCP, &packet(MessageHeader::request("control", "version", 1), &[0xE0]));

    assert!(h.transport.invalidated(TCP));
    assert!(matches!(
        h.dispatcher.handshake_phase(stream),
        Err(DispatchError::InvalidState { .. })
    ));
    assert!(h.drain_log().is_empty(), "未完成握手时只通知 control");
    assert!(logs_contain("handshake incomplete"));
}

#[test]
fn user_message_before_handshake_invalidates() {
    let mut h = two_protocols();
    let stream = h.accept(TCP);
    h.deliver(TCP, &packet(MessageHeader::event("dataSend", "data"), &[0xE0]));

    assert!(h.transport.invalidated(TCP));
    assert!(h.dispatcher.handshake_phase(stream).is_err());
    assert!(h.drain_log().is_empty());
}

#[test]
fn user_protocol_cannot_send_before_handshake() {
    let mut h = two_protocols();
    let stream = h.accept(TCP);
    let protocol = h.dispatcher.protocol_id("dataSend").expect("已注册");
    let result = h
        .dispatcher
        .with_protocol(protocol, |ctx| ctx.send_event(stream, "data", Bytes::new()));
    assert!(matches!(result, Err(DispatchError::InvalidState { .. })));
    assert!(h.transport.pending().is_empty(), "没有任何发送命令");
}

#[test]
fn version_request_records_peer_version_and_reports_ours() {
    let mut h = two_protocols();
    let stream = h.connect(TCP);
    assert_eq!(h.dispatcher.peer_version(stream), Ok(Some(1.0)));

    h.deliver(
        TCP,
        &packet(MessageHeader::request("control", "version", 9), &version_payload(1.2)),
    );

    let sent = h.take_sent(TCP);
    assert_eq!(sent.len(), 1);
    let header = sent[0].header();
    assert_eq!(
        (header.kind, header.topic, header.id, header.status),
        (MessageKind::Response, "version", Some(9), Some(ResponseStatus::Success))
    );
    let mut values = read_string_dictionary(sent[0].payload(), &["version"]).expect("响应字典");
    let mut version = values[0].take().expect("version 键");
    assert_eq!(version.next_float().expect("浮点"), 1.1);
    assert_eq!(h.dispatcher.peer_version(stream), Ok(Some(1.2)));
    assert!(h.dispatcher.transactions(stream).expect("事务").is_empty());
}

#[test]
fn malformed_version_request_is_answered_with_payload_error() {
    let mut h = two_protocols();
    let stream = h.connect(TCP);
    h.deliver(TCP, &packet(MessageHeader::request("control", "version", 3), &[0xE0]));

    let sent = h.take_sent(TCP);
    assert_eq!(sent[0].header().status, Some(ResponseStatus::PayloadError));
    assert_eq!(sent[0].payload(), [0xE0]);
    assert_eq!(h.dispatcher.peer_version(stream), Ok(Some(1.0)));
}

#[test]
fn hello_ping_requires_a_peer_that_supports_it() {
    let mut h = two_protocols();
    let stream = h.connect(TCP);
    assert!(matches!(
        h.dispatcher.send_hello_ping(stream),
        Err(DispatchError::InvalidState { .. })
    ));

    h.deliver(
        TCP,
        &packet(MessageHeader::request("control", "version", 5), &version_payload(1.1)),
    );
    h.take_sent(TCP);

    h.dispatcher.send_hello_ping(stream).expect("对端支持心跳");
    h.pump();
    let sent = h.take_sent(TCP);
    let header = sent[0].header();
    assert_eq!((header.protocol, header.kind, header.topic), ("control", MessageKind::Request, "hello"));
    assert_eq!(sent[0].payload(), [0xE0]);
    let request_id = header.id.expect("请求标识");
    assert_eq!(h.dispatcher.transactions(stream).expect("事务").len(), 1);

    h.deliver(
        TCP,
        &packet(
            MessageHeader::response("control", "hello", request_id, ResponseStatus::Success),
            &[0xE0],
        ),
    );
    assert!(h.dispatcher.transactions(stream).expect("事务").is_empty());
    assert!(!h.transport.invalidated(TCP));
}

#[test]
fn unsupported_control_traffic_after_handshake_is_tolerated() {
    let mut h = two_protocols();
    let stream = h.connect(TCP);

    h.deliver(TCP, &packet(MessageHeader::event("control", "status"), &[0xE0]));
    h.deliver(TCP, &packet(MessageHeader::request("control", "reset", 11), &[0xE0]));

    let sent = h.take_sent(TCP);
    assert_eq!(sent.len(), 1);
    let header = sent[0].header();
    assert_eq!((header.topic, header.id), ("reset", Some(11)));
    assert_eq!(header.status, Some(ResponseStatus::HeaderError));
    assert_eq!(
        h.dispatcher.handshake_phase(stream),
        Ok(HandshakePhase::Connected)
    );
}
