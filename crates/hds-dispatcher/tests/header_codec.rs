//! 报文头编解码与长度预算的性质测试。

use bytes::BytesMut;
use hds_dispatcher::ResponseStatus;
use hds_dispatcher::header::{MAX_HEADER_LEN, MessageHeader, MessageKind, check_budget, header_len};
use proptest::prelude::*;
use tracing_subscriber::EnvFilter;

/// 以 `RUST_LOG` 控制的输出安装到测试捕获器；重复安装时静默忽略。
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn any_status() -> impl Strategy<Value = ResponseStatus> {
    (0i64..=6).prop_map(|code| ResponseStatus::try_from(code).expect("合法状态码"))
}

fn any_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Event),
        Just(MessageKind::Request),
        Just(MessageKind::Response),
    ]
}

fn build<'a>(
    kind: MessageKind,
    protocol: &'a str,
    topic: &'a str,
    id: i64,
    status: ResponseStatus,
) -> MessageHeader<'a> {
    match kind {
        MessageKind::Event => MessageHeader::event(protocol, topic),
        MessageKind::Request => MessageHeader::request(protocol, topic, id),
        MessageKind::Response => MessageHeader::response(protocol, topic, id, status),
    }
}

/// 字符串超过 32 字节时编码多出一个终止字节。
fn longs(protocol: &str, topic: &str) -> usize {
    [protocol, topic].iter().filter(|s| s.len() > 32).count()
}

proptest! {
    #[test]
    fn encoded_headers_decode_to_the_same_fields(
        kind in any_kind(),
        protocol in "[a-zA-Z][a-zA-Z0-9]{0,60}",
        topic in "[a-zA-Z0-9._-]{0,140}",
        id in any::<i64>(),
        status in any_status(),
    ) {
        init_tracing();
        let header = build(kind, &protocol, &topic, id, status);
        let mut out = BytesMut::new();
        let encoded = header.encode(&mut out);
        prop_assert_eq!(encoded.is_ok(), check_budget(kind, &protocol, &topic).is_ok());
        if encoded.is_err() {
            prop_assert!(out.is_empty(), "超出预算时不写入任何字节");
            return Ok(());
        }
        prop_assert_eq!(out.len(), 1 + header.len());
        prop_assert_eq!(usize::from(out[0]), header.len());
        prop_assert!(header.len() <= MAX_HEADER_LEN);
        let decoded = MessageHeader::decode(&out[1..]).expect("可解码");
        prop_assert_eq!(decoded, header);
    }

    #[test]
    fn request_and_response_share_one_budget(
        protocol in "[a-z]{1,120}",
        topic in "[a-z]{0,160}",
    ) {
        let request = check_budget(MessageKind::Request, &protocol, &topic).is_ok();
        let response = check_budget(MessageKind::Response, &protocol, &topic).is_ok();
        prop_assert_eq!(request, response);

        let limit = MAX_HEADER_LEN - 41 - longs(&protocol, &topic);
        prop_assert_eq!(request, protocol.len() + topic.len() <= limit);
        prop_assert_eq!(
            response,
            header_len(MessageKind::Response, &protocol, &topic) <= MAX_HEADER_LEN
        );
    }

    #[test]
    fn event_budget_is_never_stricter_than_response_budget(
        protocol in "[a-z]{1,120}",
        topic in "[a-z]{0,160}",
    ) {
        if check_budget(MessageKind::Response, &protocol, &topic).is_ok() {
            prop_assert!(check_budget(MessageKind::Event, &protocol, &topic).is_ok());
        }
        prop_assert_eq!(
            header_len(MessageKind::Response, &protocol, &topic)
                - header_len(MessageKind::Event, &protocol, &topic),
            23
        );
    }
}
