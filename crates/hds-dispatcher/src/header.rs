//! # header 模块说明
//!
//! ## 角色定位（Why）
//! - 负责数据流消息的分帧：每条消息以 1 字节 `HeaderLen` 开头，随后是 OPACK 字典形式的报文头，
//!   最后是负载；
//! - 报文头长度受 1 字节限制（≤255），因此协议名与主题的长度必须在创建事务之前校验。
//!
//! ## 线上格式（What）
//! ```text
//! HeaderLen (1 byte)
//! dictionary {
//!   "status"   -> int          (仅响应)
//!   "id"       -> int64        (请求与响应)
//!   "event" | "request" | "response" -> topic
//!   "protocol" -> protocol name
//! }
//! payload
//! ```
//! - 编码器按上面的顺序写出计数字典（`E2`/`E3`/`E4`），`id` 固定使用 8 字节整数编码；
//! - 解码器是通用的：接受任意键序、任意合法的 OPACK 编码，只认识六个键，其余键被跳过。
//!
//! ## 长度预算（How）
//! - 记 `e(x) = encoded_string_len(len(x))`，报文头长度（不含 `HeaderLen` 字节）为：
//!   事件 `16 + e(name) + e(topic)`，请求 `30 + …`，响应 `39 + …`；
//! - 请求必须保证对端能够回复，因此请求与响应都按响应报文头预算校验，
//!   即 `len(name) + len(topic) <= 255 - 41 - longs`，`longs` 为超过 32 字节的字符串个数。

use bytes::{BufMut, BytesMut};
use hds_opack::{encoded_string_len, read_string_dictionary, tag};
use tracing::debug;

use crate::error::{DispatchError, Result};
use crate::status::ResponseStatus;

/// 报文头允许的最大长度（不含 `HeaderLen` 字节本身）。
pub const MAX_HEADER_LEN: usize = u8::MAX as usize;

const KEY_STATUS: &str = "status";
const KEY_ID: &str = "id";
const KEY_PROTOCOL: &str = "protocol";

/// 消息种类。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MessageKind {
    Event,
    Request,
    Response,
}

impl MessageKind {
    /// 报文头中承载主题的键名。
    pub const fn key(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Request => "request",
            Self::Response => "response",
        }
    }

    /// 除协议名与主题外的固定开销。
    const fn fixed_overhead(self) -> usize {
        match self {
            Self::Event => 16,
            Self::Request => 30,
            Self::Response => 39,
        }
    }
}

/// 计算报文头长度（不含 `HeaderLen` 字节）。
pub fn header_len(kind: MessageKind, protocol: &str, topic: &str) -> usize {
    kind.fixed_overhead() + encoded_string_len(protocol.len()) + encoded_string_len(topic.len())
}

/// 校验协议名与主题能否组成该种类的合法报文头。
///
/// 请求按响应报文头预算校验：对端回复时会带上 `status` 字段，报文头比请求更长。
pub fn check_budget(kind: MessageKind, protocol: &str, topic: &str) -> Result<()> {
    let budget_kind = match kind {
        MessageKind::Event => MessageKind::Event,
        MessageKind::Request | MessageKind::Response => MessageKind::Response,
    };
    if header_len(budget_kind, protocol, topic) > MAX_HEADER_LEN {
        return Err(DispatchError::HeaderBudgetExceeded {
            protocol: protocol.to_owned(),
            topic: topic.to_owned(),
            kind,
        });
    }
    Ok(())
}

/// 解码或待编码的报文头。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageHeader<'a> {
    pub protocol: &'a str,
    pub kind: MessageKind,
    pub topic: &'a str,
    /// 请求与响应必有，事件恒为 `None`。
    pub id: Option<i64>,
    /// 仅响应携带。
    pub status: Option<ResponseStatus>,
}

impl<'a> MessageHeader<'a> {
    pub fn event(protocol: &'a str, topic: &'a str) -> Self {
        Self {
            protocol,
            kind: MessageKind::Event,
            topic,
            id: None,
            status: None,
        }
    }

    pub fn request(protocol: &'a str, topic: &'a str, id: i64) -> Self {
        Self {
            protocol,
            kind: MessageKind::Request,
            topic,
            id: Some(id),
            status: None,
        }
    }

    pub fn response(protocol: &'a str, topic: &'a str, id: i64, status: ResponseStatus) -> Self {
        Self {
            protocol,
            kind: MessageKind::Response,
            topic,
            id: Some(id),
            status: Some(status),
        }
    }

    /// 报文头长度（不含 `HeaderLen` 字节）。
    pub fn len(&self) -> usize {
        header_len(self.kind, self.protocol, self.topic)
    }

    /// 报文头永远不为空，提供该方法只为配合 `len`。
    pub fn is_empty(&self) -> bool {
        false
    }

    /// 把 `HeaderLen` 字节与报文头追加到 `out`。
    ///
    /// # 契约说明（What）
    /// - 协议名与主题超出预算时返回 [`DispatchError::HeaderBudgetExceeded`]，`out` 不变；
    /// - 协议名或主题包含 NUL 时返回 [`DispatchError::InvalidData`]；
    /// - 写入字节数恰为 `1 + self.len()`。
    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        check_budget(self.kind, self.protocol, self.topic)?;
        if self.protocol.contains('\0') || self.topic.contains('\0') {
            return Err(DispatchError::invalid_data("header strings must not contain NUL"));
        }
        let (id, status) = match self.kind {
            MessageKind::Event => (None, None),
            MessageKind::Request => (
                Some(self.id.ok_or(DispatchError::invalid_state("request header without id"))?),
                None,
            ),
            MessageKind::Response => (
                Some(self.id.ok_or(DispatchError::invalid_state("response header without id"))?),
                Some(
                    self.status
                        .ok_or(DispatchError::invalid_state("response header without status"))?,
                ),
            ),
        };
        let len = self.len();
        out.reserve(1 + len);
        out.put_u8(len as u8);
        let pairs = 2 + u8::from(id.is_some()) + u8::from(status.is_some());
        out.put_u8(tag::DICTIONARY_0 + pairs);
        if let Some(status) = status {
            put_str(out, KEY_STATUS);
            out.put_u8(tag::INT_0 + status.code());
        }
        if let Some(id) = id {
            put_str(out, KEY_ID);
            out.put_u8(tag::INT64);
            out.put_i64_le(id);
        }
        put_str(out, self.kind.key());
        put_str(out, self.topic);
        put_str(out, KEY_PROTOCOL);
        put_str(out, self.protocol);
        Ok(())
    }

    /// 解码报文头字典（不含 `HeaderLen` 字节）。
    ///
    /// # 契约说明（What）
    /// - 必须恰好出现 `event`/`request`/`response` 之一，且 `protocol` 必须存在；
    /// - 请求必须携带 `id`；响应必须携带 `id` 与取值 0..=6 的 `status`；
    /// - 事件中的 `id`/`status` 以及请求中的 `status` 被忽略；
    /// - 任何不满足上述条件的输入都返回 [`DispatchError::InvalidData`]。
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let keys = [
            KEY_PROTOCOL,
            MessageKind::Event.key(),
            MessageKind::Request.key(),
            MessageKind::Response.key(),
            KEY_ID,
            KEY_STATUS,
        ];
        let values = read_string_dictionary(bytes, &keys)?;
        let [protocol, event, request, response, id, status] = values[..] else {
            return Err(DispatchError::invalid_data("header dictionary shape"));
        };

        let protocol = match protocol {
            Some(mut reader) => reader.next_str()?,
            None => return Err(DispatchError::invalid_data("header without protocol")),
        };

        let (kind, mut topic_reader) = match (event, request, response) {
            (Some(topic), None, None) => (MessageKind::Event, topic),
            (None, Some(topic), None) => (MessageKind::Request, topic),
            (None, None, Some(topic)) => (MessageKind::Response, topic),
            _ => {
                return Err(DispatchError::invalid_data(
                    "header must name exactly one of event, request, response",
                ));
            }
        };
        let topic = topic_reader.next_str()?;

        let header = match kind {
            MessageKind::Event => {
                if id.is_some() || status.is_some() {
                    debug!(
                        target: "hds_dispatcher::header",
                        protocol,
                        topic,
                        "ignoring id/status in event header"
                    );
                }
                Self::event(protocol, topic)
            }
            MessageKind::Request => {
                let Some(mut id) = id else {
                    return Err(DispatchError::invalid_data("request header without id"));
                };
                if status.is_some() {
                    debug!(
                        target: "hds_dispatcher::header",
                        protocol,
                        topic,
                        "ignoring status in request header"
                    );
                }
                Self::request(protocol, topic, id.next_int()?)
            }
            MessageKind::Response => {
                let (Some(mut id), Some(mut status)) = (id, status) else {
                    return Err(DispatchError::invalid_data(
                        "response header without id or status",
                    ));
                };
                let id = id.next_int()?;
                let status = ResponseStatus::try_from(status.next_int()?)
                    .map_err(|_| DispatchError::invalid_data("unknown response status"))?;
                Self::response(protocol, topic, id, status)
            }
        };
        Ok(header)
    }
}

/// 按 OPACK 字符串编码写入，长度与 [`encoded_string_len`] 一致。
fn put_str(out: &mut BytesMut, value: &str) {
    let len = value.len();
    if len <= hds_opack::MAX_SHORT_STRING_LEN {
        out.put_u8(tag::STRING_0 + len as u8);
        out.put_slice(value.as_bytes());
    } else {
        out.put_u8(tag::STRING_NUL);
        out.put_slice(value.as_bytes());
        out.put_u8(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(header: &MessageHeader<'_>) -> BytesMut {
        let mut out = BytesMut::new();
        header.encode(&mut out).expect("预算内的报文头");
        out
    }

    #[test]
    fn event_header_layout_matches_wire_format() {
        let out = encoded(&MessageHeader::event("dataSend", "open"));
        let mut expected = vec![0u8, 0xE2, 0x45];
        expected.extend_from_slice(b"event");
        expected.push(0x44);
        expected.extend_from_slice(b"open");
        expected.push(0x48);
        expected.extend_from_slice(b"protocol");
        expected.push(0x48);
        expected.extend_from_slice(b"dataSend");
        expected[0] = (expected.len() - 1) as u8;
        assert_eq!(&out[..], &expected[..]);
        assert_eq!(usize::from(out[0]), 16 + 5 + 9);
    }

    #[test]
    fn response_header_carries_status_and_eight_byte_id() {
        let header = MessageHeader::response("control", "hello", 42, ResponseStatus::Success);
        let out = encoded(&header);
        assert_eq!(out.len(), 1 + header.len());
        assert_eq!(&out[1..3], &[0xE4, 0x46]);
        assert_eq!(&out[3..9], b"status");
        assert_eq!(out[9], 0x08);
        assert_eq!(&out[10..13], &[0x42, b'i', b'd']);
        assert_eq!(out[13], 0x33);
        assert_eq!(&out[14..22], &42i64.to_le_bytes());
        assert_eq!(MessageHeader::decode(&out[1..]).expect("可解码"), header);
    }

    #[test]
    fn long_strings_take_one_extra_byte() {
        let long = "t".repeat(33);
        assert_eq!(header_len(MessageKind::Event, "p", &long), 16 + 2 + 35);
        let header = MessageHeader::request("p", &long, -5);
        let out = encoded(&header);
        assert_eq!(MessageHeader::decode(&out[1..]).expect("可解码"), header);
    }

    #[test]
    fn request_budget_uses_response_overhead() {
        let name = "n".repeat(100);
        let fits = "t".repeat(255 - 41 - 2 - 100);
        let overflows = "t".repeat(255 - 41 - 2 - 100 + 1);
        check_budget(MessageKind::Request, &name, &fits).expect("恰好在预算内");
        assert!(matches!(
            check_budget(MessageKind::Request, &name, &overflows),
            Err(DispatchError::HeaderBudgetExceeded {
                kind: MessageKind::Request,
                ..
            })
        ));
        check_budget(MessageKind::Event, &name, &overflows).expect("事件报文头更短");
    }

    #[test]
    fn decoding_accepts_any_key_order_and_ignores_unknown_keys() {
        let mut writer = hds_opack::OpackWriter::new();
        writer.begin_dictionary().expect("字典");
        writer.write_str("extra").expect("键");
        writer.write_bool(true).expect("值");
        writer.write_str("protocol").expect("键");
        writer.write_str("dataSend").expect("值");
        writer.write_str("id").expect("键");
        writer.write_int(7).expect("值");
        writer.write_str("request").expect("键");
        writer.write_str("open").expect("值");
        writer.write_terminator().expect("关闭");
        let bytes = writer.freeze();
        assert_eq!(
            MessageHeader::decode(&bytes).expect("通用解码"),
            MessageHeader::request("dataSend", "open", 7)
        );
    }

    #[test]
    fn malformed_headers_are_invalid_data() {
        let cases: [&[u8]; 5] = [
            // 缺少 protocol。
            &[0xE1, 0x45, b'e', b'v', b'e', b'n', b't', 0x41, b'x'],
            // 同时出现 event 与 request。
            &[
                0xE3, 0x48, b'p', b'r', b'o', b't', b'o', b'c', b'o', b'l', 0x41, b'p', 0x45,
                b'e', b'v', b'e', b'n', b't', 0x41, b'x', 0x47, b'r', b'e', b'q', b'u', b'e',
                b's', b't', 0x41, b'x',
            ],
            // 请求缺少 id。
            &[
                0xE2, 0x48, b'p', b'r', b'o', b't', b'o', b'c', b'o', b'l', 0x41, b'p', 0x47,
                b'r', b'e', b'q', b'u', b'e', b's', b't', 0x41, b'x',
            ],
            // 不是字典。
            &[0x08],
            // 截断。
            &[0xE2, 0x48, b'p', b'r'],
        ];
        for case in cases {
            assert!(
                matches!(
                    MessageHeader::decode(case),
                    Err(DispatchError::InvalidData { .. })
                ),
                "{case:02X?}"
            );
        }
    }

    #[test]
    fn response_status_outside_defined_codes_is_rejected() {
        let mut writer = hds_opack::OpackWriter::new();
        writer.begin_dictionary().expect("字典");
        for (key, value) in [("protocol", "p"), ("response", "t")] {
            writer.write_str(key).expect("键");
            writer.write_str(value).expect("值");
        }
        writer.write_str("id").expect("键");
        writer.write_int(1).expect("值");
        writer.write_str("status").expect("键");
        writer.write_int(7).expect("值");
        writer.write_terminator().expect("关闭");
        let bytes = writer.freeze();
        assert!(matches!(
            MessageHeader::decode(&bytes),
            Err(DispatchError::InvalidData { .. })
        ));
    }
}
