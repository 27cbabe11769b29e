//! OPACK 追加式写入器。
//!
//! 写入器始终选择最短编码：整数按 `-1`、`0..=39` 内联，其余依次尝试 8/16/32/64 位；
//! 浮点数统一写成 f64；字符串不超过 32 字节时内联长度，否则以 NUL 结尾；
//! 数据选择最短的长度前缀。容器一律以不定长形式开启，由 [`OpackWriter::write_terminator`] 关闭。

use bytes::{BufMut, Bytes, BytesMut};

use crate::MAX_SHORT_STRING_LEN;
use crate::error::{OpackError, Result};
use crate::tag;

/// 基于 [`BytesMut`] 的 OPACK 写入器。
///
/// # 教案式说明
/// - **意图 (Why)**：分发器在构造状态回复、控制协议响应时需要一个小而确定的序列化工具；
/// - **契约 (What)**：设置容量上限后，任何一次写入若会超出上限，都返回
///   [`OpackError::OutOfResources`] 且不写入任何字节；
/// - **风险 (Trade-offs)**：容器不记录开闭配对，终止符的平衡由调用方保证。
#[derive(Debug, Default)]
pub struct OpackWriter {
    buf: BytesMut,
    limit: Option<usize>,
}

impl OpackWriter {
    /// 创建不限容量的写入器。
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建最多写入 `limit` 字节的写入器。
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit),
            limit: Some(limit),
        }
    }

    /// 已写入的字节。
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 取出写入结果。
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// 取出可变缓冲。
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.reserve(1)?;
        self.buf.put_u8(if value { tag::TRUE } else { tag::FALSE });
        Ok(())
    }

    pub fn write_null(&mut self) -> Result<()> {
        self.reserve(1)?;
        self.buf.put_u8(tag::NULL);
        Ok(())
    }

    /// 写入 UUID，线上按逆序字节排列。
    pub fn write_uuid(&mut self, value: &[u8; 16]) -> Result<()> {
        self.reserve(17)?;
        self.buf.put_u8(tag::UUID);
        for byte in value.iter().rev() {
            self.buf.put_u8(*byte);
        }
        Ok(())
    }

    pub fn write_date(&mut self, value: f64) -> Result<()> {
        self.reserve(9)?;
        self.buf.put_u8(tag::DATE);
        self.buf.put_f64_le(value);
        Ok(())
    }

    /// 以最短编码写入整数。
    pub fn write_int(&mut self, value: i64) -> Result<()> {
        match value {
            -1 => {
                self.reserve(1)?;
                self.buf.put_u8(tag::NEGATIVE_ONE);
            }
            0..=39 => {
                self.reserve(1)?;
                self.buf.put_u8(tag::INT_0 + value as u8);
            }
            _ if i8::try_from(value).is_ok() => {
                self.reserve(2)?;
                self.buf.put_u8(tag::INT8);
                self.buf.put_i8(value as i8);
            }
            _ if i16::try_from(value).is_ok() => {
                self.reserve(3)?;
                self.buf.put_u8(tag::INT16);
                self.buf.put_i16_le(value as i16);
            }
            _ if i32::try_from(value).is_ok() => {
                self.reserve(5)?;
                self.buf.put_u8(tag::INT32);
                self.buf.put_i32_le(value as i32);
            }
            _ => {
                self.reserve(9)?;
                self.buf.put_u8(tag::INT64);
                self.buf.put_i64_le(value);
            }
        }
        Ok(())
    }

    /// 写入 f64 浮点数。
    pub fn write_float(&mut self, value: f64) -> Result<()> {
        self.reserve(9)?;
        self.buf.put_u8(tag::FLOAT64);
        self.buf.put_f64_le(value);
        Ok(())
    }

    /// 写入字符串；编码长度与 [`encoded_string_len`](crate::encoded_string_len) 一致。
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        if value.as_bytes().contains(&0) {
            return Err(OpackError::InvalidString {
                reason: "contains NUL character",
            });
        }
        let len = value.len();
        self.reserve(crate::encoded_string_len(len))?;
        if len <= MAX_SHORT_STRING_LEN {
            self.buf.put_u8(tag::STRING_0 + len as u8);
            self.buf.put_slice(value.as_bytes());
        } else {
            self.buf.put_u8(tag::STRING_NUL);
            self.buf.put_slice(value.as_bytes());
            self.buf.put_u8(0);
        }
        Ok(())
    }

    /// 以最短长度前缀写入数据。
    pub fn write_data(&mut self, value: &[u8]) -> Result<()> {
        let len = value.len();
        let prefix = match len {
            0..=32 => 0,
            _ if u8::try_from(len).is_ok() => 1,
            _ if u16::try_from(len).is_ok() => 2,
            _ if u32::try_from(len).is_ok() => 4,
            _ => 8,
        };
        self.reserve(1 + prefix + len)?;
        match prefix {
            0 => self.buf.put_u8(tag::DATA_0 + len as u8),
            1 => {
                self.buf.put_u8(tag::DATA_U8);
                self.buf.put_u8(len as u8);
            }
            2 => {
                self.buf.put_u8(tag::DATA_U16);
                self.buf.put_u16_le(len as u16);
            }
            4 => {
                self.buf.put_u8(tag::DATA_U32);
                self.buf.put_u32_le(len as u32);
            }
            _ => {
                self.buf.put_u8(tag::DATA_U64);
                self.buf.put_u64_le(len as u64);
            }
        }
        self.buf.put_slice(value);
        Ok(())
    }

    /// 开启不定长数组。
    pub fn begin_array(&mut self) -> Result<()> {
        self.reserve(1)?;
        self.buf.put_u8(tag::ARRAY);
        Ok(())
    }

    /// 开启不定长字典。
    pub fn begin_dictionary(&mut self) -> Result<()> {
        self.reserve(1)?;
        self.buf.put_u8(tag::DICTIONARY);
        Ok(())
    }

    /// 写入终止符，关闭最近开启的容器。
    pub fn write_terminator(&mut self) -> Result<()> {
        self.reserve(1)?;
        self.buf.put_u8(tag::TERMINATOR);
        Ok(())
    }

    fn reserve(&mut self, needed: usize) -> Result<()> {
        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(self.buf.len());
            if needed > available {
                return Err(OpackError::OutOfResources { needed, available });
            }
        }
        self.buf.reserve(needed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_use_the_smallest_encoding() {
        let mut writer = OpackWriter::new();
        for value in [-1, 0, 39, 40, -2, 200, 70_000, i64::MIN] {
            writer.write_int(value).expect("无容量上限");
        }
        assert_eq!(
            writer.as_bytes(),
            &[
                0x07, 0x08, 0x2F, 0x30, 40, 0x30, 0xFE, 0x31, 200, 0, 0x32, 0x70, 0x11, 0x01, 0x00,
                0x33, 0, 0, 0, 0, 0, 0, 0, 0x80,
            ]
        );
    }

    #[test]
    fn long_strings_are_nul_terminated() {
        let long = "x".repeat(33);
        let mut writer = OpackWriter::new();
        writer.write_str(&long).expect("长字符串");
        assert_eq!(writer.len(), crate::encoded_string_len(33));
        assert_eq!(writer.as_bytes()[0], tag::STRING_NUL);
        assert_eq!(writer.as_bytes().last(), Some(&0));
    }

    #[test]
    fn limit_rejects_without_partial_write() {
        let mut writer = OpackWriter::with_limit(4);
        writer.write_int(1).expect("一字节");
        assert_eq!(
            writer.write_str("abcd").expect_err("需要 5 字节"),
            OpackError::OutOfResources {
                needed: 5,
                available: 3
            }
        );
        assert_eq!(writer.len(), 1);
    }
}
