//! OPACK 零拷贝读取器。
//!
//! # 教案定位（Why）
//! - 报文头与控制协议负载都来自不可信的对端，读取器需要在一次遍历中完成结构、
//!   长度、递归深度与字符串合法性的全部校验；
//! - 读取结果尽量借用输入切片（字符串、单片数据、子容器），避免在分发热路径上分配。
//!
//! # 契约说明（What）
//! - 每个 `next_*` 方法要么完整消费一个条目并前移游标，要么返回错误且游标保持原位；
//! - 容器读取返回覆盖其元素的子读取器，不包含结尾终止符；
//! - 嵌套层级上限为 [`MAX_RECURSION_DEPTH`](crate::MAX_RECURSION_DEPTH)。
//!
//! # 实现策略（How）
//! - 所有解析函数都作用在局部副本 `&mut &[u8]` 上，成功后再写回读取器，天然保证失败不前移；
//! - 跳过条目与读取容器共用同一套递归函数，确保“能跳过”与“能读取”的判定完全一致。

use std::borrow::Cow;

use crate::MAX_RECURSION_DEPTH;
use crate::error::{OpackError, Result};
use crate::tag::{self, ItemKind};

/// OPACK 数值：整数或浮点数，保留线上编码的类别。
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// 以 `i64` 精确表示该数值；浮点数必须为整数值且位于 `i64` 范围内。
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(value),
            Self::Float(value) => {
                // 2^63 本身无法用 i64 表示，因此上界取开区间。
                const BOUND: f64 = 9_223_372_036_854_775_808.0;
                if value.is_finite() && value.fract() == 0.0 && (-BOUND..BOUND).contains(&value) {
                    Some(value as i64)
                } else {
                    None
                }
            }
        }
    }

    /// 以 `f64` 精确表示该数值；整数超出 53 位尾数精度时返回 `None`。
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(value),
            Self::Int(value) => {
                let converted = value as f64;
                if converted.is_finite() && Number::Float(converted).as_i64() == Some(value) {
                    Some(converted)
                } else {
                    None
                }
            }
        }
    }
}

/// 基于切片游标的 OPACK 读取器。
#[derive(Clone, Copy, Debug, Default)]
pub struct OpackReader<'a> {
    bytes: &'a [u8],
}

impl<'a> OpackReader<'a> {
    /// 以待解析字节创建读取器。
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// 尚未消费的字节。
    pub fn remaining(&self) -> &'a [u8] {
        self.bytes
    }

    /// 是否已读完全部字节。
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 查看下一个条目的类型而不消费它。
    ///
    /// - 输入耗尽时返回 `Ok(None)`；
    /// - 游标处是终止符或未知标签时返回错误。
    pub fn peek_kind(&self) -> Result<Option<ItemKind>> {
        match self.bytes.first() {
            None => Ok(None),
            Some(&tag) => ItemKind::classify(tag).map(Some),
        }
    }

    pub fn next_bool(&mut self) -> Result<bool> {
        self.advance(|cur| match read_u8(cur, "tag")? {
            tag::TRUE => Ok(true),
            tag::FALSE => Ok(false),
            tag => Err(unexpected(tag, "boolean")),
        })
    }

    pub fn next_null(&mut self) -> Result<()> {
        self.advance(|cur| match read_u8(cur, "tag")? {
            tag::NULL => Ok(()),
            tag => Err(unexpected(tag, "null")),
        })
    }

    /// 读取 UUID，并把线上的逆序字节还原为内存表示。
    pub fn next_uuid(&mut self) -> Result<[u8; 16]> {
        self.advance(|cur| match read_u8(cur, "tag")? {
            tag::UUID => {
                let raw = take(cur, 16, "uuid")?;
                let mut value = [0u8; 16];
                for (slot, byte) in value.iter_mut().zip(raw.iter().rev()) {
                    *slot = *byte;
                }
                Ok(value)
            }
            tag => Err(unexpected(tag, "uuid")),
        })
    }

    pub fn next_date(&mut self) -> Result<f64> {
        self.advance(|cur| match read_u8(cur, "tag")? {
            tag::DATE => Ok(f64::from_bits(read_le::<8>(cur, "date")?)),
            tag => Err(unexpected(tag, "date")),
        })
    }

    pub fn next_number(&mut self) -> Result<Number> {
        self.advance(parse_number)
    }

    /// 读取可精确表示为 `i64` 的数值。
    pub fn next_int(&mut self) -> Result<i64> {
        self.advance(|cur| {
            parse_number(cur)?
                .as_i64()
                .ok_or(OpackError::NotExact { what: "integer" })
        })
    }

    /// 读取可精确表示为 `f64` 的数值。
    pub fn next_float(&mut self) -> Result<f64> {
        self.advance(|cur| {
            parse_number(cur)?
                .as_f64()
                .ok_or(OpackError::NotExact { what: "float" })
        })
    }

    /// 读取字符串，要求 UTF-8 合法且不含 NUL 字符。
    pub fn next_str(&mut self) -> Result<&'a str> {
        self.advance(parse_str)
    }

    /// 读取数据条目；分块数据会被拼接为一份拥有所有权的缓冲。
    pub fn next_data(&mut self) -> Result<Cow<'a, [u8]>> {
        self.advance(parse_data)
    }

    /// 读取数组并返回覆盖其元素的子读取器。
    pub fn next_array(&mut self) -> Result<OpackReader<'a>> {
        self.advance(|cur| parse_container(cur, ContainerKind::Array, MAX_RECURSION_DEPTH))
            .map(OpackReader::new)
    }

    /// 读取字典并返回覆盖其键值对的子读取器（键与值交替出现）。
    pub fn next_dictionary(&mut self) -> Result<OpackReader<'a>> {
        self.advance(|cur| parse_container(cur, ContainerKind::Dictionary, MAX_RECURSION_DEPTH))
            .map(OpackReader::new)
    }

    /// 消费任意一个条目，返回仅覆盖该条目原始字节的读取器。
    pub fn next_item(&mut self) -> Result<OpackReader<'a>> {
        let start = self.bytes;
        self.advance(|cur| skip_item(cur, MAX_RECURSION_DEPTH))?;
        let consumed = start.len() - self.bytes.len();
        Ok(OpackReader::new(&start[..consumed]))
    }

    fn advance<T>(&mut self, parse: impl FnOnce(&mut &'a [u8]) -> Result<T>) -> Result<T> {
        let mut cursor = self.bytes;
        let value = parse(&mut cursor)?;
        self.bytes = cursor;
        Ok(value)
    }
}

/// 读取一个以字符串为键的字典，并按 `keys` 的顺序返回各键对应值的读取器。
///
/// # 契约说明（What）
/// - `bytes` 必须恰好包含一个字典条目，其后出现任何条目都返回 [`OpackError::TrailingItems`]；
/// - 字典键必须是字符串；未被请求的键及其值会被校验后跳过；
/// - 被请求的键重复出现时返回 [`OpackError::DuplicateKey`]；
/// - 缺失的键对应 `None`，由调用方决定是否必需。
pub fn read_string_dictionary<'a>(
    bytes: &'a [u8],
    keys: &[&str],
) -> Result<Vec<Option<OpackReader<'a>>>> {
    let mut reader = OpackReader::new(bytes);
    let mut entries = reader.next_dictionary()?;
    let mut values: Vec<Option<OpackReader<'a>>> = vec![None; keys.len()];

    while entries.peek_kind()?.is_some() {
        let key = entries.next_str()?;
        let value = entries.next_item()?;
        if let Some(index) = keys.iter().position(|candidate| *candidate == key) {
            if values[index].is_some() {
                return Err(OpackError::DuplicateKey {
                    key: key.to_owned(),
                });
            }
            values[index] = Some(value);
        }
    }

    if reader.peek_kind()?.is_some() {
        return Err(OpackError::TrailingItems);
    }
    Ok(values)
}

#[derive(Clone, Copy)]
enum ContainerKind {
    Array,
    Dictionary,
}

fn unexpected(tag: u8, expected: &'static str) -> OpackError {
    OpackError::UnexpectedTag { tag, expected }
}

fn take<'a>(cur: &mut &'a [u8], len: usize, what: &'static str) -> Result<&'a [u8]> {
    if cur.len() < len {
        return Err(OpackError::Truncated { what });
    }
    let (head, tail) = cur.split_at(len);
    *cur = tail;
    Ok(head)
}

fn read_u8(cur: &mut &[u8], what: &'static str) -> Result<u8> {
    Ok(take(cur, 1, what)?[0])
}

fn read_le<const N: usize>(cur: &mut &[u8], what: &'static str) -> Result<u64> {
    let raw = take(cur, N, what)?;
    let mut buf = [0u8; 8];
    buf[..N].copy_from_slice(raw);
    Ok(u64::from_le_bytes(buf))
}

fn read_length(cur: &mut &[u8], width_tag: u8, base: u8) -> Result<usize> {
    let raw = match width_tag - base {
        0 => read_le::<1>(cur, "length")?,
        1 => read_le::<2>(cur, "length")?,
        2 => read_le::<4>(cur, "length")?,
        _ => read_le::<8>(cur, "length")?,
    };
    usize::try_from(raw).map_err(|_| OpackError::Truncated { what: "value" })
}

fn parse_number(cur: &mut &[u8]) -> Result<Number> {
    let tag = read_u8(cur, "tag")?;
    let number = match tag {
        tag::NEGATIVE_ONE => Number::Int(-1),
        tag::INT_0..=tag::INT_39 => Number::Int(i64::from(tag - tag::INT_0)),
        tag::INT8 => Number::Int(i64::from(read_le::<1>(cur, "int8")? as u8 as i8)),
        tag::INT16 => Number::Int(i64::from(read_le::<2>(cur, "int16")? as u16 as i16)),
        tag::INT32 => Number::Int(i64::from(read_le::<4>(cur, "int32")? as u32 as i32)),
        tag::INT64 => Number::Int(read_le::<8>(cur, "int64")? as i64),
        tag::FLOAT32 => Number::Float(f64::from(f32::from_bits(
            read_le::<4>(cur, "float32")? as u32,
        ))),
        tag::FLOAT64 => Number::Float(f64::from_bits(read_le::<8>(cur, "float64")?)),
        other => return Err(unexpected(other, "number")),
    };
    Ok(number)
}

fn parse_str<'a>(cur: &mut &'a [u8]) -> Result<&'a str> {
    let tag = read_u8(cur, "tag")?;
    let raw = match tag {
        tag::STRING_0..=tag::STRING_32 => take(cur, usize::from(tag - tag::STRING_0), "string")?,
        tag::STRING_U8..=tag::STRING_U64 => {
            let len = read_length(cur, tag, tag::STRING_U8)?;
            take(cur, len, "string")?
        }
        tag::STRING_NUL => {
            let end = cur
                .iter()
                .position(|byte| *byte == 0)
                .ok_or(OpackError::Truncated { what: "string" })?;
            let raw = take(cur, end, "string")?;
            take(cur, 1, "string terminator")?;
            raw
        }
        other => return Err(unexpected(other, "string")),
    };
    if raw.contains(&0) {
        return Err(OpackError::InvalidString {
            reason: "contains NUL character",
        });
    }
    std::str::from_utf8(raw).map_err(|_| OpackError::InvalidString {
        reason: "not valid UTF-8",
    })
}

fn parse_data<'a>(cur: &mut &'a [u8]) -> Result<Cow<'a, [u8]>> {
    let mut value: Cow<'a, [u8]> = Cow::Borrowed(&[]);
    let mut open_chunks = 0usize;
    loop {
        let tag = read_u8(cur, "tag")?;
        match tag {
            tag::DATA_0..=tag::DATA_U64 => {
                let len = if tag <= tag::DATA_32 {
                    usize::from(tag - tag::DATA_0)
                } else {
                    read_length(cur, tag, tag::DATA_U8)?
                };
                let fragment = take(cur, len, "data")?;
                if value.is_empty() {
                    value = Cow::Borrowed(fragment);
                } else {
                    value.to_mut().extend_from_slice(fragment);
                }
            }
            tag::DATA_CHUNKED => open_chunks += 1,
            tag::TERMINATOR if open_chunks > 0 => open_chunks -= 1,
            other => return Err(unexpected(other, "data")),
        }
        if open_chunks == 0 {
            return Ok(value);
        }
    }
}

/// 解析容器并返回元素区间。`depth` 为剩余可用的嵌套层数。
fn parse_container<'a>(cur: &mut &'a [u8], kind: ContainerKind, depth: usize) -> Result<&'a [u8]> {
    if depth == 0 {
        return Err(OpackError::RecursionLimit);
    }
    let tag = read_u8(cur, "tag")?;
    let (fixed, open, expected, items_per_entry) = match kind {
        ContainerKind::Array => (tag::ARRAY_0..=tag::ARRAY_14, tag::ARRAY, "array", 1),
        ContainerKind::Dictionary => (
            tag::DICTIONARY_0..=tag::DICTIONARY_14,
            tag::DICTIONARY,
            "dictionary",
            2,
        ),
    };
    let limit = if fixed.contains(&tag) {
        Some(usize::from(tag - fixed.start()))
    } else if tag == open {
        None
    } else {
        return Err(unexpected(tag, expected));
    };

    let start = *cur;
    let mut entries = 0usize;
    let mut end = 0usize;
    while limit.is_none_or(|limit| entries < limit) {
        match cur.first() {
            None => return Err(OpackError::Truncated { what: "container item" }),
            Some(&tag::TERMINATOR) => {
                *cur = &cur[1..];
                return Ok(&start[..end]);
            }
            Some(_) => {
                for _ in 0..items_per_entry {
                    skip_item(cur, depth - 1)?;
                }
                entries += 1;
                end = start.len() - cur.len();
            }
        }
    }
    Ok(&start[..end])
}

fn skip_item(cur: &mut &[u8], depth: usize) -> Result<()> {
    if depth == 0 {
        return Err(OpackError::RecursionLimit);
    }
    let tag = *cur.first().ok_or(OpackError::Truncated { what: "item" })?;
    match ItemKind::classify(tag)? {
        ItemKind::Bool | ItemKind::Null => {
            take(cur, 1, "tag")?;
        }
        ItemKind::Uuid => {
            take(cur, 17, "uuid")?;
        }
        ItemKind::Date => {
            take(cur, 9, "date")?;
        }
        ItemKind::Number => {
            parse_number(cur)?;
        }
        ItemKind::String => {
            parse_str(cur)?;
        }
        ItemKind::Data => {
            parse_data(cur)?;
        }
        ItemKind::Array => {
            parse_container(cur, ContainerKind::Array, depth)?;
        }
        ItemKind::Dictionary => {
            parse_container(cur, ContainerKind::Dictionary, depth)?;
        }
    }
    Ok(())
}
