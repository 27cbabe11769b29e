//! OPACK 标签常量与条目分类。
//!
//! 所有多字节数值均为小端序。区间型标签（短整数、短字符串、短数据、定长容器）
//! 只给出区间起点，调用方通过偏移量换算长度或数值。

use crate::error::{OpackError, Result};

pub const TRUE: u8 = 0x01;
pub const FALSE: u8 = 0x02;
/// 结束不定长容器（以及分块数据）的终止符。
pub const TERMINATOR: u8 = 0x03;
pub const NULL: u8 = 0x04;
/// 16 字节 UUID，线上字节序与内存表示相反。
pub const UUID: u8 = 0x05;
/// 以 f64 编码的日期。
pub const DATE: u8 = 0x06;
pub const NEGATIVE_ONE: u8 = 0x07;
/// 内联整数 0 的标签，0..=39 依次递增。
pub const INT_0: u8 = 0x08;
pub const INT_39: u8 = 0x2F;
pub const INT8: u8 = 0x30;
pub const INT16: u8 = 0x31;
pub const INT32: u8 = 0x32;
pub const INT64: u8 = 0x33;
pub const FLOAT32: u8 = 0x35;
pub const FLOAT64: u8 = 0x36;
/// 长度为 0 的短字符串，0..=32 依次递增。
pub const STRING_0: u8 = 0x40;
pub const STRING_32: u8 = 0x60;
pub const STRING_U8: u8 = 0x61;
pub const STRING_U16: u8 = 0x62;
pub const STRING_U32: u8 = 0x63;
pub const STRING_U64: u8 = 0x64;
/// 以 NUL 结尾的字符串。
pub const STRING_NUL: u8 = 0x6F;
/// 长度为 0 的短数据，0..=32 依次递增。
pub const DATA_0: u8 = 0x70;
pub const DATA_32: u8 = 0x90;
pub const DATA_U8: u8 = 0x91;
pub const DATA_U16: u8 = 0x92;
pub const DATA_U32: u8 = 0x93;
pub const DATA_U64: u8 = 0x94;
/// 分块数据，由若干数据片段加终止符组成。
pub const DATA_CHUNKED: u8 = 0x9F;
/// 含 0 个元素的定长数组，0..=14 依次递增。
pub const ARRAY_0: u8 = 0xD0;
pub const ARRAY_14: u8 = 0xDE;
pub const ARRAY: u8 = 0xDF;
/// 含 0 个键值对的定长字典，0..=14 依次递增。
pub const DICTIONARY_0: u8 = 0xE0;
pub const DICTIONARY_14: u8 = 0xEE;
pub const DICTIONARY: u8 = 0xEF;

/// 条目类型。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ItemKind {
    Bool,
    Null,
    Uuid,
    Date,
    Number,
    String,
    Data,
    Array,
    Dictionary,
}

impl ItemKind {
    /// 将首字节归类为条目类型。
    ///
    /// 终止符不属于任何条目，会返回 [`OpackError::UnexpectedTag`]。
    pub fn classify(tag: u8) -> Result<Self> {
        match tag {
            TRUE | FALSE => Ok(Self::Bool),
            TERMINATOR => Err(OpackError::UnexpectedTag {
                tag,
                expected: "item",
            }),
            NULL => Ok(Self::Null),
            UUID => Ok(Self::Uuid),
            DATE => Ok(Self::Date),
            NEGATIVE_ONE..=INT_39 | INT8..=INT64 | FLOAT32 | FLOAT64 => Ok(Self::Number),
            STRING_0..=STRING_U64 | STRING_NUL => Ok(Self::String),
            DATA_0..=DATA_U64 | DATA_CHUNKED => Ok(Self::Data),
            ARRAY_0..=ARRAY => Ok(Self::Array),
            DICTIONARY_0..=DICTIONARY => Ok(Self::Dictionary),
            _ => Err(OpackError::UnknownTag { tag }),
        }
    }
}
