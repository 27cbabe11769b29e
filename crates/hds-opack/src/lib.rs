//! # hds-opack
//!
//! ## 角色定位（Why）
//! - 数据流分发器的报文头与控制协议负载均采用 OPACK：一种以单字节标签开头、
//!   对短整数与短字符串做内联编码的紧凑字典格式；
//! - 将编解码独立成 crate，使分发器能直接复用 [`encoded_string_len`] 计算报文头预算，
//!   而不是在调用方重复推导 32 字节短串阈值等魔数。
//!
//! ## 模块划分（What）
//! - [`tag`]：全部标签常量与 [`ItemKind`] 分类；
//! - [`reader`]：零拷贝读取器 [`OpackReader`]，以及按键提取字典元素的 [`read_string_dictionary`]；
//! - [`writer`]：基于 `BytesMut` 的追加式写入器 [`OpackWriter`]，可选容量上限；
//! - [`error`]：统一错误类型 [`OpackError`] 与稳定错误码。
//!
//! ## 使用建议（How）
//! - 解析来自网络的字节时始终通过读取器完成校验（递归深度、UTF-8、NUL 字符）；
//! - 生成出站负载时优先使用写入器的容量上限模式，超限会以 `OutOfResources` 同步失败。
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod reader;
pub mod tag;
pub mod writer;

pub use error::{OpackError, Result, codes};
pub use reader::{Number, OpackReader, read_string_dictionary};
pub use tag::ItemKind;
pub use writer::OpackWriter;

/// 短字符串（内联长度标签）可容纳的最大字节数。
pub const MAX_SHORT_STRING_LEN: usize = 32;

/// 读取器允许的最大嵌套层级。
pub const MAX_RECURSION_DEPTH: usize = 20;

/// 计算长度为 `len` 的字符串经 [`OpackWriter::write_str`] 编码后占用的字节数。
///
/// # 契约说明（What）
/// - 不超过 32 字节：`1 + len`（标签内联长度）；
/// - 超过 32 字节：`1 + len + 1`（`0x6F` 标签加结尾 NUL）。
///
/// # 使用提示（How）
/// - 分发器的报文头长度预算直接依赖本函数，修改编码策略时必须同步更新此处。
#[must_use]
pub const fn encoded_string_len(len: usize) -> usize {
    if len > MAX_SHORT_STRING_LEN {
        1 + len + 1
    } else {
        1 + len
    }
}
