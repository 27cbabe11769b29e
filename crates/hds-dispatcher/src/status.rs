//! 响应报文头中的 `status` 字段。

use core::fmt;

/// 响应状态码。
///
/// 线上以单字节整数编码；7..=38 保留未用，报文头预算把取值上限限制在 39 以内，
/// 因此编码始终落在 OPACK 的内联整数区间（`0x08 + status`）。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0,
    OutOfMemory = 1,
    Timeout = 2,
    HeaderError = 3,
    PayloadError = 4,
    MissingProtocol = 5,
    ProtocolSpecificError = 6,
}

impl ResponseStatus {
    /// 线上数值。
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl TryFrom<i64> for ResponseStatus {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Success,
            1 => Self::OutOfMemory,
            2 => Self::Timeout,
            3 => Self::HeaderError,
            4 => Self::PayloadError,
            5 => Self::MissingProtocol,
            6 => Self::ProtocolSpecificError,
            other => return Err(other),
        })
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::OutOfMemory => "out-of-memory",
            Self::Timeout => "timeout",
            Self::HeaderError => "header-error",
            Self::PayloadError => "payload-error",
            Self::MissingProtocol => "missing-protocol",
            Self::ProtocolSpecificError => "protocol-specific-error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_defined_codes_decode() {
        for code in 0..=6 {
            let status = ResponseStatus::try_from(code).expect("已定义状态码");
            assert_eq!(i64::from(status.code()), code);
        }
        assert_eq!(ResponseStatus::try_from(7), Err(7));
        assert_eq!(ResponseStatus::try_from(-1), Err(-1));
    }
}
