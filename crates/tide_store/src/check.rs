//! Predicates of check-and-set and check-and-mutate.

use std::cmp::Ordering;

use tide_proto::{CheckType, Status};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    #[error("unknown check type code {0}")]
    UnknownCheckType(i32),
    #[error("check operand {0:?} is not a 64-bit integer")]
    InvalidOperand(String),
    #[error("stored check value {0:?} is not a 64-bit integer")]
    InvalidStoredValue(String),
}

impl CheckError {
    pub fn status(&self) -> Status {
        Status::InvalidArgument
    }
}

/// Resolve a wire check type and validate its operand before any read.
pub fn validate_check(code: i32, operand: &[u8]) -> Result<CheckType, CheckError> {
    let check_type = CheckType::from_code(code).ok_or(CheckError::UnknownCheckType(code))?;
    if check_type.is_int_compare() && parse_i64(operand).is_none() {
        return Err(CheckError::InvalidOperand(lossy(operand)));
    }
    Ok(check_type)
}

/// Whether the check needs the current value of the check key at all.
pub fn needs_read(check_type: CheckType, return_check_value: bool) -> bool {
    return_check_value || check_type != CheckType::NoCheck
}

/// Evaluate `check_type` against the live value of the check key
/// (`None` when absent or expired).
pub fn check_value(
    check_type: CheckType,
    value: Option<&[u8]>,
    operand: &[u8],
) -> Result<bool, CheckError> {
    let passed = match check_type {
        CheckType::NoCheck => true,
        CheckType::ValueNotExist => value.is_none(),
        CheckType::ValueNotExistOrEmpty => value.map_or(true, <[u8]>::is_empty),
        CheckType::ValueExist => value.is_some(),
        CheckType::ValueNotEmpty => value.is_some_and(|v| !v.is_empty()),
        CheckType::ValueMatchAnywhere => value.is_some_and(|v| contains(v, operand)),
        CheckType::ValueMatchPrefix => value.is_some_and(|v| v.starts_with(operand)),
        CheckType::ValueMatchPostfix => value.is_some_and(|v| v.ends_with(operand)),
        CheckType::ValueBytesLess
        | CheckType::ValueBytesLessOrEqual
        | CheckType::ValueBytesEqual
        | CheckType::ValueBytesGreaterOrEqual
        | CheckType::ValueBytesGreater => match value {
            Some(v) => compare_holds(check_type, v.cmp(operand)),
            None => false,
        },
        CheckType::ValueIntLess
        | CheckType::ValueIntLessOrEqual
        | CheckType::ValueIntEqual
        | CheckType::ValueIntGreaterOrEqual
        | CheckType::ValueIntGreater => {
            let Some(v) = value else {
                return Ok(false);
            };
            let stored = parse_i64(v).ok_or_else(|| CheckError::InvalidStoredValue(lossy(v)))?;
            let operand =
                parse_i64(operand).ok_or_else(|| CheckError::InvalidOperand(lossy(operand)))?;
            compare_holds(check_type, stored.cmp(&operand))
        }
    };
    Ok(passed)
}

/// Parse a decimal `i64` the way stored counters are written.
pub fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse::<i64>().ok()
}

fn compare_holds(check_type: CheckType, ord: Ordering) -> bool {
    match check_type {
        CheckType::ValueBytesLess | CheckType::ValueIntLess => ord == Ordering::Less,
        CheckType::ValueBytesLessOrEqual | CheckType::ValueIntLessOrEqual => {
            ord != Ordering::Greater
        }
        CheckType::ValueBytesEqual | CheckType::ValueIntEqual => ord == Ordering::Equal,
        CheckType::ValueBytesGreaterOrEqual | CheckType::ValueIntGreaterOrEqual => {
            ord != Ordering::Less
        }
        CheckType::ValueBytesGreater | CheckType::ValueIntGreater => ord == Ordering::Greater,
        _ => false,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
