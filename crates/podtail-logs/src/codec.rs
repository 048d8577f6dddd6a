//! Splitting timestamped log lines

/// The line carried no timestamp prefix
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedLineError {
    #[error("missing timestamp")]
    MissingTimestamp,
}

/// Split `"<timestamp> <content>"` on the first space
pub fn split_line(line: &str) -> Result<(&str, &str), MalformedLineError> {
    line.split_once(' ')
        .ok_or(MalformedLineError::MissingTimestamp)
}

/// Drop the fractional seconds from an RFC3339 timestamp.
///
/// The log API's `sinceTime` only has second precision, so resume
/// bookkeeping is keyed on the truncated form. Anything after the
/// fractional digits (the `Z` or a numeric offset) is kept.
pub fn canonicalize(timestamp: &str) -> String {
    let Some(dot) = timestamp.find('.') else {
        return timestamp.to_string();
    };
    let digits = timestamp[dot + 1..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return timestamp.to_string();
    }
    let mut canonical = String::with_capacity(timestamp.len() - digits - 1);
    canonical.push_str(&timestamp[..dot]);
    canonical.push_str(&timestamp[dot + 1 + digits..]);
    canonical
}
