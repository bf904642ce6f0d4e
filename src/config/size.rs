//! Human readable byte sizes such as `4mb` or `512kb`.

/// Parse a size like `4mb`, `512 KB`, `1gb` or a plain byte count.
///
/// Units are binary (`1kb` = 1024 bytes). Returns `None` for anything
/// unparseable.
///
/// # Example
///
/// ```rust
/// use mcp_http_stream::config::parse_size;
///
/// assert_eq!(parse_size("4mb"), Some(4 * 1024 * 1024));
/// assert_eq!(parse_size("100"), Some(100));
/// assert_eq!(parse_size("lots"), None);
/// ```
pub fn parse_size(input: &str) -> Option<usize> {
    let normalized = input.trim().to_ascii_lowercase();
    let split = normalized
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(normalized.len());
    let (digits, unit) = normalized.split_at(split);
    let value: usize = digits.parse().ok()?;

    let multiplier: usize = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units() {
        assert_eq!(parse_size("10b"), Some(10));
        assert_eq!(parse_size("2kb"), Some(2048));
        assert_eq!(parse_size("4MB"), Some(4 * 1024 * 1024));
        assert_eq!(parse_size(" 1 gb "), Some(1024 * 1024 * 1024));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("mb"), None);
        assert_eq!(parse_size("12tb"), None);
        assert_eq!(parse_size("-4mb"), None);
    }
}
