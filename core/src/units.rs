//! Human-readable size strings (`"200M"`, `"1.5g"`, `"512KiB"`) in binary
//! units.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid size: '{0}'")]
pub struct SizeError(pub String);

const UNITS: [char; 5] = ['k', 'm', 'g', 't', 'p'];

/// Parses a size string into bytes. The unit letter is optional and may be
/// followed by `i` and/or `b`, all case-insensitive; one space may separate
/// the number from the unit.
pub fn ram_in_bytes(size: &str) -> Result<i64, SizeError> {
    let invalid = || SizeError(size.to_string());
    let s = size.trim();

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() || number.starts_with('.') || number.ends_with('.') {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let suffix = suffix.strip_prefix(' ').unwrap_or(suffix).to_ascii_lowercase();
    let mut chars = suffix.chars().peekable();

    let mut multiplier: f64 = 1.0;
    if let Some(pos) = chars.peek().and_then(|c| UNITS.iter().position(|u| u == c)) {
        chars.next();
        multiplier = 1024f64.powi(pos as i32 + 1);
    }
    if chars.peek() == Some(&'i') {
        chars.next();
    }
    if chars.peek() == Some(&'b') {
        chars.next();
    }
    if chars.next().is_some() {
        return Err(invalid());
    }

    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes > i64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(ram_in_bytes("1024").unwrap(), 1024);
        assert_eq!(ram_in_bytes("0").unwrap(), 0);
    }

    #[test]
    fn test_binary_units() {
        assert_eq!(ram_in_bytes("200M").unwrap(), 200 * 1024 * 1024);
        assert_eq!(ram_in_bytes("1k").unwrap(), 1024);
        assert_eq!(ram_in_bytes("1KiB").unwrap(), 1024);
        assert_eq!(ram_in_bytes("2 gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(ram_in_bytes("1.5g").unwrap(), 1536 * 1024 * 1024);
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "M", "12x", "1.2.", "-5m", "10mbx", "1  m"] {
            assert!(ram_in_bytes(bad).is_err(), "{bad} should be rejected");
        }
    }
}
