//! Byte size formatting and parsing.

const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Format a byte count in 1024 steps, e.g. `128 KiB` or `1.50 GiB`
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value.fract() == 0.0 {
        format!("{} {}", value as u64, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Compact block size notation used for recordsize and volblocksize: `128K`, `1M`, `512`
pub fn format_block_size(bytes: u64) -> String {
    if bytes >= MIB {
        format!("{}M", bytes / MIB)
    } else if bytes >= KIB {
        format!("{}K", bytes / KIB)
    } else {
        bytes.to_string()
    }
}

/// Parse `512`, `16K`, `128k`, `1M`, `16M` (optionally with a trailing `B`)
pub fn parse_block_size(s: &str) -> Option<u64> {
    let s = s.trim().to_ascii_uppercase();
    let s = s.strip_suffix('B').unwrap_or(&s);
    let (digits, multiplier) = match s.chars().last()? {
        'K' => (&s[..s.len() - 1], KIB),
        'M' => (&s[..s.len() - 1], MIB),
        'G' => (&s[..s.len() - 1], MIB * 1024),
        _ => (s, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(131072), "128 KiB");
        assert_eq!(format_size(1536 * MIB), "1.50 GiB");
        assert_eq!(format_size(10 * 1024 * 1024 * 1024), "10 GiB");
    }

    #[test]
    fn test_block_size_roundtrip_notation() {
        assert_eq!(format_block_size(131072), "128K");
        assert_eq!(format_block_size(MIB), "1M");
        assert_eq!(format_block_size(512), "512");

        assert_eq!(parse_block_size("16K"), Some(16384));
        assert_eq!(parse_block_size("128k"), Some(131072));
        assert_eq!(parse_block_size("1M"), Some(MIB));
        assert_eq!(parse_block_size("512"), Some(512));
        assert_eq!(parse_block_size("bogus"), None);
        assert_eq!(parse_block_size(""), None);
    }
}
