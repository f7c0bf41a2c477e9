use anyhow::{anyhow, Result};

/// Parse a human-readable size string (e.g. "1G", "512M", "64k").
pub fn parse_human_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let num: u64 = num.parse().map_err(|_| anyhow!("invalid size: {}", s))?;

    let shift = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kib" => 10,
        "m" | "mib" => 20,
        "g" | "gib" => 30,
        "t" | "tib" => 40,
        _ => return Err(anyhow!("invalid size suffix: {}", s)),
    };
    num.checked_shl(shift)
        .ok_or_else(|| anyhow!("size overflows: {}", s))
}

pub fn fmt_sectors_human(sectors: u64) -> String {
    fmt_bytes_human(sectors << 9)
}

pub fn fmt_bytes_human(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "K", "M", "G", "T", "P"];
    if bytes == 0 { return "0B".to_string() }
    let mut val = bytes as f64;
    for unit in UNITS {
        if val < 1024.0 || *unit == "P" {
            return if val >= 100.0 {
                format!("{:.0}{}", val, unit)
            } else if val >= 10.0 {
                format!("{:.1}{}", val, unit)
            } else {
                format!("{:.2}{}", val, unit)
            };
        }
        val /= 1024.0;
    }
    format!("{}B", bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_human_size("512").unwrap(), 512);
        assert_eq!(parse_human_size("64k").unwrap(), 64 << 10);
        assert_eq!(parse_human_size("1G").unwrap(), 1 << 30);
        assert!(parse_human_size("12q").is_err());
        assert!(parse_human_size("").is_err());
    }

    #[test]
    fn formats_round_trip_magnitudes() {
        assert_eq!(fmt_bytes_human(0), "0B");
        assert_eq!(fmt_bytes_human(512), "512B");
        assert_eq!(fmt_bytes_human(64 << 10), "64.0K");
        assert_eq!(fmt_sectors_human(128), "64.0K");
    }
}
