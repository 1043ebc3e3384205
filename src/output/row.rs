//! CSV row representation and numeric formatting.
//!
//! Formatting is explicit and frozen: downstream consumers parse these
//! files by column position, so every float keeps a fixed number of
//! decimal places and integers are plain decimal.

use chrono::{Local, TimeZone};

/// One encoded record heading for a monitor's sink.
#[derive(Debug, Clone)]
pub struct Row {
    /// Fields in csv_header order, already formatted.
    pub csv: Vec<String>,
    /// Pre-rendered console line, present only when echo mode is on.
    pub console: Option<String>,
}

impl Row {
    pub fn csv_only(csv: Vec<String>) -> Self {
        Self { csv, console: None }
    }
}

/// Epoch seconds, fixed 3 decimal places.
pub fn fmt_timestamp(secs: f64) -> String {
    format!("{secs:.3}")
}

/// `[YYYY-MM-DD HH:MM:SS.mmm]` in local time.
pub fn fmt_time_str(secs: f64) -> String {
    let millis = (secs * 1000.0).round() as i64;
    match Local.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.format("[%Y-%m-%d %H:%M:%S%.3f]").to_string()
        }
        chrono::LocalResult::None => format!("[{secs:.3}]"),
    }
}

/// Latency in microseconds, fixed 3 decimal places.
pub fn fmt_latency_us(us: f64) -> String {
    format!("{us:.3}")
}

/// Throughput in MB/s, fixed 2 decimal places.
pub fn fmt_throughput_mbps(mbps: f64) -> String {
    format!("{mbps:.2}")
}

/// Error rate, fixed 4 decimal places.
pub fn fmt_error_rate(rate: f64) -> String {
    format!("{rate:.4}")
}

/// Size in MB (1024 * 1024 bytes), fixed 2 decimal places.
pub fn fmt_size_mb(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / (1024.0 * 1024.0))
}

/// Average latency in microseconds from a ns total and a count.
pub fn avg_latency_us(total_ns: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    total_ns as f64 / count as f64 / 1000.0
}

/// Escape a field per the minimal-quoting rule: quote only when it
/// contains the delimiter, a quote, or a newline; double embedded quotes.
pub fn escape_field(field: &str, delimiter: char) -> String {
    if field.contains(delimiter)
        || field.contains('"')
        || field.contains('\n')
        || field.contains('\r')
    {
        let mut out = String::with_capacity(field.len() + 2);
        out.push('"');
        for c in field.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
        out
    } else {
        field.to_string()
    }
}

/// Render one CSV line (terminated with LF) into `buf`.
pub fn write_csv_line(buf: &mut String, fields: &[String], delimiter: char) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            buf.push(delimiter);
        }
        buf.push_str(&escape_field(field, delimiter));
    }
    buf.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_decimal_places() {
        assert_eq!(fmt_timestamp(1700000000.5), "1700000000.500");
        assert_eq!(fmt_latency_us(12.3456), "12.346");
        assert_eq!(fmt_latency_us(0.0), "0.000");
        assert_eq!(fmt_throughput_mbps(123.456), "123.46");
        assert_eq!(fmt_error_rate(1.0), "1.0000");
        assert_eq!(fmt_error_rate(0.3333333), "0.3333");
        assert_eq!(fmt_size_mb(4096), "0.00");
        assert_eq!(fmt_size_mb(10 * 1024 * 1024), "10.00");
    }

    #[test]
    fn test_avg_latency() {
        assert_eq!(avg_latency_us(3_000_000, 3), 1000.0);
        assert_eq!(avg_latency_us(0, 0), 0.0);
    }

    #[test]
    fn test_time_str_shape() {
        let s = fmt_time_str(1700000000.123);
        assert!(s.starts_with('['), "{s}");
        assert!(s.ends_with(']'), "{s}");
        // [YYYY-MM-DD HH:MM:SS.mmm] is 25 characters.
        assert_eq!(s.len(), 25, "{s}");
    }

    #[test]
    fn test_escape_plain_field_untouched() {
        assert_eq!(escape_field("vfs_read", ','), "vfs_read");
        assert_eq!(escape_field("", ','), "");
        assert_eq!(escape_field("12.300", ','), "12.300");
    }

    #[test]
    fn test_escape_quotes_when_needed() {
        assert_eq!(escape_field("a,b", ','), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\"", ','), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("line\nbreak", ','), "\"line\nbreak\"");
    }

    #[test]
    fn test_write_csv_line() {
        let mut buf = String::new();
        write_csv_line(
            &mut buf,
            &["a".to_string(), "b,c".to_string(), "d".to_string()],
            ',',
        );
        assert_eq!(buf, "a,\"b,c\",d\n");
    }
}
