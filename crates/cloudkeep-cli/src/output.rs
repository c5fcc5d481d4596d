//! Terminal output for the CLI
//!
//! Commands talk to an [`OutputFormatter`] and never print directly, so
//! `--json` switches every command to machine-readable output at once.
//! In JSON mode only structured documents go to stdout; diagnostics go to
//! stderr as one JSON object per line.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Human,
    Json,
}

pub trait OutputFormatter {
    /// Headline of a successful outcome
    fn success(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    /// Detail line under a headline
    fn info(&self, message: &str);
    /// Structured result document (JSON mode only)
    fn print_json(&self, value: &Value);
}

pub struct HumanFormatter;

impl OutputFormatter for HumanFormatter {
    fn success(&self, message: &str) {
        println!("\u{2713} {message}");
    }

    fn error(&self, message: &str) {
        eprintln!("\u{2717} {message}");
    }

    fn warn(&self, message: &str) {
        eprintln!("! {message}");
    }

    fn info(&self, message: &str) {
        if message.is_empty() {
            println!();
        } else {
            println!("  {message}");
        }
    }

    fn print_json(&self, _value: &Value) {}
}

pub struct JsonFormatter;

impl JsonFormatter {
    fn diagnostic(level: &str, message: &str) {
        eprintln!("{}", json!({ "level": level, "message": message }));
    }
}

impl OutputFormatter for JsonFormatter {
    fn success(&self, message: &str) {
        Self::diagnostic("info", message);
    }

    fn error(&self, message: &str) {
        Self::diagnostic("error", message);
    }

    fn warn(&self, message: &str) {
        Self::diagnostic("warning", message);
    }

    fn info(&self, _message: &str) {}

    fn print_json(&self, value: &Value) {
        match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{text}"),
            Err(e) => Self::diagnostic("error", &format!("cannot render output: {e}")),
        }
    }
}

pub fn get_formatter(json: bool) -> Box<dyn OutputFormatter> {
    if json {
        Box::new(JsonFormatter)
    } else {
        Box::new(HumanFormatter)
    }
}

/// Byte count with a binary unit, one decimal above bytes
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanised() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
