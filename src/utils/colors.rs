// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Terminal output helpers
//!
//! Consistent glyphs and colors for CLI output.

use colored::Colorize;
use std::time::{Duration, SystemTime};

use crate::errors::{DeployflowError, RecoverySuggestion};

/// Print a styled header
pub fn print_header(title: &str) {
    println!("{}", title.bold());
    println!("{}", "═".repeat(title.len().max(40)));
}

/// Print a styled section
pub fn print_section(title: &str) {
    println!();
    println!("{}:", title.bold());
}

/// Print a success check
pub fn print_success(msg: &str) {
    println!("  {} {}", "✓".green(), msg);
}

/// Print an error cross
pub fn print_error(msg: &str) {
    eprintln!("  {} {}", "✗".red(), msg);
}

/// Print a warning
pub fn print_warning(msg: &str) {
    println!("  {} {}", "⚠".yellow(), msg);
}

/// Print a key/value line
pub fn print_field(key: &str, value: &str) {
    println!("  {:<18} {}", format!("{}:", key).dimmed(), value);
}

/// Print the recovery suggestion for an error, if there is one
pub fn print_recovery(error: &DeployflowError) {
    if let Some(suggestion) = RecoverySuggestion::for_error(error) {
        eprintln!();
        eprint!("{}", suggestion.to_string().cyan());
    }
}

/// Time elapsed since `time`, e.g. `3m ago`
pub fn format_age(time: SystemTime) -> String {
    let Ok(age) = SystemTime::now().duration_since(time) else {
        return "just now".to_string();
    };
    let secs = age.as_secs();

    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

/// Duration as seconds with two decimals
pub fn format_duration(duration: Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_age() {
        let now = SystemTime::now();
        assert!(format_age(now - Duration::from_secs(5)).ends_with("s ago"));
        assert_eq!(format_age(now - Duration::from_secs(180)), "3m ago");
        assert_eq!(format_age(now - Duration::from_secs(2 * 86_400 + 10)), "2d ago");
        assert_eq!(format_age(now + Duration::from_secs(60)), "just now");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
