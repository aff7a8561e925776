//! Common display utilities for CLI commands.

use colored::Colorize;

const MAX_DISPLAY_ITEMS: usize = 10;

/// Display a list with bullet points and optional truncation.
///
/// Shows up to `MAX_DISPLAY_ITEMS` items. If there are more, shows
/// "... and N more". If empty, shows the provided `empty_message`.
pub fn print_list<T>(items: &[T], empty_message: &str, format: impl Fn(&T) -> String) {
    if items.is_empty() {
        println!("    {}", empty_message.dimmed());
        return;
    }

    for item in items.iter().take(MAX_DISPLAY_ITEMS) {
        println!("    {} {}", "•".dimmed(), format(item));
    }

    if items.len() > MAX_DISPLAY_ITEMS {
        println!(
            "    {} ... and {} more",
            "•".dimmed(),
            items.len() - MAX_DISPLAY_ITEMS
        );
    }
}

/// Print a bold label followed by a value.
pub fn print_field(label: &str, value: impl std::fmt::Display) {
    println!("  {}: {value}", label.white().bold());
}

/// Format a 0.0..=1.0 ratio as a percentage.
pub fn percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}
