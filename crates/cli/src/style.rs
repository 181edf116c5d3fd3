//! Terminal styling for run output.

use comfy_table::Color;
use console::Style;

use zrebase_core::models::Outcome;

fn marked(mark: &str, style: Style, msg: &str) -> String {
    format!("{} {}", style.apply_to(mark), msg)
}

/// Green checkmark line.
pub fn success(msg: &str) -> String {
    marked("✓", Style::new().green(), msg)
}

/// Red cross line.
pub fn error(msg: &str) -> String {
    marked("✗", Style::new().red(), msg)
}

/// Yellow warning line.
pub fn warn(msg: &str) -> String {
    marked("⚠", Style::new().yellow(), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Table cell colour for a branch outcome: green rebased, red failed, cyan
/// planned, yellow skipped.
pub fn outcome_color(outcome: &Outcome) -> Color {
    match outcome {
        Outcome::RebasedOk => Color::Green,
        Outcome::RebasedFailed { .. } => Color::Red,
        Outcome::Planned => Color::Cyan,
        _ => Color::Yellow,
    }
}
