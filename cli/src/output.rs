//! Output formatting for CLI commands

use colored::Colorize;
use tally_shared::SampleError;

pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// One sample the aggregator refused, indented under the batch summary.
pub fn rejected(sample: &SampleError) {
    eprintln!(
        "  {} metric #{}: {}",
        "⚠".yellow(),
        sample.index.to_string().bold(),
        sample.reason
    );
}
