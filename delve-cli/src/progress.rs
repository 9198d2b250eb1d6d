//! Terminal progress output for a running session.

use delve_core::research::session::{ResearchCallback, ResearchPhase};
use std::io::Write;

/// Prints phase changes and search progress to stderr so stdout stays
/// clean for the report.
pub struct ProgressPrinter {
    quiet: bool,
}

impl ProgressPrinter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    fn line(&self, text: &str) {
        if self.quiet {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{text}");
    }
}

pub fn phase_line(phase: ResearchPhase, progress: f64) -> String {
    format!("[{:>3.0}%] {}", (progress * 100.0).clamp(0.0, 100.0), phase.as_str())
}

impl ResearchCallback for ProgressPrinter {
    fn on_phase_change(&self, phase: ResearchPhase, progress: f64) {
        self.line(&phase_line(phase, progress));
    }

    fn on_sub_question_searched(&self, question: &str, results: usize) {
        self.line(&format!("       {results:>3} results  {question}"));
    }

    fn on_contradiction_found(&self, claim_a: &str, claim_b: &str) {
        self.line(&format!("       contradiction: \"{claim_a}\" vs \"{claim_b}\""));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_line() {
        assert_eq!(phase_line(ResearchPhase::Searching, 0.25), "[ 25%] searching");
        assert_eq!(phase_line(ResearchPhase::Complete, 1.0), "[100%] complete");
    }
}
