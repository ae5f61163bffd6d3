//! Running counters for one in-flight sync.
//!
//! [`SyncProgress::ingest_line`] is a best-effort reading of `p4 sync` output.
//! It never fails: lines it does not recognise are ignored.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Number of errors shown by status displays.
pub const RECENT_ERRORS: usize = 5;

static TOTAL_RE: OnceLock<Regex> = OnceLock::new();
static BYTES_RE: OnceLock<Regex> = OnceLock::new();
static ERROR_RE: OnceLock<Regex> = OnceLock::new();

fn total_re() -> &'static Regex {
    TOTAL_RE.get_or_init(|| Regex::new(r"(\d+) files to").expect("valid total regex"))
}

fn bytes_re() -> &'static Regex {
    BYTES_RE.get_or_init(|| Regex::new(r"(\d+) bytes").expect("valid bytes regex"))
}

fn error_re() -> &'static Regex {
    ERROR_RE.get_or_init(|| Regex::new(r"(?i)error|failed").expect("valid error regex"))
}

/// Separator between a file spec and its action phrase in `p4 sync` output:
/// `//depot/core/main.c#4 - updating /work/core/main.c`.
const FILE_SEPARATOR: &str = " - ";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub total_files: u64,
    /// Never decreases within one sync.
    pub completed_files: u64,
    pub bytes_transferred: u64,
    pub current_file: Option<String>,
    /// First word of the action phrase: `updating`, `added`, `deleted`, `refreshing`...
    pub current_action: Option<String>,
    /// Every error line seen, in arrival order.
    pub errors: Vec<String>,
}

impl SyncProgress {
    /// Apply every parsing rule that matches `line`.
    pub fn ingest_line(&mut self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        if let Some((file_spec, action)) = line.split_once(FILE_SEPARATOR) {
            let file = file_spec.split('#').next().unwrap_or(file_spec).trim();
            let action = action.split_whitespace().next();
            self.record_file(file, action.unwrap_or_default(), 0);
        }

        if let Some(total) = capture_number(total_re(), line) {
            self.total_files = total;
        }

        if let Some(bytes) = capture_number(bytes_re(), line) {
            self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);
        }

        if error_re().is_match(line) {
            self.errors.push(line.to_string());
        }
    }

    /// Count one finished file.
    pub fn record_file(&mut self, file: &str, action: &str, bytes: u64) {
        self.completed_files += 1;
        self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);
        self.current_file = (!file.is_empty()).then(|| file.to_string());
        self.current_action = (!action.is_empty()).then(|| action.to_string());
    }

    /// The last `n` errors, oldest first.
    pub fn recent_errors(&self, n: usize) -> &[String] {
        let start = self.errors.len().saturating_sub(n);
        &self.errors[start..]
    }

    /// `true` once a known total has been reached.
    pub fn is_complete(&self) -> bool {
        self.total_files > 0 && self.completed_files >= self.total_files
    }

    /// Completion percentage, `None` while the total is unknown.
    pub fn percent(&self) -> Option<f64> {
        (self.total_files > 0)
            .then(|| (self.completed_files as f64 / self.total_files as f64 * 100.0).min(100.0))
    }
}

fn capture_number(re: &Regex, line: &str) -> Option<u64> {
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn file_line_updates_current_file_and_action() {
        let mut progress = SyncProgress::default();
        progress.ingest_line("//depot/core/src/main.c#4 - updating /work/core/src/main.c");
        assert_eq!(progress.completed_files, 1);
        assert_eq!(progress.current_file.as_deref(), Some("//depot/core/src/main.c"));
        assert_eq!(progress.current_action.as_deref(), Some("updating"));

        progress.ingest_line("//depot/core/new.txt#1 - added as /work/core/new.txt");
        assert_eq!(progress.completed_files, 2);
        assert_eq!(progress.current_action.as_deref(), Some("added"));
        assert!(progress.errors.is_empty());
    }

    #[rstest]
    #[case("150 files to update", 150)]
    #[case("Sync: 12 files to add, 3 to delete", 12)]
    fn total_line_sets_total(#[case] line: &str, #[case] total: u64) {
        let mut progress = SyncProgress::default();
        progress.ingest_line(line);
        assert_eq!(progress.total_files, total);
        assert_eq!(progress.completed_files, 0);
    }

    #[rstest]
    #[case("Perforce client error:")]
    #[case("Connect to server FAILED; check $P4PORT.")]
    #[case("ERROR: disk full")]
    fn error_lines_are_collected(#[case] line: &str) {
        let mut progress = SyncProgress::default();
        progress.ingest_line(line);
        assert_eq!(progress.errors, vec![line.to_string()]);
    }

    #[test]
    fn unrecognised_lines_are_ignored() {
        let mut progress = SyncProgress::default();
        for line in ["", "   ", "hello world", "#", "files to"] {
            progress.ingest_line(line);
        }
        assert_eq!(progress, SyncProgress::default());
    }

    #[test]
    fn bytes_accumulate() {
        let mut progress = SyncProgress::default();
        progress.ingest_line("transferred 1024 bytes");
        progress.ingest_line("transferred 24 bytes");
        assert_eq!(progress.bytes_transferred, 1048);
    }

    #[test]
    fn recent_errors_keeps_the_tail() {
        let mut progress = SyncProgress::default();
        for n in 0..8 {
            progress.ingest_line(&format!("error {n}"));
        }
        let recent = progress.recent_errors(RECENT_ERRORS);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0], "error 3");
        assert_eq!(recent[4], "error 7");
        assert_eq!(progress.recent_errors(20).len(), 8);
    }

    #[test]
    fn completion_needs_a_known_total() {
        let mut progress = SyncProgress::default();
        progress.record_file("a", "updating", 10);
        assert!(!progress.is_complete());
        assert_eq!(progress.percent(), None);

        progress.total_files = 2;
        assert_eq!(progress.percent(), Some(50.0));
        progress.record_file("b", "updating", 10);
        assert!(progress.is_complete());
        assert_eq!(progress.bytes_transferred, 20);
    }
}
