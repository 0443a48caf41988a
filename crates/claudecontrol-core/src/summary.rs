//! End-of-session accounting of new and unused tapes.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::store::TapeStore;

/// Render the exit summary, or `None` when there is nothing to report.
///
/// New tapes are those created during the session; unused tapes were loaded
/// but never matched. Paths are relative to the tapes root and sorted.
/// Rendering is pure, so calling it twice yields identical output.
#[must_use]
pub fn render_summary(store: &TapeStore) -> Option<String> {
    let new = store.new_paths();
    let used = store.used_paths();
    let all: BTreeSet<PathBuf> = store.all_paths().into_iter().collect();
    let unused: Vec<&PathBuf> = all
        .iter()
        .filter(|path| !used.contains(*path) && !new.contains(*path))
        .collect();

    if new.is_empty() && unused.is_empty() {
        return None;
    }

    let mut out = String::from("===== SUMMARY (claude_control) =====\n");
    if !new.is_empty() {
        out.push_str("New tapes:\n");
        for path in &new {
            out.push_str(&format!("- {}\n", path.display()));
        }
    }
    if !unused.is_empty() {
        out.push_str("Unused tapes:\n");
        for path in unused {
            out.push_str(&format!("- {}\n", path.display()));
        }
    }
    Some(out)
}

/// Print the summary to stdout when there is something to report.
pub fn print_summary(store: &TapeStore) {
    if let Some(text) = render_summary(store) {
        print!("{text}");
    }
}
