//! Content comparison for change sets.

use crate::glob::is_diffable;
use crate::path::GhostPath;
use crate::types::{FileChange, FileChangeAction};
use similar::{ChangeTag, TextDiff};

/// Added and removed line counts turning `old` into `new`.
pub fn count_line_changes(old: &str, new: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(old, new);

    let mut additions = 0;
    let mut deletions = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => additions += 1,
            ChangeTag::Delete => deletions += 1,
            ChangeTag::Equal => {}
        }
    }
    (additions, deletions)
}

/// Describe an edit of `path` from `remote` to `local` content.
///
/// Returns `None` when the contents are equivalent: no changed lines for
/// text files, no size difference for everything else.
pub fn describe_edit(path: &str, remote: &[u8], local: &[u8]) -> Option<FileChange> {
    let extension = GhostPath::new(path)
        .ok()
        .and_then(|p| p.extension().map(str::to_ascii_lowercase));
    let mut change = FileChange::new(path, FileChangeAction::Edit);

    if is_diffable(extension.as_deref()) {
        let (add, del) = count_line_changes(
            &String::from_utf8_lossy(remote),
            &String::from_utf8_lossy(local),
        );
        if add == 0 && del == 0 {
            return None;
        }
        change.add = Some(add);
        change.del = Some(del);
    } else {
        let size_diff = (local.len() as u64).abs_diff(remote.len() as u64);
        if size_diff == 0 {
            return None;
        }
        change.size_diff = Some(size_diff);
    }
    Some(change)
}
