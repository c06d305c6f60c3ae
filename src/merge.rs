//! Three-way text merge for note content.
//!
//! Line-based diff3: both sides are diffed against the common ancestor and
//! non-overlapping edits combine cleanly. Overlapping edits produce inline
//! conflict regions with LOCAL/REMOTE markers so the user resolves them in
//! the note itself.

use similar::{capture_diff_slices, Algorithm, DiffOp};

pub const CONFLICT_MARKER_START: &str = "<<<<<<< LOCAL";
pub const CONFLICT_MARKER_SEPARATOR: &str = "=======";
pub const CONFLICT_MARKER_END: &str = ">>>>>>> REMOTE";

/// Result of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub content: String,
    /// Number of conflict regions in the content
    pub conflicts: usize,
}

impl MergeOutcome {
    fn clean(content: String) -> Self {
        Self {
            content,
            conflicts: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.conflicts == 0
    }
}

/// A contiguous edited region: base lines [base_start, base_end) were
/// replaced by side lines [side_start, side_end).
#[derive(Debug, Clone, Copy)]
struct EditBlock {
    base_start: usize,
    base_end: usize,
    side_start: usize,
    side_end: usize,
}

/// Merge `local` and `remote` against their common ancestor `base`.
///
/// Without a base there is nothing to diff against, so differing contents
/// become a single conflict region spanning both versions.
pub fn merge_content(base: Option<&str>, local: &str, remote: &str) -> MergeOutcome {
    if local == remote {
        return MergeOutcome::clean(local.to_string());
    }
    let base = match base {
        Some(base) => base,
        None => return conflict_block(local, remote),
    };
    if local == base {
        return MergeOutcome::clean(remote.to_string());
    }
    if remote == base {
        return MergeOutcome::clean(local.to_string());
    }
    diff3_merge(base, local, remote)
}

fn diff3_merge(base: &str, local: &str, remote: &str) -> MergeOutcome {
    let base_lines: Vec<&str> = base.split_inclusive('\n').collect();
    let local_lines: Vec<&str> = local.split_inclusive('\n').collect();
    let remote_lines: Vec<&str> = remote.split_inclusive('\n').collect();

    let local_blocks = edit_blocks(&capture_diff_slices(
        Algorithm::Myers,
        &base_lines,
        &local_lines,
    ));
    let remote_blocks = edit_blocks(&capture_diff_slices(
        Algorithm::Myers,
        &base_lines,
        &remote_lines,
    ));

    let mut out = String::new();
    let mut conflicts = 0usize;
    let mut base_cursor = 0usize;
    let mut li = 0usize; // next unconsumed local block
    let mut ri = 0usize;
    // Running line-count offset between base and each side, over the
    // blocks consumed so far
    let mut local_delta = 0isize;
    let mut remote_delta = 0isize;

    loop {
        let next_local = local_blocks.get(li);
        let next_remote = remote_blocks.get(ri);
        let (lo, mut hi) = match (next_local, next_remote) {
            (None, None) => break,
            (Some(l), None) => (l.base_start, l.base_end),
            (None, Some(r)) => (r.base_start, r.base_end),
            (Some(l), Some(r)) => {
                if l.base_start <= r.base_start {
                    (l.base_start, l.base_end)
                } else {
                    (r.base_start, r.base_end)
                }
            }
        };

        // Unchanged base lines before the region
        for line in &base_lines[base_cursor..lo] {
            out.push_str(line);
        }

        let local_start = (lo as isize + local_delta) as usize;
        let remote_start = (lo as isize + remote_delta) as usize;

        // Grow the region while blocks from either side fall inside it.
        // A block whose base range merely touches `hi` stays separate
        // unless it is an insertion at exactly that seam.
        let mut local_in = 0usize;
        let mut remote_in = 0usize;
        loop {
            let mut grew = false;
            while let Some(b) = local_blocks.get(li + local_in) {
                if b.base_start < hi || (b.base_start == hi && b.base_end == hi) {
                    hi = hi.max(b.base_end);
                    local_delta +=
                        (b.side_end - b.side_start) as isize - (b.base_end - b.base_start) as isize;
                    local_in += 1;
                    grew = true;
                } else {
                    break;
                }
            }
            while let Some(b) = remote_blocks.get(ri + remote_in) {
                if b.base_start < hi || (b.base_start == hi && b.base_end == hi) {
                    hi = hi.max(b.base_end);
                    remote_delta +=
                        (b.side_end - b.side_start) as isize - (b.base_end - b.base_start) as isize;
                    remote_in += 1;
                    grew = true;
                } else {
                    break;
                }
            }
            if !grew {
                break;
            }
        }

        let local_end = (hi as isize + local_delta) as usize;
        let remote_end = (hi as isize + remote_delta) as usize;
        let local_slice = &local_lines[local_start..local_end];
        let remote_slice = &remote_lines[remote_start..remote_end];

        if remote_in == 0 || local_slice == remote_slice {
            push_lines(&mut out, local_slice);
        } else if local_in == 0 {
            push_lines(&mut out, remote_slice);
        } else {
            conflicts += 1;
            push_conflict(&mut out, local_slice, remote_slice);
        }

        base_cursor = hi;
        li += local_in;
        ri += remote_in;
    }

    for line in &base_lines[base_cursor..] {
        out.push_str(line);
    }

    MergeOutcome {
        content: out,
        conflicts,
    }
}

/// Collapse diff ops into contiguous edited regions, coalescing adjacent
/// non-equal ops.
fn edit_blocks(ops: &[DiffOp]) -> Vec<EditBlock> {
    let mut blocks: Vec<EditBlock> = Vec::new();
    for op in ops {
        if matches!(op, DiffOp::Equal { .. }) {
            continue;
        }
        let (old, new) = (op.old_range(), op.new_range());
        if let Some(last) = blocks.last_mut() {
            if last.base_end == old.start && last.side_end == new.start {
                last.base_end = old.end;
                last.side_end = new.end;
                continue;
            }
        }
        blocks.push(EditBlock {
            base_start: old.start,
            base_end: old.end,
            side_start: new.start,
            side_end: new.end,
        });
    }
    blocks
}

fn push_lines(out: &mut String, lines: &[&str]) {
    for line in lines {
        out.push_str(line);
    }
}

fn push_conflict(out: &mut String, local: &[&str], remote: &[&str]) {
    out.push_str(CONFLICT_MARKER_START);
    out.push('\n');
    push_lines_terminated(out, local);
    out.push_str(CONFLICT_MARKER_SEPARATOR);
    out.push('\n');
    push_lines_terminated(out, remote);
    out.push_str(CONFLICT_MARKER_END);
    out.push('\n');
}

/// Emit lines, making sure the chunk ends with a newline so the following
/// marker gets its own line.
fn push_lines_terminated(out: &mut String, lines: &[&str]) {
    for line in lines {
        out.push_str(line);
    }
    if !lines.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn conflict_block(local: &str, remote: &str) -> MergeOutcome {
    let mut out = String::new();
    push_conflict(
        &mut out,
        &local.split_inclusive('\n').collect::<Vec<_>>(),
        &remote.split_inclusive('\n').collect::<Vec<_>>(),
    );
    MergeOutcome {
        content: out,
        conflicts: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_contents_merge_clean() {
        let result = merge_content(Some("a\nb\n"), "a\nx\n", "a\nx\n");
        assert!(result.is_clean());
        assert_eq!(result.content, "a\nx\n");
    }

    #[test]
    fn test_only_local_changed() {
        let result = merge_content(Some("a\nb\n"), "a\nchanged\n", "a\nb\n");
        assert!(result.is_clean());
        assert_eq!(result.content, "a\nchanged\n");
    }

    #[test]
    fn test_only_remote_changed() {
        let result = merge_content(Some("a\nb\n"), "a\nb\n", "a\nchanged\n");
        assert!(result.is_clean());
        assert_eq!(result.content, "a\nchanged\n");
    }

    #[test]
    fn test_non_overlapping_edits_combine() {
        let base = "one\ntwo\nthree\nfour\nfive\n";
        let local = "ONE\ntwo\nthree\nfour\nfive\n";
        let remote = "one\ntwo\nthree\nfour\nFIVE\n";
        let result = merge_content(Some(base), local, remote);
        assert!(result.is_clean());
        assert_eq!(result.content, "ONE\ntwo\nthree\nfour\nFIVE\n");
    }

    #[test]
    fn test_overlapping_edits_conflict() {
        let base = "shared\nline\n";
        let local = "shared\nlocal version\n";
        let remote = "shared\nremote version\n";
        let result = merge_content(Some(base), local, remote);
        assert!(!result.is_clean());
        assert!(result.content.contains(CONFLICT_MARKER_START));
        assert!(result.content.contains("local version"));
        assert!(result.content.contains("remote version"));
        assert!(result.content.contains(CONFLICT_MARKER_END));
        assert!(result.content.starts_with("shared\n"));
    }

    #[test]
    fn test_same_edit_both_sides_is_clean() {
        let base = "a\nb\nc\n";
        let local = "a\nB\nc\n";
        let remote = "a\nB\nc\n";
        let result = merge_content(Some(base), local, remote);
        assert!(result.is_clean());
        assert_eq!(result.content, "a\nB\nc\n");
    }

    #[test]
    fn test_no_base_wraps_everything() {
        let result = merge_content(None, "mine\n", "theirs\n");
        assert!(!result.is_clean());
        assert_eq!(
            result.content,
            "<<<<<<< LOCAL\nmine\n=======\ntheirs\n>>>>>>> REMOTE\n"
        );
    }

    #[test]
    fn test_local_insertion_and_remote_deletion_apart() {
        let base = "a\nb\nc\nd\ne\n";
        let local = "a\nnew\nb\nc\nd\ne\n";
        let remote = "a\nb\nc\nd\n";
        let result = merge_content(Some(base), local, remote);
        assert!(result.is_clean());
        assert_eq!(result.content, "a\nnew\nb\nc\nd\n");
    }

    #[test]
    fn test_conflict_at_end_without_trailing_newline() {
        let base = "a\nb";
        let local = "a\nlocal tail";
        let remote = "a\nremote tail";
        let result = merge_content(Some(base), local, remote);
        assert!(!result.is_clean());
        assert!(result.content.contains("local tail\n======="));
        assert!(result.content.contains("remote tail\n>>>>>>> REMOTE"));
    }

    #[test]
    fn test_adjacent_but_disjoint_edits() {
        // Both sides touch neighbouring lines; the regions coalesce into
        // one conflict rather than producing garbled output.
        let base = "a\nb\nc\n";
        let local = "a\nB1\nc\n";
        let remote = "a\nb\nC2\n";
        let result = merge_content(Some(base), local, remote);
        // Non-overlapping base ranges (1..2 vs 2..3) must merge clean.
        assert!(result.is_clean());
        assert_eq!(result.content, "a\nB1\nC2\n");
    }
}
