//! Line-level diff over source text.
//!
//! Text is split into lines that keep their `\n` terminator, so applying an
//! edit script reproduces the target byte for byte, including a missing final
//! newline. The edit script is derived from a longest-common-subsequence table
//! over the region left after stripping the common prefix and suffix.

use crate::model::patch::LineEdit;

/// Above this many table cells the middle region is emitted as one
/// delete + insert block instead of running the quadratic LCS.
const MAX_LCS_CELLS: usize = 4_000_000;

/// Result of diffing two texts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDiff {
    pub edits: Vec<LineEdit>,
    pub added: usize,
    pub deleted: usize,
}

/// Split text into lines, each keeping its terminator.
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Compute an edit script turning `base` into `target`.
pub fn diff_lines(base: &str, target: &str) -> LineDiff {
    let a = split_lines(base);
    let b = split_lines(target);

    let prefix = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];

    let mut script = Script::default();
    script.keep(prefix);

    if mid_a.len().saturating_mul(mid_b.len()) > MAX_LCS_CELLS {
        script.delete(mid_a.len());
        for line in mid_b {
            script.insert(line);
        }
    } else {
        lcs_edits(mid_a, mid_b, &mut script);
    }

    script.keep(suffix);
    script.finish()
}

/// Walk an LCS table and emit keep/delete/insert steps. Ties prefer deleting
/// from the base first so the output is deterministic.
fn lcs_edits(a: &[&str], b: &[&str], script: &mut Script) {
    let n = a.len();
    let m = b.len();
    let width = m + 1;
    // table[i * width + j] = LCS length of a[i..] and b[j..]
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if a[i] == b[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            script.keep(1);
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            script.delete(1);
            i += 1;
        } else {
            script.insert(b[j]);
            j += 1;
        }
    }
    script.delete(n - i);
    for line in &b[j..] {
        script.insert(line);
    }
}

/// Accumulates edits, merging adjacent steps of the same type.
#[derive(Default)]
struct Script {
    edits: Vec<LineEdit>,
    added: usize,
    deleted: usize,
}

impl Script {
    fn keep(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(LineEdit::Keep(count)) = self.edits.last_mut() {
            *count += n;
        } else {
            self.edits.push(LineEdit::Keep(n));
        }
    }

    fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.deleted += n;
        if let Some(LineEdit::Delete(count)) = self.edits.last_mut() {
            *count += n;
        } else {
            self.edits.push(LineEdit::Delete(n));
        }
    }

    fn insert(&mut self, line: &str) {
        self.added += 1;
        if let Some(LineEdit::Insert(lines)) = self.edits.last_mut() {
            lines.push(line.to_string());
        } else {
            self.edits.push(LineEdit::Insert(vec![line.to_string()]));
        }
    }

    fn finish(self) -> LineDiff {
        LineDiff {
            edits: self.edits,
            added: self.added,
            deleted: self.deleted,
        }
    }
}

/// Replay an edit script against `base`. The script must consume the base
/// exactly; anything else means it was computed against different text.
pub fn apply_edits(base: &str, edits: &[LineEdit]) -> Result<String, String> {
    let lines = split_lines(base);
    let mut cursor = 0;
    let mut out = String::with_capacity(base.len());

    for edit in edits {
        match edit {
            LineEdit::Keep(n) => {
                let end = cursor + n;
                if end > lines.len() {
                    return Err(format!(
                        "keep of {} lines at line {} overruns base of {} lines",
                        n,
                        cursor,
                        lines.len()
                    ));
                }
                for line in &lines[cursor..end] {
                    out.push_str(line);
                }
                cursor = end;
            }
            LineEdit::Delete(n) => {
                let end = cursor + n;
                if end > lines.len() {
                    return Err(format!(
                        "delete of {} lines at line {} overruns base of {} lines",
                        n,
                        cursor,
                        lines.len()
                    ));
                }
                cursor = end;
            }
            LineEdit::Insert(new_lines) => {
                for line in new_lines {
                    out.push_str(line);
                }
            }
        }
    }

    if cursor != lines.len() {
        return Err(format!(
            "edit script consumed {} of {} base lines",
            cursor,
            lines.len()
        ));
    }
    Ok(out)
}
