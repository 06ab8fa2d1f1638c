//! Span-based text edits.
//!
//! The rewriter never regenerates code from the AST. It records replacements
//! and insertions against original byte offsets and renders any source range
//! with the edits that fall inside it, so a hoisted body carries the same
//! rewrites whether it is rendered at its new home or left in place.

use oxc_span::Span;
use std::cmp::Reverse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub start: u32,
    pub end: u32,
    pub text: String,
    seq: usize,
}

impl Edit {
    fn is_insertion(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Default)]
pub struct EditList {
    edits: Vec<Edit>,
}

impl EditList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, span: Span, text: impl Into<String>) {
        let seq = self.edits.len();
        self.edits.push(Edit {
            start: span.start,
            end: span.end,
            text: text.into(),
            seq,
        });
    }

    /// Insertions at the same offset render in the order they were added.
    pub fn insert(&mut self, at: u32, text: impl Into<String>) {
        self.replace(Span::new(at, at), text);
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    fn ordered(&self) -> Vec<&Edit> {
        let mut ordered: Vec<&Edit> = self.edits.iter().collect();
        // Insertions before a replacement at the same offset, and an outer
        // replacement before anything it encloses.
        ordered.sort_by_key(|e| (e.start, !e.is_insertion(), Reverse(e.end), e.seq));
        ordered
    }

    /// Renders `source[start..end]` with every edit that lies inside the range.
    /// Edits swallowed by an earlier replacement are dropped.
    pub fn render(&self, source: &str, start: u32, end: u32) -> String {
        let mut out = String::with_capacity((end.saturating_sub(start)) as usize);
        let mut cursor = start;
        for edit in self.ordered() {
            if edit.start < cursor || edit.end > end || edit.start < start {
                continue;
            }
            // An insertion exactly at `end` belongs to whatever follows the range.
            if edit.is_insertion() && edit.start == end && end != start {
                continue;
            }
            out.push_str(&source[cursor as usize..edit.start as usize]);
            out.push_str(&edit.text);
            cursor = edit.end;
        }
        out.push_str(&source[cursor as usize..end as usize]);
        out
    }

    pub fn apply(&self, source: &str) -> String {
        let len = source.len() as u32;
        let mut out = self.render(source, 0, len);
        // Trailing insertions (e.g. a registration after the last statement).
        for edit in self.ordered() {
            if edit.is_insertion() && edit.start == len && len != 0 {
                out.push_str(&edit.text);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replacement_and_insertion() {
        let source = "const a = b + c;";
        let mut edits = EditList::new();
        edits.replace(Span::new(10, 11), "x");
        edits.insert(0, "/* head */\n");
        edits.insert(16, "\nfoo();");
        assert_eq!(edits.apply(source), "/* head */\nconst a = x + c;\nfoo();");
    }

    #[test]
    fn test_outer_replacement_swallows_inner_edits() {
        let source = "f(async () => { g(); });";
        let mut edits = EditList::new();
        edits.replace(Span::new(16, 17), "h");
        edits.replace(Span::new(2, 22), "local");
        assert_eq!(edits.apply(source), "f(local);");
        // The inner edit still applies when the inner range is rendered on its own.
        assert_eq!(edits.render(source, 14, 22), "{ h(); }");
    }

    #[test]
    fn test_insertions_keep_order() {
        let source = "x;";
        let mut edits = EditList::new();
        edits.insert(0, "a;");
        edits.insert(0, "b;");
        assert_eq!(edits.apply(source), "a;b;x;");
    }
}
