// printer.rs — Indented text emission
//
// A thin wrapper over a `String` that tracks indentation and brace nesting
// for the generated C++/CUDA/ISPC source.
//
// Preconditions: none.
// Postconditions: every `push_block` is closed by a `pop_block` or
//                 `chain_block`; `finish` returns the accumulated text.
// Failure modes: none.
// Side effects: none.

use std::fmt::Write as _;

const INDENT: &str = "    ";

#[derive(Debug, Default)]
pub struct CodePrinter {
    out: String,
    indent: usize,
}

impl CodePrinter {
    pub fn new() -> Self {
        CodePrinter {
            out: String::with_capacity(16 * 1024),
            indent: 0,
        }
    }

    /// Write one full line at the current indentation.
    pub fn add_line(&mut self, line: impl AsRef<str>) {
        self.add_indent();
        let _ = writeln!(self.out, "{}", line.as_ref());
    }

    /// Write several lines, each re-indented at the current level.
    /// Leading and trailing blank lines of `text` are dropped.
    pub fn add_multi_line(&mut self, text: &str) {
        let lines: Vec<&str> = text.lines().collect();
        let first = lines.iter().position(|l| !l.trim().is_empty());
        let last = lines.iter().rposition(|l| !l.trim().is_empty());
        let (Some(first), Some(last)) = (first, last) else {
            return;
        };
        let common = lines[first..=last]
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.len() - l.trim_start().len())
            .min()
            .unwrap_or(0);
        for line in &lines[first..=last] {
            if line.trim().is_empty() {
                self.add_newline();
            } else {
                self.add_line(&line[common..]);
            }
        }
    }

    pub fn add_indent(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str(INDENT);
        }
    }

    /// Append text without indentation or newline.
    pub fn add_text(&mut self, text: impl AsRef<str>) {
        self.out.push_str(text.as_ref());
    }

    pub fn add_newline(&mut self) {
        self.out.push('\n');
    }

    pub fn add_newlines(&mut self, n: usize) {
        for _ in 0..n {
            self.out.push('\n');
        }
    }

    /// `header {` and indent.
    pub fn push_block(&mut self, header: impl AsRef<str>) {
        let header = header.as_ref();
        if header.is_empty() {
            self.add_line("{");
        } else {
            self.add_line(format!("{header} {{"));
        }
        self.indent += 1;
    }

    /// Dedent and `}` followed by `suffix` (e.g. `;`).
    pub fn pop_block_with(&mut self, suffix: &str) {
        self.indent = self.indent.saturating_sub(1);
        self.add_line(format!("}}{suffix}"));
    }

    pub fn pop_block(&mut self) {
        self.pop_block_with("");
    }

    /// `} header {` without changing the nesting depth.
    pub fn chain_block(&mut self, header: impl AsRef<str>) {
        self.indent = self.indent.saturating_sub(1);
        self.add_line(format!("}} {} {{", header.as_ref()));
        self.indent += 1;
    }

    pub fn increase_indent(&mut self) {
        self.indent += 1;
    }

    pub fn decrease_indent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn finish(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_blocks_are_indented() {
        let mut p = CodePrinter::new();
        p.push_block("namespace coreneuron");
        p.push_block("void f()");
        p.add_line("int x = 0;");
        p.pop_block();
        p.pop_block();
        assert_eq!(
            p.finish(),
            "namespace coreneuron {\n    void f() {\n        int x = 0;\n    }\n}\n"
        );
    }

    #[test]
    fn chain_block_keeps_depth() {
        let mut p = CodePrinter::new();
        p.push_block("if (a)");
        p.add_line("x = 1;");
        p.chain_block("else");
        p.add_line("x = 2;");
        p.pop_block();
        assert_eq!(p.finish(), "if (a) {\n    x = 1;\n} else {\n    x = 2;\n}\n");
    }

    #[test]
    fn multi_line_strips_common_indent() {
        let mut p = CodePrinter::new();
        p.increase_indent();
        p.add_multi_line(
            r#"
            int a = 0;
                int b = 1;
        "#,
        );
        assert_eq!(p.finish(), "    int a = 0;\n        int b = 1;\n");
    }

    #[test]
    fn pop_block_with_suffix() {
        let mut p = CodePrinter::new();
        p.push_block("struct S");
        p.add_line("int a;");
        p.pop_block_with(";");
        assert_eq!(p.finish(), "struct S {\n    int a;\n};\n");
    }
}
