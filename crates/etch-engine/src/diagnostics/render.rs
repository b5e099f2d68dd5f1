//! Terminal rendering of diagnostics.
//!
//! Format: the `filename:line:col: error: message` header, then the line
//! before the error line, the error line itself, a caret line, and the line
//! after.

use super::{Diagnostic, Severity, SourceLineCache};
use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Render a diagnostic (with source context) into a plain string.
pub fn render_diagnostic(diag: &Diagnostic, cache: &mut SourceLineCache) -> String {
    let mut out = diag.header();
    out.push('\n');
    if diag.line == 0 {
        return out;
    }
    let width = (diag.line + 1).to_string().len();
    if diag.line > 1 {
        if let Some(prev) = cache.line(&diag.file, diag.line - 1) {
            out.push_str(&format!("{:>width$} | {}\n", diag.line - 1, prev));
        }
    }
    if let Some(line) = cache.line(&diag.file, diag.line) {
        out.push_str(&format!("{:>width$} | {}\n", diag.line, line));
        let caret_pad = " ".repeat(diag.col.saturating_sub(1) as usize);
        out.push_str(&format!("{:>width$} | {}^\n", "", caret_pad));
    }
    if let Some(next) = cache.line(&diag.file, diag.line + 1) {
        out.push_str(&format!("{:>width$} | {}\n", diag.line + 1, next));
    }
    out
}

/// Write a diagnostic to stderr with color.
pub fn write_diagnostic(diag: &Diagnostic, cache: &mut SourceLineCache) {
    let mut stream = StandardStream::stderr(ColorChoice::Auto);
    let color = match diag.severity {
        Severity::Error => Color::Red,
        Severity::Warning => Color::Yellow,
    };
    let _ = stream.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true));
    let _ = write!(stream, "{}", diag.header());
    let _ = stream.reset();
    let _ = writeln!(stream);
    let rendered = render_diagnostic(diag, cache);
    // Header already printed in color; emit only the context lines.
    if let Some(rest) = rendered.split_once('\n') {
        let _ = write!(stream, "{}", rest.1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SourcePos;
    use crate::diagnostics::ErrorKind;

    #[test]
    fn test_render_context_lines() {
        let mut cache = SourceLineCache::new();
        cache.insert_source(
            "t.etch",
            "fn main() -> int {\n    return xs[9];\n}\n",
        );
        let diag = Diagnostic::error(ErrorKind::Prove, "index out of bounds")
            .at("t.etch", SourcePos::new(2, 12));
        let text = render_diagnostic(&diag, &mut cache);
        assert!(text.starts_with("t.etch:2:12: error: index out of bounds"));
        assert!(text.contains("fn main() -> int {"));
        assert!(text.contains("return xs[9];"));
        assert!(text.contains("^"));
        assert!(text.contains("}"));
    }

    #[test]
    fn test_render_without_position() {
        let mut cache = SourceLineCache::new();
        let diag = Diagnostic::error(ErrorKind::Internal, "bad state");
        let text = render_diagnostic(&diag, &mut cache);
        assert_eq!(text, "<unknown>: error: bad state\n");
    }
}
