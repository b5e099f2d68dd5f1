//! Diagnostics: error kinds, source-context rendering, and the per-context
//! lazily-loaded source line cache.

mod render;

pub use render::{render_diagnostic, write_diagnostic};

use crate::ast::SourcePos;
use rustc_hash::FxHashMap;
use std::path::Path;
use thiserror::Error;

/// The error kinds surfaced by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Typecheck,
    Prove,
    Compile,
    Runtime,
    Io,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Typecheck => "typecheck",
            ErrorKind::Prove => "prove",
            ErrorKind::Compile => "compile",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Diagnostic severity. The prover's failure classes are errors; comptime VM
/// failures and unreachable-body findings downgrade to warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A single diagnostic: kind, severity, message, position, and (for Prove and
/// Runtime kinds) the original-function attribution that survives inlining.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub original_function: Option<String>,
}

impl Diagnostic {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Diagnostic {
            kind,
            severity: Severity::Error,
            message: message.into(),
            file: String::new(),
            line: 0,
            col: 0,
            original_function: None,
        }
    }

    pub fn warning(kind: ErrorKind, message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(kind, message)
        }
    }

    pub fn at(mut self, file: impl Into<String>, pos: SourcePos) -> Self {
        self.file = file.into();
        self.line = pos.line;
        self.col = pos.col;
        self
    }

    pub fn in_function(mut self, name: impl Into<String>) -> Self {
        self.original_function = Some(name.into());
        self
    }

    /// One-line header: `filename:line:col: error: message`.
    pub fn header(&self) -> String {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        let loc = if self.line > 0 {
            format!("{}:{}:{}", self.file, self.line, self.col)
        } else if !self.file.is_empty() {
            self.file.clone()
        } else {
            "<unknown>".to_string()
        };
        match &self.original_function {
            Some(func) => format!("{loc}: {sev}: {} (in {func})", self.message),
            None => format!("{loc}: {sev}: {}", self.message),
        }
    }
}

/// The top-level engine error: a diagnostic, or a bare failure from a layer
/// that has no source position.
#[derive(Debug, Error)]
pub enum EtchError {
    #[error("{}", .0.header())]
    Diagnostic(Diagnostic),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EtchError {
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            EtchError::Diagnostic(d) => Some(d),
            _ => None,
        }
    }
}

impl From<Diagnostic> for EtchError {
    fn from(d: Diagnostic) -> Self {
        EtchError::Diagnostic(d)
    }
}

/// Source lines, loaded from disk on the first diagnostic in each file and
/// kept per context.
#[derive(Debug, Default)]
pub struct SourceLineCache {
    files: FxHashMap<String, Option<Vec<String>>>,
}

impl SourceLineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register source text for a file (used by `compile_str`, where no
    /// on-disk file exists).
    pub fn insert_source(&mut self, file: &str, source: &str) {
        self.files.insert(
            file.to_string(),
            Some(source.lines().map(|l| l.to_string()).collect()),
        );
    }

    /// Get a 1-indexed line, loading the file lazily.
    pub fn line(&mut self, file: &str, line: u32) -> Option<&str> {
        if line == 0 {
            return None;
        }
        let entry = self.files.entry(file.to_string()).or_insert_with(|| {
            std::fs::read_to_string(Path::new(file))
                .ok()
                .map(|text| text.lines().map(|l| l.to_string()).collect())
        });
        entry
            .as_ref()
            .and_then(|lines| lines.get((line - 1) as usize))
            .map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_format() {
        let d = Diagnostic::error(ErrorKind::Prove, "integer overflow in '+'")
            .at("main.etch", SourcePos::new(3, 12));
        assert_eq!(
            d.header(),
            "main.etch:3:12: error: integer overflow in '+'"
        );
    }

    #[test]
    fn test_header_with_origin() {
        let d = Diagnostic::error(ErrorKind::Runtime, "division by zero")
            .at("main.etch", SourcePos::new(9, 5))
            .in_function("helper");
        assert!(d.header().contains("(in helper)"));
    }

    #[test]
    fn test_line_cache_from_source() {
        let mut cache = SourceLineCache::new();
        cache.insert_source("mem.etch", "line one\nline two\nline three");
        assert_eq!(cache.line("mem.etch", 2), Some("line two"));
        assert_eq!(cache.line("mem.etch", 9), None);
        assert_eq!(cache.line("mem.etch", 0), None);
    }
}
