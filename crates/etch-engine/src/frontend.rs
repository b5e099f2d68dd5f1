//! The frontend seam.
//!
//! Lexing, parsing, and AST desugaring live outside this crate. A host (or
//! the CLI) installs a `Frontend` implementation on the context; the engine
//! only consumes the typed AST it produces.

use crate::ast::Program;
use crate::diagnostics::Diagnostic;

/// Produces a typed AST from source text. Implementations report lex/parse/
/// typecheck failures as diagnostics with positions in `filename`.
pub trait Frontend {
    fn parse(&self, source: &str, filename: &str) -> Result<Program, Diagnostic>;
}

impl<F> Frontend for F
where
    F: Fn(&str, &str) -> Result<Program, Diagnostic>,
{
    fn parse(&self, source: &str, filename: &str) -> Result<Program, Diagnostic> {
        self(source, filename)
    }
}
