//! Error types and diagnostic reporting
//!
//! Two kinds of failure live here:
//!
//! - [`CompileError`]: fatal errors surfaced to the driver (I/O, malformed
//!   input modules, codegen failures, or analysis errors aggregated from
//!   diagnostics). These abort the current compile.
//! - [`Diagnostic`]: per-pass findings with a severity. Analysis passes
//!   (memory-leak check, infinite-loop detection) push diagnostics during
//!   `run()`; the driver inspects them afterwards and aborts the build when
//!   any carries [`Severity::Error`].
//!
//! IR contract violations (appending to a sealed block, operand type
//! mismatches) are programmer errors, not diagnostics - they fail loudly via
//! `debug_assert!` in debug builds and are handled as fast-fail in release.

use crate::tir::Span;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CompileError>;

/// Compile error
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("IO error: {message}")]
    Io { message: String },

    #[error("Input module error: {message}")]
    Input { message: String },

    #[error("Codegen error: {message}")]
    Codegen { message: String },

    /// One or more analysis passes reported error-level diagnostics.
    /// The diagnostics themselves have already been emitted.
    #[error("{count} error(s) reported by analysis passes")]
    Analysis { count: usize },
}

impl CompileError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
        }
    }

    pub fn codegen(message: impl Into<String>) -> Self {
        Self::Codegen {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for CompileError {
    fn from(e: serde_json::Error) -> Self {
        Self::Input {
            message: e.to_string(),
        }
    }
}

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A diagnostic produced by an analysis pass.
///
/// Always carries enough location to be actionable without source text
/// (function and block names); the span is attached when the builder
/// recorded one for the offending instruction.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Name of the pass that produced this diagnostic.
    pub pass: &'static str,
    pub function: String,
    pub block: String,
    pub message: String,
    pub span: Option<Span>,
}

impl Diagnostic {
    pub fn error(
        pass: &'static str,
        function: impl Into<String>,
        block: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Error,
            pass,
            function: function.into(),
            block: block.into(),
            message: message.into(),
            span: None,
        }
    }

    pub fn warning(
        pass: &'static str,
        function: impl Into<String>,
        block: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            pass,
            function: function.into(),
            block: block.into(),
            message: message.into(),
            span: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(
            f,
            "{}[{}]: {} (in `{}`, block `{}`)",
            kind, self.pass, self.message, self.function, self.block
        )
    }
}

/// Report a diagnostic with ariadne when source text is available.
///
/// Degrades to a plain `function + block` line when the diagnostic has no
/// span or no source was attached to the compile.
pub fn report_diagnostic(filename: &str, source: Option<&str>, diag: &Diagnostic) {
    use ariadne::{Color, Label, Report, ReportKind, Source};

    let (kind, color) = match diag.severity {
        Severity::Warning => (ReportKind::Warning, Color::Yellow),
        Severity::Error => (ReportKind::Error, Color::Red),
    };

    match (diag.span, source) {
        (Some(span), Some(source)) => {
            Report::build(kind, (filename, span.start..span.end))
                .with_message(format!("[{}] in `{}`", diag.pass, diag.function))
                .with_label(
                    Label::new((filename, span.start..span.end))
                        .with_message(&diag.message)
                        .with_color(color),
                )
                .finish()
                .print((filename, Source::from(source)))
                .ok();
        }
        _ => {
            eprintln!("{diag}");
        }
    }
}

/// Report every diagnostic in order; returns the number of errors seen.
pub fn report_diagnostics(filename: &str, source: Option<&str>, diags: &[Diagnostic]) -> usize {
    let mut errors = 0;
    for diag in diags {
        report_diagnostic(filename, source, diag);
        if diag.is_error() {
            errors += 1;
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let diag = Diagnostic::error("memory-leak-check", "main", "entry", "allocation leaks");
        assert_eq!(
            diag.to_string(),
            "error[memory-leak-check]: allocation leaks (in `main`, block `entry`)"
        );
    }

    #[test]
    fn test_report_counts_errors() {
        let diags = vec![
            Diagnostic::warning("infinite-loop-check", "f", "loop_header", "maybe diverges"),
            Diagnostic::error("memory-leak-check", "g", "entry", "leak"),
        ];
        assert_eq!(report_diagnostics("test.rill", None, &diags), 1);
    }
}
