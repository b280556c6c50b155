//! Compile-time diagnostics.
//!
//! The compiler accumulates errors and warnings in a [`Handler`] owned by the
//! caller, and reports them in one pass at the end of each stage. A stage is
//! skipped iff its predecessor pushed at least one error-severity diagnostic.

use std::cell::RefCell;
use std::fmt;

/// Diagnostic severity level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    /// An error that prevents the next stage from running.
    Error,
    /// A warning; compilation continues.
    Warning,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Error => write!(f, "error"),
            Level::Warning => write!(f, "warning"),
        }
    }
}

/// A diagnostic message with a severity and a source location.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
    /// The file the diagnostic was raised in.
    pub file: String,
    /// The 1-based source line.
    pub line: usize,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: ({}:{}) {}",
            self.level, self.file, self.line, self.message
        )
    }
}

/// Handler for collecting and reporting diagnostics.
///
/// One handler lives for the duration of one compilation; there is no
/// process-global error state. Interior mutability lets stages that only hold
/// a shared reference still push diagnostics.
#[derive(Default)]
pub struct Handler {
    diagnostics: RefCell<Vec<Diagnostic>>,
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an error diagnostic.
    pub fn error(&self, file: &str, line: usize, message: impl Into<String>) {
        self.push(Diagnostic {
            level: Level::Error,
            message: message.into(),
            file: file.to_string(),
            line,
        });
    }

    /// Push a warning diagnostic.
    pub fn warning(&self, file: &str, line: usize, message: impl Into<String>) {
        self.push(Diagnostic {
            level: Level::Warning,
            message: message.into(),
            file: file.to_string(),
            line,
        });
    }

    fn push(&self, diagnostic: Diagnostic) {
        self.diagnostics.borrow_mut().push(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .borrow()
            .iter()
            .any(|d| d.level == Level::Error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .borrow()
            .iter()
            .filter(|d| d.level == Level::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .borrow()
            .iter()
            .filter(|d| d.level == Level::Warning)
            .count()
    }

    /// All diagnostics pushed so far, in push order.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.borrow().clone()
    }

    pub fn clear(&self) {
        self.diagnostics.borrow_mut().clear();
    }

    /// Print every buffered diagnostic to the given writer and say whether
    /// any of them were errors.
    pub fn report(&self, out: &mut dyn std::io::Write) -> bool {
        for diagnostic in self.diagnostics.borrow().iter() {
            let _ = writeln!(out, "{}", diagnostic);
        }
        self.has_errors()
    }
}
