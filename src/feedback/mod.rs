//! Structured Feedback Module
//!
//! Machine-readable compiler output:
//! - JSON error reports with stable codes
//! - Compilation statistics

use serde::Serialize;

use crate::utils::Error;

// ==================== Structured Error Report ====================

/// A structured error report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Error code (e.g., "E0001")
    pub code: String,

    /// Error severity
    pub severity: Severity,

    /// Human-readable message
    pub message: String,

    /// Location information
    pub location: Option<Location>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    /// A defect in the compiler rather than in the program
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl ErrorReport {
    /// Create an error report from a compiler error
    pub fn from_error(error: &Error, file_name: &str) -> Self {
        let severity = if error.is_internal() {
            Severity::InternalError
        } else {
            Severity::Error
        };
        let location = error.span().map(|span| Location {
            file: file_name.to_string(),
            line: span.line,
            column: span.column,
        });
        Self {
            code: error.code().to_string(),
            severity,
            message: error.to_string(),
            location,
        }
    }

    /// `file:line:column: message`, or `code: message` without a location
    pub fn to_human(&self) -> String {
        match &self.location {
            Some(loc) => format!("{}:{}:{}: {}", loc.file, loc.line, loc.column, self.message),
            None => format!("{}: {}", self.code, self.message),
        }
    }
}

// ==================== Compilation Feedback ====================

/// Complete compilation feedback
#[derive(Debug, Clone, Serialize)]
pub struct CompilationFeedback {
    /// Compilation status
    pub success: bool,

    /// Source file
    pub source_file: String,

    /// All errors
    pub diagnostics: Vec<ErrorReport>,

    /// Compilation statistics
    pub stats: CompilationStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompilationStats {
    /// Number of user routines
    pub routine_count: usize,

    /// Number of types in the arena, predefined ones included
    pub type_count: usize,

    /// Lines of source
    pub loc: usize,

    /// Lines of generated assembly
    pub asm_lines: usize,
}

impl CompilationFeedback {
    /// Create a successful feedback
    pub fn success(source_file: String, stats: CompilationStats) -> Self {
        Self {
            success: true,
            source_file,
            diagnostics: vec![],
            stats,
        }
    }

    /// Create a failed feedback
    pub fn failure(source_file: String, error: &Error) -> Self {
        let diagnostics = vec![ErrorReport::from_error(error, &source_file)];
        Self {
            success: false,
            source_file,
            diagnostics,
            stats: CompilationStats::default(),
        }
    }

    /// Output as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Span;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_report_from_error() {
        let err = Error::NotDefined { name: "y".to_string(), span: Span::new(10, 11, 2, 5) };
        let report = ErrorReport::from_error(&err, "prog.pas");
        assert_eq!(report.code, "E0001");
        assert_eq!(report.severity, Severity::Error);
        assert_eq!(report.to_human(), "prog.pas:2:5: Not defined \"y\"");
    }

    #[test]
    fn test_internal_errors_have_no_location() {
        let err = Error::InternalInvariant("Index arity exceeds rank".to_string());
        let report = ErrorReport::from_error(&err, "prog.pas");
        assert_eq!(report.severity, Severity::InternalError);
        assert_eq!(report.location, None);
        assert_eq!(report.to_human(), "ICE: Internal compiler error: Index arity exceeds rank");
    }

    #[test]
    fn test_feedback_json() {
        let err = Error::ExpectedLvalue { span: Span::new(0, 1, 1, 1) };
        let json = CompilationFeedback::failure("a.pas".to_string(), &err).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["diagnostics"][0]["code"], "E0008");
        assert_eq!(value["diagnostics"][0]["severity"], "error");
        assert_eq!(value["diagnostics"][0]["location"]["line"], 1);
    }
}
