// diag.rs — Diagnostics shared by every compilation stage
//
// Model loading, metadata construction, name resolution and the backends all
// report through `Diagnostic`: a stable code, a severity, an optional
// location, the chain of kernels or blocks being emitted, and a hint.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0100`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable diagnostic codes.
///
/// - `E00xx`: model input and statement parsing
/// - `E01xx`: metadata inconsistency
/// - `E02xx`: backend errors
/// - `W01xx`: backend fallback warnings
pub mod codes {
    use super::DiagCode;

    /// A block body failed to lex or parse.
    pub const E0001: DiagCode = DiagCode("E0001");
    /// A variable is declared twice.
    pub const E0002: DiagCode = DiagCode("E0002");
    /// A variable has a kind combination that cannot be classified.
    pub const E0003: DiagCode = DiagCode("E0003");

    /// A variable was requested that was never classified.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// SOLVE names an undeclared block.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// SOLVE uses an unsupported method.
    pub const E0102: DiagCode = DiagCode("E0102");
    /// An ion variable matches no naming convention.
    pub const E0103: DiagCode = DiagCode("E0103");
    /// A before/after block attaches to an unknown lifecycle point.
    pub const E0104: DiagCode = DiagCode("E0104");
    /// DERIVIMPLICIT names an undeclared derivimplicit block.
    pub const E0105: DiagCode = DiagCode("E0105");
    /// `net_move` used outside NET_RECEIVE.
    pub const E0106: DiagCode = DiagCode("E0106");
    /// A TABLE is malformed or refers to unknown variables.
    pub const E0107: DiagCode = DiagCode("E0107");
    /// A concentration write targets a variable that is neither intra nor extra.
    pub const E0108: DiagCode = DiagCode("E0108");
    /// A call has the wrong number of arguments.
    pub const E0109: DiagCode = DiagCode("E0109");
    /// A WATCH statement sits outside NET_RECEIVE and INITIAL, so it has no slot.
    pub const E0110: DiagCode = DiagCode("E0110");
    /// The layout plan could not be serialized for its provenance fingerprint.
    pub const E0111: DiagCode = DiagCode("E0111");

    /// An atomic update was requested with an operator other than `+`/`-`.
    pub const E0200: DiagCode = DiagCode("E0200");
    /// The selected backend cannot express a construct and has no fallback.
    pub const E0201: DiagCode = DiagCode("E0201");

    /// A kernel was delegated to the sequential backend.
    pub const W0100: DiagCode = DiagCode("W0100");
    /// A function was moved to the wrapper file alongside a fallback kernel.
    pub const W0101: DiagCode = DiagCode("W0101");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain, e.g. the kernel being emitted when a
/// resolution failure happened.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub span: Option<Span>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint or causes.
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            cause_chain: Vec::new(),
        }
    }

    /// An error with a code and no source location.
    pub fn error(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, no_span(), message).with_code(code)
    }

    /// A warning with a code and no source location.
    pub fn warning(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, no_span(), message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a source location.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, span: Option<Span>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            span,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

fn no_span() -> Span {
    (0..0).into()
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        for cause in &self.cause_chain {
            write!(f, "\n  in {}", cause.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_span() -> Span {
        use chumsky::span::Span as _;
        Span::new((), 0..1)
    }

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, dummy_span(), "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code() {
        let d = Diagnostic::warning(codes::W0100, "nrn_init falls back to C++");
        assert_eq!(format!("{d}"), "warning[W0100]: nrn_init falls back to C++");
    }

    #[test]
    fn display_with_cause_and_hint() {
        let d = Diagnostic::error(codes::E0100, "variable 'x' is not classified")
            .with_cause("kernel nrn_state", None)
            .with_hint("declare 'x' in the model file");
        assert_eq!(
            format!("{d}"),
            "error[E0100]: variable 'x' is not classified\n  in kernel nrn_state\n  hint: declare 'x' in the model file"
        );
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::new(DiagLevel::Error, dummy_span(), "unsupported method")
            .with_code(codes::E0102)
            .with_hint("use cnexp or derivimplicit")
            .with_cause("BREAKPOINT block", Some(dummy_span()));

        assert_eq!(d.code, Some(codes::E0102));
        assert_eq!(d.hint.as_deref(), Some("use cnexp or derivimplicit"));
        assert_eq!(d.span, dummy_span());
        assert_eq!(d.cause_chain.len(), 1);
        assert!(d.is_error());
    }
}
