pub mod ansi;
pub mod json;

use crate::asm::{AsmError, SourceMap, Span};
use crate::bytecode::CompiledProgram;
use crate::bytecode::disasm::disassemble_instruction;
use crate::heap::ObjectHeap;
use crate::value::ErrorKind;
use crate::vm::VmError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

/// The bytecode position an uncaught runtime error escaped from.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub kind: ErrorKind,
    pub function: String,
    pub offset: usize,
    /// Source position recorded in the instruction's location arrays.
    pub line: u32,
    pub column: u32,
    /// Disassembled instruction, once a listing has been attached.
    pub instruction: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
    pub origin: Option<Origin>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
            origin: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: true });
        self
    }

    pub fn with_secondary_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: false });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attaches `source` and, for uncaught runtime errors, a primary label on
    /// the mnemonic of the instruction that raised it.
    pub fn for_runtime(e: &VmError, source: &str) -> Self {
        let d = Diagnostic::from(e).with_source(source);
        let Some(origin) = &d.origin else {
            return d;
        };
        let Some(start) = SourceMap::new(source).offset(origin.line, origin.column).filter(|&o| o < source.len()) else {
            return d;
        };
        let width = source[start..].find(char::is_whitespace).unwrap_or(source.len() - start);
        d.with_span(Span { start, end: start + width.max(1) }, "raised here")
    }

    /// Fills in the disassembled instruction of the error origin.
    pub fn with_listing(mut self, program: &CompiledProgram, heap: &ObjectHeap) -> Self {
        if let Some(origin) = &mut self.origin {
            origin.instruction = disassemble_instruction(program, &origin.function, origin.offset, heap);
        }
        self
    }
}

// ---- From impls for error types ----

impl From<&AsmError> for Diagnostic {
    fn from(e: &AsmError) -> Self {
        let mut d = Diagnostic::error(&e.message);
        if e.span != Span::UNKNOWN {
            d = d.with_span(e.span, "here");
        }
        if let Some(hint) = &e.hint {
            d = d.with_suggestion(hint.clone());
        }
        d
    }
}

impl From<&VmError> for Diagnostic {
    fn from(e: &VmError) -> Self {
        match e {
            VmError::Uncaught { kind, message, line, column, function, offset } => {
                let mut d = Diagnostic::error(format!("uncaught {kind}: {message}"));
                d.origin = Some(Origin {
                    kind: *kind,
                    function: function.clone(),
                    offset: *offset,
                    line: *line,
                    column: *column,
                    instruction: None,
                });
                d
            }
            VmError::StackOverflow { .. } => {
                Diagnostic::error(e.to_string()).with_suggestion("look for recursion without a base case")
            }
            _ => Diagnostic::error(e.to_string()),
        }
    }
}
