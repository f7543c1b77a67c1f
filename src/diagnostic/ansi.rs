use std::fmt::Write as _;

use super::{Diagnostic, Label, Origin, Severity};
use crate::asm::SourceMap;

#[derive(Clone, Copy)]
enum Style {
    Error,
    Warning,
    Emphasis,
    Gutter,
    Muted,
}

impl Style {
    fn code(self) -> &'static str {
        match self {
            Style::Error => "1;31",
            Style::Warning => "1;33",
            Style::Emphasis => "1",
            Style::Gutter => "36",
            Style::Muted => "2",
        }
    }
}

/// Terminal renderer. Assembly errors show the offending source line; runtime
/// errors also show the bytecode position they escaped from.
pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, style: Style, text: &str) -> String {
        if self.use_color { format!("\x1b[{}m{text}\x1b[0m", style.code()) } else { text.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();
        let (style, word) = match d.severity {
            Severity::Error => (Style::Error, "error"),
            Severity::Warning => (Style::Warning, "warning"),
        };
        let _ = writeln!(out, "{}: {}", self.paint(style, word), self.paint(Style::Emphasis, &d.message));

        let primary = d.labels.iter().find(|l| l.is_primary);
        if let (Some(label), Some(source)) = (primary, d.source.as_deref()) {
            self.snippet(&mut out, source, label, style);
        }
        if let Some(origin) = &d.origin {
            self.origin(&mut out, origin);
        }

        let bullet = self.paint(Style::Muted, "=");
        for label in d.labels.iter().filter(|l| !l.is_primary && !l.message.is_empty()) {
            let _ = writeln!(out, "  {bullet} {}", label.message);
        }
        for note in &d.notes {
            let _ = writeln!(out, "  {bullet} note: {note}");
        }
        if let Some(suggestion) = &d.suggestion {
            let _ = writeln!(out, "  {bullet} suggestion: {suggestion}");
        }
        out
    }

    /// `--> line:col`, the source line, and carets under the span. A span
    /// running past the end of its line is cut at the line end.
    fn snippet(&self, out: &mut String, source: &str, label: &Label, style: Style) {
        let map = SourceMap::new(source);
        let (line, col) = map.lookup(label.span.start);
        let text = map.line_text(source, line);
        let gutter = line.to_string().len();
        let pad = " ".repeat(gutter);
        let bar = self.paint(Style::Gutter, "|");

        let _ = writeln!(out, "{pad}{} {line}:{col}", self.paint(Style::Gutter, "-->"));
        let _ = writeln!(out, "{pad} {bar}");
        let _ = writeln!(out, "{} {bar} {text}", self.paint(Style::Gutter, &format!("{line:>gutter$}")));

        let indent = col.saturating_sub(1) as usize;
        let room = text.len().saturating_sub(indent).max(1);
        let width = label.span.end.saturating_sub(label.span.start).clamp(1, room);
        let mut marker = self.paint(style, &"^".repeat(width));
        if !label.message.is_empty() {
            marker.push(' ');
            marker.push_str(&self.paint(style, &label.message));
        }
        let _ = writeln!(out, "{pad} {bar} {}{marker}", " ".repeat(indent));
        let _ = writeln!(out, "{pad} {bar}");
    }

    /// One listing-style line: `function+offset  INSTRUCTION  (line:col)`.
    fn origin(&self, out: &mut String, origin: &Origin) {
        let position = format!("{}+{:04}", origin.function, origin.offset);
        let _ = write!(out, "  {} {} {}", self.paint(Style::Muted, "="), origin.kind, self.paint(Style::Gutter, &position));
        if let Some(instruction) = &origin.instruction {
            let _ = write!(out, "  {}", self.paint(Style::Emphasis, instruction));
        }
        let _ = writeln!(out, "  ({}:{})", origin.line, origin.column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::Span;
    use crate::value::ErrorKind;

    fn plain(d: &Diagnostic) -> String {
        AnsiRenderer { use_color: false }.render(d)
    }

    fn misspelled() -> Diagnostic {
        Diagnostic::error("unknown mnemonic 'HLT'")
            .with_span(Span { start: 15, end: 18 }, "here")
            .with_source(".func main 0\n  HLT\n.end\n")
            .with_suggestion("did you mean 'HALT'?")
    }

    fn uncaught() -> Diagnostic {
        let mut d = Diagnostic::error("uncaught RuntimeError: Division by zero")
            .with_span(Span { start: 15, end: 24 }, "raised here")
            .with_source(".func main 0\n  DIV_I32_R R3, R1, R2\n.end\n");
        d.origin = Some(Origin {
            kind: ErrorKind::Runtime,
            function: "main".into(),
            offset: 4,
            line: 2,
            column: 3,
            instruction: Some("DIV_I32_R R3, R1, R2".into()),
        });
        d
    }

    #[test]
    fn assembly_error_layout() {
        let out = plain(&misspelled());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "error: unknown mnemonic 'HLT'");
        assert_eq!(lines[1], " --> 2:3");
        assert_eq!(lines[2], "  |");
        assert_eq!(lines[3], "2 |   HLT");
        assert_eq!(lines[4], "  |   ^^^ here");
        assert_eq!(lines[5], "  |");
        assert_eq!(lines[6], "  = suggestion: did you mean 'HALT'?");
    }

    #[test]
    fn runtime_error_shows_bytecode_position() {
        let out = plain(&uncaught());
        assert!(out.contains("  |   ^^^^^^^^^ raised here\n"), "{out}");
        assert!(out.contains("  = RuntimeError main+0004  DIV_I32_R R3, R1, R2  (2:3)\n"), "{out}");
    }

    #[test]
    fn origin_without_listing_still_locates() {
        let mut d = uncaught();
        if let Some(origin) = &mut d.origin {
            origin.instruction = None;
        }
        assert!(plain(&d).contains("  = RuntimeError main+0004  (2:3)\n"));
    }

    #[test]
    fn carets_stop_at_line_end() {
        let d = Diagnostic::error("bad")
            .with_span(Span { start: 5, end: 40 }, "")
            .with_source("MOVE R1\nHALT\n");
        let out = plain(&d);
        assert!(out.contains("1 | MOVE R1\n  |      ^^\n"), "{out}");
    }

    #[test]
    fn empty_span_gets_one_caret() {
        let d = Diagnostic::error("trailing ','")
            .with_span(Span { start: 8, end: 8 }, "")
            .with_source("MOVE R1,");
        assert!(plain(&d).contains("  |         ^\n"));
    }

    #[test]
    fn no_source_means_no_snippet() {
        let out = plain(&Diagnostic::error("no functions defined").with_note("file is empty"));
        assert_eq!(out, "error: no functions defined\n  = note: file is empty\n");
    }

    #[test]
    fn color_only_when_asked() {
        let colored = AnsiRenderer { use_color: true }.render(&uncaught());
        assert!(colored.starts_with("\x1b[1;31merror\x1b[0m"));
        assert!(!plain(&uncaught()).contains('\x1b'));
        let warning = AnsiRenderer { use_color: true }.render(&Diagnostic::warning("w"));
        assert!(warning.starts_with("\x1b[1;33mwarning"));
    }
}
