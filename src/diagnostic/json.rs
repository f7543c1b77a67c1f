use serde::Serialize;

use super::{Diagnostic, Origin, Severity};
use crate::asm::SourceMap;

#[derive(Serialize)]
struct Report<'a> {
    severity: &'static str,
    message: &'a str,
    labels: Vec<LabelReport<'a>>,
    notes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
    /// Present only for uncaught runtime errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<OriginReport<'a>>,
}

#[derive(Serialize)]
struct LabelReport<'a> {
    start: usize,
    end: usize,
    message: &'a str,
    primary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    col: Option<u32>,
}

#[derive(Serialize)]
struct OriginReport<'a> {
    kind: &'static str,
    function: &'a str,
    offset: usize,
    line: u32,
    col: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    instruction: Option<&'a str>,
}

impl<'a> From<&'a Origin> for OriginReport<'a> {
    fn from(o: &'a Origin) -> Self {
        OriginReport {
            kind: o.kind.name(),
            function: &o.function,
            offset: o.offset,
            line: o.line,
            col: o.column,
            instruction: o.instruction.as_deref(),
        }
    }
}

/// One diagnostic as a single-line JSON object.
pub fn render(d: &Diagnostic) -> String {
    let map = d.source.as_deref().map(SourceMap::new);
    let labels = d
        .labels
        .iter()
        .map(|l| {
            let position = map.as_ref().map(|m| m.lookup(l.span.start));
            LabelReport {
                start: l.span.start,
                end: l.span.end,
                message: &l.message,
                primary: l.is_primary,
                line: position.map(|(line, _)| line),
                col: position.map(|(_, col)| col),
            }
        })
        .collect();
    let report = Report {
        severity: match d.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        },
        message: &d.message,
        labels,
        notes: &d.notes,
        suggestion: d.suggestion.as_deref(),
        error: d.origin.as_ref().map(OriginReport::from),
    };
    serde_json::to_string(&report)
        .unwrap_or_else(|e| format!(r#"{{"severity":"error","message":"cannot encode diagnostic: {e}"}}"#))
}
