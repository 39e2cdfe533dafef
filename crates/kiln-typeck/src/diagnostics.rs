//! Ariadne-based diagnostic rendering for type errors.
//!
//! Renders `TypeError` variants into labeled, colorless reports against the
//! source text the expression was read from. Errors raised outside any
//! expression (registry and instance errors) point at the start of the
//! source.

use std::ops::Range;

use ariadne::{Color, Config, Label, Report, ReportKind, Source};

use kiln_common::{Span, Ty};

use crate::error::{ConstraintOrigin, TypeError};

// ── Error Codes ────────────────────────────────────────────────────────

fn error_code(err: &TypeError) -> &'static str {
    match err {
        TypeError::Mismatch { .. } => "E0001",
        TypeError::InfiniteType { .. } => "E0002",
        TypeError::ArityMismatch { .. } => "E0003",
        TypeError::UnboundVariable { .. } => "E0004",
        TypeError::UnboundValue { .. } => "E0005",
        TypeError::UnknownConstructor { .. } => "E0006",
        TypeError::UnknownType { .. } => "E0007",
        TypeError::NoSuchField { .. } | TypeError::UnresolvedField { .. } => "E0008",
        TypeError::UnknownClass { .. } => "E0009",
        TypeError::MissingMember { .. } | TypeError::UnknownMember { .. } => "E0010",
        TypeError::NoInstance { .. } => "E0011",
        TypeError::AmbiguousInstance { .. } => "E0012",
        TypeError::DuplicateDefinition { .. } => "E0013",
        TypeError::CyclicAlias { .. } => "E0014",
        TypeError::ForeignTypeConflict { .. } => "E0015",
        TypeError::InvalidUpcast { .. } => "E0016",
        TypeError::DrainLimit { .. } => "E0017",
        TypeError::Internal(_) => "E0018",
    }
}

fn to_range(span: Span) -> Range<usize> {
    span.start as usize..span.end as usize
}

/// Suggest a conversion when the two types are the usual numeric pair.
fn fix_suggestion(expected: &Ty, found: &Ty) -> Option<String> {
    match (expected.to_string().as_str(), found.to_string().as_str()) {
        ("Int", "Float") => Some("convert with `toInt`".to_string()),
        ("Float", "Int") => Some("convert with `toFloat`".to_string()),
        ("Bool", f) if f != "Bool" => Some("expected a boolean expression".to_string()),
        _ => None,
    }
}

// ── Main Rendering Function ────────────────────────────────────────────

/// Render a type error into a formatted diagnostic string.
pub fn render_diagnostic(error: &TypeError, source: &str, filename: &str) -> String {
    let config = Config::default().with_color(false);
    let source_len = source.len();

    // ariadne needs a non-empty span inside the source.
    let clamp = |r: Range<usize>| -> Range<usize> {
        let s = r.start.min(source_len);
        let e = r.end.min(source_len).max(s);
        if s == e {
            s..e.saturating_add(1).min(source_len)
        } else {
            s..e
        }
    };
    let whole = || clamp(0..source_len);
    let origin_range = |origin: &ConstraintOrigin| {
        origin.span().map(|s| clamp(to_range(s))).unwrap_or_else(whole)
    };

    let code = error_code(error);
    let msg = error.to_string();
    if source.is_empty() {
        return format!("error[{}]: {}", code, msg);
    }

    let (range, label, help): (Range<usize>, String, Option<String>) = match error {
        TypeError::Mismatch {
            expected,
            found,
            origin,
        } => {
            let label = match origin {
                ConstraintOrigin::Annotation { .. } => format!("expected {} from annotation", expected),
                ConstraintOrigin::IfCondition { .. } | ConstraintOrigin::Guard { .. } => {
                    format!("this must be {}", expected)
                }
                _ => format!("expected {}, found {}", expected, found),
            };
            (origin_range(origin), label, fix_suggestion(expected, found))
        }
        TypeError::InfiniteType { origin, .. } => (
            origin_range(origin),
            "recursive type here".to_string(),
            Some("a value cannot have a type that refers to itself".to_string()),
        ),
        TypeError::ArityMismatch { expected, found, origin } => {
            let help = if expected > found {
                format!("missing {} argument(s)", expected - found)
            } else {
                format!("{} extra argument(s)", found - expected)
            };
            (origin_range(origin), format!("expected {} here", expected), Some(help))
        }
        TypeError::UnboundVariable { span, .. } => (
            clamp(to_range(*span)),
            "not found in this scope".to_string(),
            None,
        ),
        TypeError::UnboundValue { span, .. } => (
            clamp(to_range(*span)),
            "used before a value was supplied".to_string(),
            Some("define the value before compiling code that reads it".to_string()),
        ),
        TypeError::UnknownConstructor { span, .. } => (
            clamp(to_range(*span)),
            "no named type declares this constructor".to_string(),
            None,
        ),
        TypeError::NoSuchField { span, ty, .. } => (
            clamp(to_range(*span)),
            format!("on a value of type {}", ty),
            None,
        ),
        TypeError::UnresolvedField { span, .. } => (
            clamp(to_range(*span)),
            "type of this value is unknown".to_string(),
            Some("annotate the value with a record type".to_string()),
        ),
        TypeError::NoInstance { span, .. } => (
            clamp(to_range(*span)),
            "required here".to_string(),
            None,
        ),
        TypeError::AmbiguousInstance { span, .. } => (
            clamp(to_range(*span)),
            "instance needed here".to_string(),
            Some("annotate the expression to pick one instance".to_string()),
        ),
        TypeError::CyclicAlias { .. } => (whole(), format!("while reading {}", filename), None),
        TypeError::DrainLimit { limit, .. } => (
            whole(),
            format!("stopped after {} steps", limit),
            None,
        ),
        _ => (whole(), format!("while reading {}", filename), None),
    };

    let mut builder = Report::build(ReportKind::Error, range.clone())
        .with_code(code)
        .with_message(&msg)
        .with_config(config)
        .with_label(Label::new(range).with_message(label).with_color(Color::Red));
    if let Some(help) = help {
        builder.set_help(help);
    }
    let report = builder.finish();

    let mut buf = Vec::new();
    match report.write(Source::from(source), &mut buf) {
        Ok(()) => String::from_utf8(buf)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()),
        Err(_) => format!("error[{}]: {}", code, msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_code() {
        let err = TypeError::Internal("boom".into());
        assert_eq!(error_code(&err), "E0018");
        let err = TypeError::UnboundVariable {
            name: "x".into(),
            span: Span::new(0, 1),
        };
        assert_eq!(error_code(&err), "E0004");
    }

    #[test]
    fn numeric_mismatch_suggests_conversion() {
        assert_eq!(
            fix_suggestion(&Ty::float(), &Ty::int()).as_deref(),
            Some("convert with `toFloat`")
        );
        assert!(fix_suggestion(&Ty::int(), &Ty::char()).is_none());
    }
}
