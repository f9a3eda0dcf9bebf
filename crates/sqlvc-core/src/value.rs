use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Quotes a possibly schema-qualified name with ANSI double quotes, one
/// segment at a time. Segments are split as in [`identifier_segments`].
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    identifier_segments(name)
        .iter()
        .map(|segment| ansi_quote(segment))
        .collect::<Vec<_>>()
        .join(".")
}

/// Encodes one identifier segment for use inside a dotted name. Segments
/// holding a `.` or `"` keep ANSI quotes so the name splits back the same
/// way.
#[must_use]
pub fn segment_name(segment: &str) -> String {
    if segment.contains(['.', '"']) {
        ansi_quote(segment)
    } else {
        segment.to_string()
    }
}

/// Splits a dotted name on the dots outside double quotes and unquotes each
/// segment. Inverse of joining [`segment_name`] outputs with `.`.
#[must_use]
pub fn identifier_segments(name: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = name.chars().peekable();
    let mut quoted = false;

    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' if quoted => quoted = false,
            '"' if current.is_empty() => quoted = true,
            '.' if !quoted => segments.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments
}

fn ansi_quote(segment: &str) -> String {
    format!("\"{}\"", segment.replace('"', "\"\""))
}

/// Rewrites ISO-8601 date-time strings (those with a `T` time component) to
/// the `YYYY-MM-DD HH:MM:SS[.fff]` literal form. Offsets are normalized to
/// UTC. Every other value is returned unchanged.
#[must_use]
pub fn normalize_datetime_value(value: &Value) -> Value {
    let Value::String(raw) = value else {
        return value.clone();
    };

    match parse_iso_datetime(raw).and_then(format_datetime_literal) {
        Some(literal) => Value::String(literal),
        None => value.clone(),
    }
}

fn parse_iso_datetime(raw: &str) -> Option<PrimitiveDateTime> {
    // Cheap shape check before handing the text to the parsers.
    let bytes = raw.as_bytes();
    if bytes.len() < 19 || bytes[4] != b'-' || bytes[7] != b'-' || bytes[10] != b'T' {
        return None;
    }

    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        let utc = parsed.to_offset(UtcOffset::UTC);
        return Some(PrimitiveDateTime::new(utc.date(), utc.time()));
    }

    PrimitiveDateTime::parse(
        raw,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    )
    .or_else(|_| {
        PrimitiveDateTime::parse(
            raw,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        )
    })
    .ok()
}

fn format_datetime_literal(value: PrimitiveDateTime) -> Option<String> {
    let nanos = value.nanosecond();
    let formatted = if nanos == 0 {
        value.format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
    } else if nanos % 1_000_000 == 0 {
        value.format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ))
    } else {
        value.format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
        ))
    };
    formatted.ok()
}
