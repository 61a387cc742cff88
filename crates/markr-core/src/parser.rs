use roxmltree::{Document, Node, ParsingOptions};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::{ParseError, TestResultCandidate};

pub const ROOT_ELEMENT: &str = "mcq-test-results";
const RESULT_ELEMENT: &str = "mcq-test-result";

/// Parses an `mcq-test-results` document into candidates, in document order.
///
/// External entities are never resolved: a DTD may declare them but any
/// reference to one fails the parse. The whole document is rejected on the
/// first invalid result.
///
/// # Errors
/// Returns [`ParseError::MalformedXml`] when the bytes are not well-formed
/// UTF-8 XML and [`ParseError::SchemaValidation`] when the structure or a
/// field is invalid.
pub fn parse_test_results(xml: &[u8]) -> Result<Vec<TestResultCandidate>, ParseError> {
    let text = std::str::from_utf8(xml)
        .map_err(|err| ParseError::MalformedXml(format!("document is not UTF-8: {err}")))?;

    let options = ParsingOptions { allow_dtd: true, ..ParsingOptions::default() };
    let document = Document::parse_with_options(text, options)
        .map_err(|err| ParseError::MalformedXml(err.to_string()))?;

    let root = document.root_element();
    if root.tag_name().name() != ROOT_ELEMENT {
        return Err(ParseError::SchemaValidation(format!(
            "Invalid root element: {}. Expected '{ROOT_ELEMENT}'",
            root.tag_name().name()
        )));
    }

    let results = root
        .children()
        .filter(|node| node.has_tag_name(RESULT_ELEMENT))
        .map(parse_result_element)
        .collect::<Result<Vec<_>, _>>()?;

    if results.is_empty() {
        return Err(ParseError::SchemaValidation(
            "No valid test results found in XML document".to_string(),
        ));
    }

    Ok(results)
}

fn parse_result_element(node: Node<'_, '_>) -> Result<TestResultCandidate, ParseError> {
    let scanned_at = node.attribute("scanned-on").and_then(|raw| {
        let parsed = parse_scanned_on(raw);
        if parsed.is_none() {
            tracing::warn!(
                scanned_on = raw,
                "invalid timestamp format, storing result without scan time"
            );
        }
        parsed
    });

    let first_name = child_text(node, "first-name");
    let last_name = child_text(node, "last-name");
    let student_number = key_text(node, "student-number");
    let test_id = key_text(node, "test-id");
    let summary = node.children().find(|child| child.has_tag_name("summary-marks"));
    let available = summary.and_then(|marks| marks.attribute("available"));
    let obtained = summary.and_then(|marks| marks.attribute("obtained"));

    let mut missing = Vec::new();
    if first_name.is_none() {
        missing.push("first-name");
    }
    if last_name.is_none() {
        missing.push("last-name");
    }
    if student_number.is_none() {
        missing.push("student-number");
    }
    if test_id.is_none() {
        missing.push("test-id");
    }
    if summary.is_none() {
        missing.push("summary-marks");
    } else {
        if available.is_none() {
            missing.push("available attribute");
        }
        if obtained.is_none() {
            missing.push("obtained attribute");
        }
    }

    let (
        Some(first_name),
        Some(last_name),
        Some(student_number),
        Some(test_id),
        Some(available),
        Some(obtained),
    ) = (first_name, last_name, student_number, test_id, available, obtained)
    else {
        return Err(ParseError::SchemaValidation(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    };

    let (marks_available, marks_obtained) = parse_marks(available, obtained)?;

    Ok(TestResultCandidate {
        student_number,
        test_id,
        first_name,
        last_name,
        marks_obtained,
        marks_available,
        scanned_at,
    })
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .find(|child| child.has_tag_name(name))
        .map(|child| child.text().unwrap_or_default().to_string())
}

/// Identity fields are trimmed; a blank value counts as missing.
fn key_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child_text(node, name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_marks(available: &str, obtained: &str) -> Result<(u32, u32), ParseError> {
    let (Ok(available_value), Ok(obtained_value)) =
        (available.trim().parse::<i64>(), obtained.trim().parse::<i64>())
    else {
        return Err(ParseError::SchemaValidation(format!(
            "Marks must be integers: available={available}, obtained={obtained}"
        )));
    };

    if available_value < 0 || obtained_value < 0 {
        return Err(ParseError::SchemaValidation(format!(
            "Marks cannot be negative: available={available_value}, obtained={obtained_value}"
        )));
    }

    match (u32::try_from(available_value), u32::try_from(obtained_value)) {
        (Ok(available), Ok(obtained)) => Ok((available, obtained)),
        _ => Err(ParseError::SchemaValidation(format!(
            "Marks out of range: available={available_value}, obtained={obtained_value}"
        ))),
    }
}

/// Reads a `scanned-on` attribute. Accepts RFC3339, ISO 8601 with an offset,
/// offset-less ISO 8601 date-times, which are taken as UTC, and bare dates,
/// taken as midnight UTC.
#[must_use]
pub fn parse_scanned_on(raw: &str) -> Option<OffsetDateTime> {
    let value = raw.trim();
    OffsetDateTime::parse(value, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(value, &Iso8601::DEFAULT))
        .or_else(|_| {
            PrimitiveDateTime::parse(value, &Iso8601::DEFAULT).map(PrimitiveDateTime::assume_utc)
        })
        .or_else(|_| {
            Date::parse(value, &Iso8601::DEFAULT).map(|date| date.midnight().assume_utc())
        })
        .ok()
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
}
