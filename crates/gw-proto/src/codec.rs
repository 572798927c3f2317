//! Record-level frame parsing and emission.
//!
//! Works on bare lines: the link worker strips the direction prefix and the
//! CR-LF terminator before decoding, and adds them back after encoding.

use crate::schema::{self, MessageSchema};
use std::fmt;

/// Codec failure. Malformed frames are logged and dropped by the caller;
/// they never change state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Malformed(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Malformed(s) => write!(f, "malformed frame: {}", s),
        }
    }
}

impl std::error::Error for FrameError {}

pub(crate) fn malformed(msg: impl Into<String>) -> FrameError {
    FrameError::Malformed(msg.into())
}

/// A frame split into schema-validated records, still as strings.
#[derive(Debug)]
pub(crate) struct RawFrame {
    pub schema: &'static MessageSchema,
    /// Fields of the header record. May be longer than the schema requires
    /// (trailing free text); never shorter.
    pub header: Vec<String>,
    /// One entry per detail repetition, each exactly `schema.detail.len()`
    /// fields. A single wire record may carry several repetitions.
    pub details: Vec<Vec<String>>,
}

/// Split a bare line into records and validate it against its schema.
pub(crate) fn parse_line(line: &str) -> Result<RawFrame, FrameError> {
    let mut records = line.split(';');

    let type_record: Vec<&str> = records
        .next()
        .ok_or_else(|| malformed("empty frame"))?
        .split(',')
        .collect();
    let tag = type_record[0];
    let schema =
        schema::schema_for_tag(tag).ok_or_else(|| malformed(format!("unknown type tag '{}'", tag)))?;
    if type_record.len() > 1 {
        return Err(malformed(format!("unexpected fields after type tag '{}'", tag)));
    }

    // Trailing ';' produces one empty record; skip it wherever it lands.
    let mut body: Vec<Vec<String>> = records
        .filter(|r| !r.is_empty())
        .map(|r| r.split(',').map(str::to_owned).collect())
        .collect();

    let header = if schema.header.is_empty() {
        Vec::new()
    } else {
        if body.is_empty() {
            return Err(malformed(format!("'{}' is missing its header record", tag)));
        }
        let header = body.remove(0);
        if header.len() < schema.header.len() {
            return Err(malformed(format!(
                "'{}' header has {} fields, needs {}",
                tag,
                header.len(),
                schema.header.len()
            )));
        }
        header
    };

    let mut details = Vec::new();
    if schema.detail.is_empty() {
        if !body.is_empty() {
            return Err(malformed(format!("'{}' does not carry detail records", tag)));
        }
    } else {
        let width = schema.detail.len();
        for record in body {
            // A record may pack several repetitions; the field positions
            // repeat modulo the schema's detail length.
            if record.len() % width != 0 {
                return Err(malformed(format!(
                    "'{}' detail record has {} fields, needs a multiple of {}",
                    tag,
                    record.len(),
                    width
                )));
            }
            for chunk in record.chunks(width) {
                details.push(chunk.to_vec());
            }
        }
    }

    Ok(RawFrame {
        schema,
        header,
        details,
    })
}

/// Assemble a bare line from the type tag, header fields, and detail records.
pub(crate) fn emit(schema: &MessageSchema, header: &[String], details: &[Vec<String>]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(2 + details.len());
    parts.push(schema.tag.to_owned());
    if !header.is_empty() {
        parts.push(header.join(","));
    }
    for record in details {
        parts.push(record.join(","));
    }
    parts.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MsgType;

    #[test]
    fn bare_tag_parses() {
        let raw = parse_line("GTIME").expect("bare GTIME parses");
        assert_eq!(raw.schema.msg_type, MsgType::TimeRequest);
        assert!(raw.header.is_empty());
        assert!(raw.details.is_empty());
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let err = parse_line("CRAP").expect_err("unknown tag must fail");
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn short_header_is_malformed() {
        // Three header fields where MUP_ requires four.
        assert!(parse_line("MUP_;2,MUP_,DEBUG:").is_err());
    }

    #[test]
    fn trailing_semicolon_is_tolerated() {
        let raw = parse_line("MUP_;2,MUP_,1000,2000;15,1;15,5;").expect("trailing ';' parses");
        assert_eq!(raw.details.len(), 2);
    }

    #[test]
    fn partial_detail_record_is_malformed() {
        assert!(parse_line("MUP_;2,MUP_,1000,2000;15,1;16").is_err());
    }

    #[test]
    fn packed_detail_record_unrolls_modulo_width() {
        let raw = parse_line("MUP_;2,MUP_,1000,2000;15,1,15,5").expect("packed record parses");
        assert_eq!(raw.details.len(), 2);
        assert_eq!(raw.details[1], vec!["15".to_owned(), "5".to_owned()]);
    }

    #[test]
    fn detail_record_on_detail_free_message_is_malformed() {
        assert!(parse_line("MREB;2,MREB,1000,2000;15,1").is_err());
    }

    #[test]
    fn emit_joins_records_and_fields() {
        let schema = crate::schema::schema_for(MsgType::MeterUpdate);
        let line = emit(
            schema,
            &[
                "2".to_owned(),
                "MUP_".to_owned(),
                "1000".to_owned(),
                "2000".to_owned(),
            ],
            &[vec!["15".to_owned(), "1".to_owned()]],
        );
        assert_eq!(line, "MUP_;2,MUP_,1000,2000;15,1");
    }
}
