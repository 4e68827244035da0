//! CSV dialect and streaming parser for ingest batch files (spec §6).
//!
//! The dialect, escape-mode line splitter, and field parser are ported
//! directly from the original implementation's `replica::csv` module: a
//! field-start-only enclosure rule (an enclosure character only starts/ends
//! a quoted field when it appears at the very start of the field) and a
//! toggling-escape rule (two consecutive escape characters cancel out).
//! `fieldsEnclosedBy` is optional — `'\0'` means "no enclosure in use".

use crate::error::{CoreError, Result};

/// A line longer than this is rejected rather than buffered indefinitely.
pub const MAX_ROW_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    fields_terminated_by: u8,
    fields_enclosed_by: u8,
    fields_escaped_by: u8,
    lines_terminated_by: u8,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            fields_terminated_by: b'\t',
            fields_enclosed_by: 0,
            fields_escaped_by: b'\\',
            lines_terminated_by: b'\n',
        }
    }
}

impl Dialect {
    pub const ALLOWED_FIELDS_TERMINATED_BY: &'static [u8] = b"\t,";
    pub const ALLOWED_FIELDS_ENCLOSED_BY: &'static [u8] = &[0, b'\'', b'"'];
    pub const ALLOWED_FIELDS_ESCAPED_BY: &'static [u8] = b"\\";
    pub const ALLOWED_LINES_TERMINATED_BY: &'static [u8] = b"\n";

    pub fn new(
        fields_terminated_by: u8,
        fields_enclosed_by: u8,
        fields_escaped_by: u8,
        lines_terminated_by: u8,
    ) -> Result<Self> {
        if !Self::ALLOWED_FIELDS_TERMINATED_BY.contains(&fields_terminated_by) {
            return Err(CoreError::Csv(format!(
                "fieldsTerminatedBy={:?} is not allowed",
                fields_terminated_by as char
            )));
        }
        if !Self::ALLOWED_FIELDS_ENCLOSED_BY.contains(&fields_enclosed_by) {
            return Err(CoreError::Csv(format!(
                "fieldsEnclosedBy={:?} is not allowed",
                fields_enclosed_by as char
            )));
        }
        if !Self::ALLOWED_FIELDS_ESCAPED_BY.contains(&fields_escaped_by) {
            return Err(CoreError::Csv(format!(
                "fieldsEscapedBy={:?} is not allowed",
                fields_escaped_by as char
            )));
        }
        if !Self::ALLOWED_LINES_TERMINATED_BY.contains(&lines_terminated_by) {
            return Err(CoreError::Csv(format!(
                "linesTerminatedBy={:?} is not allowed",
                lines_terminated_by as char
            )));
        }
        Ok(Self {
            fields_terminated_by,
            fields_enclosed_by,
            fields_escaped_by,
            lines_terminated_by,
        })
    }

    pub fn fields_terminated_by(&self) -> u8 {
        self.fields_terminated_by
    }
    pub fn fields_enclosed_by(&self) -> u8 {
        self.fields_enclosed_by
    }
    pub fn fields_escaped_by(&self) -> u8 {
        self.fields_escaped_by
    }
    pub fn lines_terminated_by(&self) -> u8 {
        self.lines_terminated_by
    }

    /// The `FIELDS TERMINATED BY ... ESCAPED BY ... LINES TERMINATED BY ...`
    /// clause passed to `LOAD DATA INFILE`.
    pub fn sql_options(&self) -> String {
        let mut opt = format!(
            "FIELDS TERMINATED BY '{}'",
            Self::escape_for_sql(self.fields_terminated_by)
        );
        if self.fields_enclosed_by != 0 {
            opt.push_str(&format!(
                " ENCLOSED BY '{}'",
                Self::escape_for_sql(self.fields_enclosed_by)
            ));
        }
        opt.push_str(&format!(" ESCAPED BY '{}'", Self::escape_for_sql(self.fields_escaped_by)));
        opt.push_str(&format!(
            " LINES TERMINATED BY '{}'",
            Self::escape_for_sql(self.lines_terminated_by)
        ));
        opt
    }

    fn escape_for_sql(ch: u8) -> String {
        match ch {
            b'\t' => "\\t".to_string(),
            b'\n' => "\\n".to_string(),
            b'\\' => "\\\\".to_string(),
            0 => String::new(),
            c => (c as char).to_string(),
        }
    }

    /// Encode one row's fields into a single CSV-dialect line (without the
    /// trailing line terminator), for tests and for the director-index
    /// builder's batch writer.
    pub fn encode_row(&self, fields: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(self.fields_terminated_by);
            }
            let needs_enclosure = self.fields_enclosed_by != 0
                && field
                    .iter()
                    .any(|&b| b == self.fields_terminated_by || b == self.lines_terminated_by);
            if needs_enclosure {
                out.push(self.fields_enclosed_by);
            }
            for &b in field.iter() {
                let needs_escape = b == self.fields_escaped_by
                    || b == self.lines_terminated_by
                    || (!needs_enclosure && b == self.fields_terminated_by);
                if needs_escape {
                    out.push(self.fields_escaped_by);
                }
                out.push(b);
            }
            if needs_enclosure {
                out.push(self.fields_enclosed_by);
            }
        }
        out
    }
}

/// Splits a streamed byte buffer into raw (still field-delimited) lines,
/// honoring escape mode across the line terminator.
pub struct Parser {
    dialect: Dialect,
    line_buf: Vec<u8>,
    in_escape_mode: bool,
    line_num: u64,
}

impl Parser {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect, line_buf: Vec::new(), in_escape_mode: false, line_num: 0 }
    }

    /// Feed a chunk of input, invoking `on_line` for each complete line.
    /// If `flush` is set, a non-empty trailing partial line (no terminator)
    /// is reported too — used at end-of-stream.
    pub fn parse(&mut self, input: &[u8], flush: bool, mut on_line: impl FnMut(&[u8])) -> Result<()> {
        for &ch in input {
            if self.line_buf.len() == MAX_ROW_LENGTH {
                return Err(CoreError::Csv(format!(
                    "input line {} exceeds the limit of {} bytes",
                    self.line_num, MAX_ROW_LENGTH
                )));
            }
            self.line_buf.push(ch);
            if ch == self.dialect.fields_escaped_by {
                self.in_escape_mode = !self.in_escape_mode;
            } else if ch == self.dialect.lines_terminated_by && !self.in_escape_mode {
                on_line(&self.line_buf);
                self.line_buf.clear();
                self.line_num += 1;
            } else {
                self.in_escape_mode = false;
            }
        }
        if flush && !self.line_buf.is_empty() {
            on_line(&self.line_buf);
            self.line_buf.clear();
            self.line_num += 1;
            self.in_escape_mode = false;
        }
        Ok(())
    }
}

/// Splits one raw line into fields, honoring the enclosure-at-field-start
/// rule and escape mode.
pub struct RowParser {
    dialect: Dialect,
}

impl RowParser {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn parse(&self, row: &[u8], mut on_field: impl FnMut(&[u8])) {
        if row.is_empty() {
            return;
        }
        let enclosure = self.dialect.fields_enclosed_by;
        let escape = self.dialect.fields_escaped_by;
        let terminator = self.dialect.fields_terminated_by;

        let mut in_enclosure = false;
        let mut in_escape_mode = false;
        let mut has_enclosure = false;
        let mut field_start = 0usize;

        let emit = |buf: &[u8], start: usize, end: usize, has_enclosure: bool, on_field: &mut dyn FnMut(&[u8])| {
            if has_enclosure {
                let field_len = end.saturating_sub(start);
                if field_len >= 2 {
                    on_field(&buf[start + 1..end - 1]);
                } else {
                    on_field(&[]);
                }
            } else {
                on_field(&buf[start..end]);
            }
        };

        for i in 0..row.len() {
            let ch = row[i];
            if ch == escape {
                in_escape_mode = !in_escape_mode;
            } else if ch == enclosure
                && enclosure != 0
                && !in_escape_mode
                && (i == field_start || in_enclosure)
            {
                in_enclosure = !in_enclosure;
                if i == field_start {
                    has_enclosure = true;
                }
            } else if ch == terminator && !in_enclosure && !in_escape_mode {
                emit(row, field_start, i, has_enclosure, &mut on_field);
                has_enclosure = false;
                field_start = i + 1;
            } else {
                in_escape_mode = false;
            }
        }
        if field_start != row.len() {
            emit(row, field_start, row.len(), has_enclosure, &mut on_field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_dialect() -> Dialect {
        Dialect::default()
    }

    #[test]
    fn default_dialect_matches_spec() {
        let d = default_dialect();
        assert_eq!(d.fields_terminated_by(), b'\t');
        assert_eq!(d.fields_enclosed_by(), 0);
        assert_eq!(d.fields_escaped_by(), b'\\');
        assert_eq!(d.lines_terminated_by(), b'\n');
    }

    #[test]
    fn rejects_disallowed_terminator() {
        assert!(Dialect::new(b';', 0, b'\\', b'\n').is_err());
    }

    #[test]
    fn parser_splits_on_unescaped_newline() {
        let mut p = Parser::new(default_dialect());
        let mut lines = Vec::new();
        p.parse(b"a\tb\nc\td\n", true, |l| lines.push(l.to_vec())).unwrap();
        assert_eq!(lines, vec![b"a\tb\n".to_vec(), b"c\td\n".to_vec()]);
    }

    #[test]
    fn parser_flush_reports_partial_trailing_line() {
        let mut p = Parser::new(default_dialect());
        let mut lines = Vec::new();
        p.parse(b"a\tb", true, |l| lines.push(l.to_vec())).unwrap();
        assert_eq!(lines, vec![b"a\tb".to_vec()]);
    }

    #[test]
    fn parser_escape_cancels_line_terminator() {
        let mut p = Parser::new(default_dialect());
        let mut lines = Vec::new();
        // `\\\n` — escaped newline should not split the line.
        p.parse(b"a\\\nb\n", true, |l| lines.push(l.to_vec())).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], b"a\\\nb\n".to_vec());
    }

    #[test]
    fn parser_rejects_oversize_line() {
        let mut p = Parser::new(default_dialect());
        let big = vec![b'a'; MAX_ROW_LENGTH + 1];
        let result = p.parse(&big, true, |_| {});
        assert!(result.is_err());
    }

    #[test]
    fn row_parser_splits_plain_fields() {
        let rp = RowParser::new(default_dialect());
        let mut fields = Vec::new();
        rp.parse(b"a\tb\tc", |f| fields.push(f.to_vec()));
        assert_eq!(fields, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn row_parser_strips_enclosure_at_field_start() {
        let d = Dialect::new(b'\t', b'\'', b'\\', b'\n').unwrap();
        let rp = RowParser::new(d);
        let mut fields = Vec::new();
        rp.parse(b"'hello'\t'wor\tld'", |f| fields.push(f.to_vec()));
        assert_eq!(fields, vec![b"hello".to_vec(), b"wor\tld".to_vec()]);
    }

    #[test]
    fn row_parser_quote_mid_field_is_literal() {
        // Enclosure char not at field start is just data.
        let d = Dialect::new(b'\t', b'\'', b'\\', b'\n').unwrap();
        let rp = RowParser::new(d);
        let mut fields = Vec::new();
        rp.parse(b"ab'cd\tef", |f| fields.push(f.to_vec()));
        assert_eq!(fields, vec![b"ab'cd".to_vec(), b"ef".to_vec()]);
    }

    #[test]
    fn round_trip_encode_then_parse() {
        let d = default_dialect();
        let row = d.encode_row(&[b"hello", b"world", b"123"]);
        let rp = RowParser::new(d);
        let mut fields = Vec::new();
        rp.parse(&row, |f| fields.push(f.to_vec()));
        assert_eq!(fields, vec![b"hello".to_vec(), b"world".to_vec(), b"123".to_vec()]);
    }

    #[test]
    fn encode_row_escapes_embedded_terminator_without_enclosure() {
        let d = default_dialect();
        let row = d.encode_row(&[b"a\tb", b"c"]);
        let rp = RowParser::new(d);
        let mut fields = Vec::new();
        rp.parse(&row, |f| fields.push(f.to_vec()));
        assert_eq!(fields.len(), 2, "embedded terminator must not split the field");
        assert_eq!(fields[1], b"c".to_vec());
    }

    #[test]
    fn sql_options_formats_clause() {
        let d = default_dialect();
        let opt = d.sql_options();
        assert!(opt.contains("FIELDS TERMINATED BY"));
        assert!(opt.contains("ESCAPED BY"));
        assert!(opt.contains("LINES TERMINATED BY"));
        assert!(!opt.contains("ENCLOSED BY"));
    }
}
