//! Conversions between editor char offsets and protocol positions.
//!
//! The editor addresses text by char index into a [`Rope`]. The protocol
//! addresses it by line and a column counted in the negotiated
//! [`OffsetEncoding`]. Columns past the end of a line clamp to the line end;
//! lines past the end of the document are rejected.

use lsp_types::{Position, PositionEncodingKind, Range};
use ropey::{Rope, RopeSlice};

/// Unit the server counts columns in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OffsetEncoding {
    /// UTF-8 bytes.
    Utf8,
    /// UTF-16 code units, the protocol default.
    #[default]
    Utf16,
    /// Unicode scalar values.
    Utf32,
}

impl OffsetEncoding {
    /// Parses an LSP position encoding kind.
    pub fn from_lsp(kind: &PositionEncodingKind) -> Option<Self> {
        match kind.as_str() {
            "utf-8" => Some(Self::Utf8),
            "utf-16" => Some(Self::Utf16),
            "utf-32" => Some(Self::Utf32),
            _ => None,
        }
    }

    /// The LSP kind for this encoding.
    pub fn to_lsp(self) -> PositionEncodingKind {
        match self {
            Self::Utf8 => PositionEncodingKind::UTF8,
            Self::Utf16 => PositionEncodingKind::UTF16,
            Self::Utf32 => PositionEncodingKind::UTF32,
        }
    }
}

/// Position of `char_idx`, or `None` past the end of the text.
pub fn char_to_position(text: &Rope, char_idx: usize, encoding: OffsetEncoding) -> Option<Position> {
    if char_idx > text.len_chars() {
        return None;
    }
    let line = text.char_to_line(char_idx);
    let line_start = text.line_to_char(line);

    let column = match encoding {
        OffsetEncoding::Utf8 => text.char_to_byte(char_idx) - text.char_to_byte(line_start),
        OffsetEncoding::Utf16 => text.char_to_utf16_cu(char_idx) - text.char_to_utf16_cu(line_start),
        OffsetEncoding::Utf32 => char_idx - line_start,
    };

    Some(Position::new(
        u32::try_from(line).ok()?,
        u32::try_from(column).ok()?,
    ))
}

/// Char index of `position`, or `None` if the line does not exist.
pub fn position_to_char(text: &Rope, position: Position, encoding: OffsetEncoding) -> Option<usize> {
    let line = position.line as usize;
    if line >= text.len_lines() {
        return None;
    }
    let line_start = text.line_to_char(line);
    let slice = content_of(text.line(line));
    let column = position.character as usize;

    let offset = match encoding {
        OffsetEncoding::Utf8 => slice.byte_to_char(column.min(slice.len_bytes())),
        OffsetEncoding::Utf16 => slice.utf16_cu_to_char(column.min(slice.len_utf16_cu())),
        OffsetEncoding::Utf32 => column.min(slice.len_chars()),
    };
    Some(line_start + offset)
}

/// Protocol range of the chars `start..end`.
pub fn chars_to_range(
    text: &Rope,
    start: usize,
    end: usize,
    encoding: OffsetEncoding,
) -> Option<Range> {
    Some(Range::new(
        char_to_position(text, start, encoding)?,
        char_to_position(text, end, encoding)?,
    ))
}

/// Char span of a protocol range. A reversed range is normalized.
pub fn range_to_chars(text: &Rope, range: Range, encoding: OffsetEncoding) -> Option<(usize, usize)> {
    let start = position_to_char(text, range.start, encoding)?;
    let end = position_to_char(text, range.end, encoding)?;
    Some((start.min(end), start.max(end)))
}

fn content_of(line: RopeSlice<'_>) -> RopeSlice<'_> {
    let len = line.len_chars();
    let trailing = if len >= 2 && line.char(len - 2) == '\r' && line.char(len - 1) == '\n' {
        2
    } else if len >= 1 && matches!(line.char(len - 1), '\n' | '\r') {
        1
    } else {
        0
    };
    line.slice(..len - trailing)
}
