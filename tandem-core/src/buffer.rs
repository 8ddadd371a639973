//! Authoritative text buffer and offset-based edit operations.
//!
//! An edit operation is an ordered batch of splices. Each change record
//! replaces `range_length` units starting at `range_offset` with `text`.
//! Records are applied one after another, exactly as received; there is no
//! transform against concurrent operations.
//!
//! Offsets are counted in an [`OffsetUnit`]. Browser editors count UTF-16
//! code units, which is the default.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Unit in which change-record offsets and lengths are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetUnit {
    /// UTF-16 code units (JavaScript string indices).
    #[default]
    Utf16,
    /// Unicode scalar values.
    Char,
    /// UTF-8 bytes.
    Byte,
}

/// Errors raised while interpreting an edit payload.
#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("malformed edit operation: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One splice instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub range_offset: usize,
    #[serde(default, deserialize_with = "null_as_default")]
    pub range_length: usize,
    #[serde(default, deserialize_with = "null_as_default")]
    pub text: String,
}

impl ChangeRecord {
    pub fn new(range_offset: usize, range_length: usize, text: impl Into<String>) -> Self {
        Self {
            range_offset,
            range_length,
            text: text.into(),
        }
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::new(offset, 0, text)
    }

    pub fn delete(offset: usize, length: usize) -> Self {
        Self::new(offset, length, "")
    }
}

/// An ordered batch of change records, as sent in one `text-change` message.
///
/// Extra fields the editor attaches (version ids, EOL markers, ranges in
/// line/column form) are ignored here; the transport keeps the raw payload
/// for relaying.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EditOperation {
    pub changes: Vec<ChangeRecord>,
}

impl EditOperation {
    pub fn new(changes: Vec<ChangeRecord>) -> Self {
        Self { changes }
    }

    /// Interpret a raw `text-change` payload.
    ///
    /// Missing offsets and lengths count as zero and missing text as empty,
    /// but values of the wrong type (a string offset, a negative length)
    /// reject the whole operation.
    pub fn from_value(value: &Value) -> Result<Self, EditError> {
        Ok(Self::deserialize(value)?)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Where an offset lands inside a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// Exactly on a character boundary at this byte index.
    At(usize),
    /// Inside a character; the next boundary is at this byte index.
    Inside(usize),
    /// Beyond the end of the text.
    Past,
}

fn locate(text: &str, offset: usize, unit: OffsetUnit) -> Location {
    if offset == 0 {
        return Location::At(0);
    }
    let mut units = 0usize;
    for (idx, ch) in text.char_indices() {
        if units == offset {
            return Location::At(idx);
        }
        let width = match unit {
            OffsetUnit::Utf16 => ch.len_utf16(),
            OffsetUnit::Char => 1,
            OffsetUnit::Byte => ch.len_utf8(),
        };
        units += width;
        if units > offset {
            return Location::Inside(idx + ch.len_utf8());
        }
    }
    if units == offset {
        Location::At(text.len())
    } else {
        Location::Past
    }
}

/// Length of `text` measured in `unit`.
pub fn unit_len(text: &str, unit: OffsetUnit) -> usize {
    match unit {
        OffsetUnit::Utf16 => text.encode_utf16().count(),
        OffsetUnit::Char => text.chars().count(),
        OffsetUnit::Byte => text.len(),
    }
}

/// Replace `length` units at `offset` with `replacement`.
///
/// A start offset past the end (or inside a character) leaves `text`
/// untouched and returns `false`. An end past the buffer is clamped.
pub fn splice(
    text: &mut String,
    unit: OffsetUnit,
    offset: usize,
    length: usize,
    replacement: &str,
) -> bool {
    let start = match locate(text, offset, unit) {
        Location::At(idx) => idx,
        Location::Inside(_) | Location::Past => return false,
    };
    let end = match locate(text, offset.saturating_add(length), unit) {
        Location::At(idx) | Location::Inside(idx) => idx,
        Location::Past => text.len(),
    };
    text.replace_range(start..end, replacement);
    true
}

/// Apply every record of `op` to `text` in order. Returns how many applied.
pub fn apply_operation(text: &mut String, op: &EditOperation, unit: OffsetUnit) -> usize {
    let mut applied = 0;
    for change in &op.changes {
        if splice(text, unit, change.range_offset, change.range_length, &change.text) {
            applied += 1;
        } else {
            log::debug!(
                "Skipping change at offset {} (buffer is {} units)",
                change.range_offset,
                unit_len(text, unit)
            );
        }
    }
    applied
}

/// A single-document buffer with its offset unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextBuffer {
    text: String,
    unit: OffsetUnit,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>, unit: OffsetUnit) -> Self {
        Self {
            text: text.into(),
            unit,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    pub fn unit(&self) -> OffsetUnit {
        self.unit
    }

    /// Length in the buffer's offset unit.
    pub fn len(&self) -> usize {
        unit_len(&self.text, self.unit)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn splice(&mut self, offset: usize, length: usize, replacement: &str) -> bool {
        splice(&mut self.text, self.unit, offset, length, replacement)
    }

    pub fn apply(&mut self, op: &EditOperation) -> usize {
        apply_operation(&mut self.text, op, self.unit)
    }
}
