//! Text Buffer
//!
//! Plain text addressed by character offsets.

use crate::document::DocumentError;

/// A string edited by character offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
    chars: usize,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    /// Replace the whole text.
    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.chars = self.text.chars().count();
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.chars = 0;
    }

    /// Insert `text` before character `offset`.
    pub fn insert(&mut self, offset: usize, text: &str) -> Result<(), DocumentError> {
        self.check(offset, 0)?;
        let at = self.byte_index(offset);
        self.text.insert_str(at, text);
        self.chars += text.chars().count();
        Ok(())
    }

    /// Remove `length` characters starting at `offset`.
    pub fn delete(&mut self, offset: usize, length: usize) -> Result<(), DocumentError> {
        self.check(offset, length)?;
        let start = self.byte_index(offset);
        let end = self.byte_index(offset + length);
        self.text.replace_range(start..end, "");
        self.chars -= length;
        Ok(())
    }

    /// Remove `length` characters at `offset`, then insert `text` there.
    ///
    /// Nothing changes when the range is out of bounds.
    pub fn splice(&mut self, offset: usize, length: usize, text: &str) -> Result<(), DocumentError> {
        self.check(offset, length)?;
        self.delete(offset, length)?;
        self.insert(offset, text)
    }

    fn check(&self, offset: usize, length: usize) -> Result<(), DocumentError> {
        match offset.checked_add(length) {
            Some(end) if end <= self.chars => Ok(()),
            _ => Err(DocumentError::OutOfRange {
                offset,
                length,
                len: self.chars,
            }),
        }
    }

    fn byte_index(&self, offset: usize) -> usize {
        self.text
            .char_indices()
            .nth(offset)
            .map_or(self.text.len(), |(index, _)| index)
    }
}

impl std::fmt::Display for TextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}
