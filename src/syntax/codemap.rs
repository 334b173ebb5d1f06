//! A line table for template source text, heavily adapted from
//! [codemap](https://crates.io/codemap).
//!
//! Tokens and nodes carry 1-indexed line numbers directly; this map exists
//! to recover the offending source line when an error is rendered.

/// A record of a template source's lines.
#[derive(Clone)]
pub(crate) struct FileMap<'a> {
    /// The source text.
    source: &'a str,

    /// Byte positions of line beginnings.
    lines: Vec<u32>,
}

impl core::fmt::Debug for FileMap<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut limit = 100.min(self.source.len());
        while !self.source.is_char_boundary(limit) {
            limit += 1;
        }

        f.debug_struct("FileMap")
            .field(
                "source",
                &format!(
                    "{}{}",
                    &self.source[..limit],
                    if self.source.len() > limit { "…" } else { "" }
                ),
            )
            .finish()
    }
}

impl<'a> FileMap<'a> {
    /// Creates a new file map over the given source.
    pub fn new(source: &'a str) -> Self {
        let lines = core::iter::once(0)
            .chain(
                source
                    .match_indices('\n')
                    .map(|(p, _)| u32::try_from(p + 1).unwrap()),
            )
            .collect();

        Self { source, lines }
    }

    /// Gets the text of a 1-indexed line, without its terminator.
    pub fn line_text(&self, line: u32) -> Option<&'a str> {
        let index = usize::try_from(line).unwrap().checked_sub(1)?;
        let start = usize::try_from(*self.lines.get(index)?).unwrap();
        let end = self
            .lines
            .get(index + 1)
            .map_or(self.source.len(), |end| usize::try_from(*end).unwrap());
        Some(self.source[start..end].trim_end_matches(['\r', '\n']))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_lookup() {
        let map = FileMap::new("ab\ncd\n\nxyz");
        assert_eq!(map.line_text(1), Some("ab"));
        assert_eq!(map.line_text(2), Some("cd"));
        assert_eq!(map.line_text(3), Some(""));
        assert_eq!(map.line_text(4), Some("xyz"));
        assert_eq!(map.line_text(5), None);
        assert_eq!(map.line_text(0), None);
    }

    #[test]
    fn crlf_terminators_are_stripped() {
        let map = FileMap::new("one\r\ntwo\r\n");
        assert_eq!(map.line_text(1), Some("one"));
        assert_eq!(map.line_text(2), Some("two"));
    }
}
