//! Unicode identifier classification.
//!
//! Identifiers follow the default Unicode identifier syntax: a start
//! character followed by continue characters. Classification is backed by
//! the precomputed general-category tables so results do not drift with the
//! host's Unicode data.

use unicode_general_category::{GeneralCategory, get_general_category};

/// True if `c` may start an identifier.
pub(crate) fn is_ident_start(c: char) -> bool {
    if c.is_ascii() {
        return c == '_' || c.is_ascii_alphabetic();
    }
    matches!(
        get_general_category(c),
        GeneralCategory::UppercaseLetter
            | GeneralCategory::LowercaseLetter
            | GeneralCategory::TitlecaseLetter
            | GeneralCategory::ModifierLetter
            | GeneralCategory::OtherLetter
            | GeneralCategory::LetterNumber
    )
}

/// True if `c` may continue an identifier.
pub(crate) fn is_ident_continue(c: char) -> bool {
    if c.is_ascii() {
        return c == '_' || c.is_ascii_alphanumeric();
    }
    is_ident_start(c)
        || matches!(
            get_general_category(c),
            GeneralCategory::NonspacingMark
                | GeneralCategory::SpacingMark
                | GeneralCategory::DecimalNumber
                | GeneralCategory::ConnectorPunctuation
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_identifiers() {
        assert!(is_ident_start('a'));
        assert!(is_ident_start('_'));
        assert!(!is_ident_start('1'));
        assert!(is_ident_continue('1'));
        assert!(!is_ident_continue('-'));
    }

    #[test]
    fn unicode_identifiers() {
        assert!(is_ident_start('ß'));
        assert!(is_ident_start('λ'));
        assert!(is_ident_start('汉'));
        assert!(is_ident_continue('٣'));
        assert!(!is_ident_start('٣'));
        assert!(!is_ident_start('€'));
    }
}
