//! Text normalization for exact-match grouping
//!
//! Strips a fixed punctuation set (Latin, Arabic-script and N'Ko marks),
//! collapses whitespace runs to a single space and trims the ends.

/// Punctuation removed before comparison
pub const PUNCTUATION: &[char] = &[
    // Latin
    ',', '.', ':', ';', '!', '?', '"', '\'', '(', ')', '[', ']', '{', '}',
    // Typographic quotes
    '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '\u{00AB}', '\u{00BB}',
    // Arabic-script marks used in N'Ko text
    '\u{060C}', // ARABIC COMMA
    '\u{061B}', // ARABIC SEMICOLON
    '\u{061F}', // ARABIC QUESTION MARK
    // N'Ko
    '\u{07F8}', // NKO COMMA
    '\u{07F9}', // NKO EXCLAMATION MARK
];

/// Check whether a character is in the removed punctuation set
pub fn is_punctuation(c: char) -> bool {
    PUNCTUATION.contains(&c)
}

/// Normalize text for exact-match grouping
///
/// Idempotent: `normalize(&normalize(x)) == normalize(x)`.
pub fn normalize(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| !is_punctuation(*c)).collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize optional text; `None` yields an empty string
pub fn normalize_opt(text: Option<&str>) -> String {
    text.map(normalize).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_strips_punctuation_and_whitespace() {
        assert_eq!(normalize("  ABC ,  DEF! "), "ABC DEF");
        assert_eq!(normalize("\u{201C}ߒߞߏ\u{201D}\u{07F8}"), "ߒߞߏ");
        assert_eq!(normalize("ߊ߬\t\n ߟߊ߫؟"), "ߊ߬ ߟߊ߫");
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize(" .,!? "), "");
        assert_eq!(normalize_opt(None), "");
        assert_eq!(normalize_opt(Some(" x ")), "x");
    }

    #[test]
    fn test_punctuation_between_words_joins_them() {
        assert_eq!(normalize("AB.CD"), "ABCD");
    }

    proptest! {
        #[test]
        fn prop_idempotent(text in "\\PC{0,40}") {
            let once = normalize(&text);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn prop_no_edge_or_double_whitespace(text in "[ ߊ-ߦa-c.,!?\\t]{0,30}") {
            let out = normalize(&text);
            prop_assert!(!out.starts_with(' ') && !out.ends_with(' '));
            prop_assert!(!out.contains("  "));
            prop_assert!(!out.chars().any(is_punctuation));
        }
    }
}
