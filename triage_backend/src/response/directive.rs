//! Inline `[SEARCH: <query>]` directives.
//!
//! Backends without a structured tool-call channel ask for a literature
//! search by writing this directive into their plain-text reply.

use regex_lite::Regex;
use std::sync::OnceLock;

fn search_directive() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[SEARCH:([^\]\n]*)\]").ok())
        .as_ref()
}

/// Returns the trimmed query of the first non-empty search directive.
pub fn extract_directive(text: &str) -> Option<String> {
    search_directive()?
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|query| query.as_str().trim())
        .find(|query| !query.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_query_from_surrounding_text() {
        assert_eq!(
            extract_directive("foo [SEARCH: bar baz] qux").as_deref(),
            Some("bar baz")
        );
        assert_eq!(
            extract_directive("Some thought process... [SEARCH: severe chest pain] ... more text")
                .as_deref(),
            Some("severe chest pain")
        );
    }

    #[test]
    fn no_directive_yields_none() {
        assert_eq!(extract_directive("no directive here"), None);
        assert_eq!(extract_directive(""), None);
    }

    #[test]
    fn tag_is_case_sensitive() {
        assert_eq!(extract_directive("[search: lowercase]"), None);
        assert_eq!(extract_directive("[Search: mixed]"), None);
    }

    #[test]
    fn directive_must_close_on_the_same_line() {
        assert_eq!(extract_directive("[SEARCH: split\nacross lines]"), None);
    }

    #[test]
    fn skips_empty_directive_for_the_next_one() {
        assert_eq!(
            extract_directive("[SEARCH:   ] then [SEARCH: sepsis qSOFA]").as_deref(),
            Some("sepsis qSOFA")
        );
    }
}
