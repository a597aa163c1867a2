use std::collections::BTreeMap;

use aho_corasick::{AhoCorasick, MatchKind};

/// Compiled placeholder → real-value substitution.
///
/// Placeholders are long random strings, so overlap between patterns is
/// effectively impossible; leftmost-longest matching plus the table's
/// sorted iteration order makes replacement deterministic.
#[derive(Debug)]
pub struct SwapTable {
    matcher: Option<AhoCorasick>,
    replacements: Vec<Vec<u8>>,
    len: usize,
}

impl SwapTable {
    /// Compile a swap table from `{placeholder: real_value}`.
    pub fn new(table: &BTreeMap<String, String>) -> Self {
        if table.is_empty() {
            return Self {
                matcher: None,
                replacements: Vec::new(),
                len: 0,
            };
        }
        let patterns: Vec<&str> = table.keys().map(String::as_str).collect();
        let replacements: Vec<Vec<u8>> =
            table.values().map(|v| v.as_bytes().to_vec()).collect();
        let matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .build(&patterns)
            .expect("placeholder patterns are valid");
        Self {
            matcher: Some(matcher),
            replacements,
            len: table.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace every placeholder occurrence in a byte buffer with the
    /// corresponding real value.
    pub fn swap_bytes(&self, data: &[u8]) -> Vec<u8> {
        match &self.matcher {
            Some(matcher) => matcher.replace_all_bytes(data, &self.replacements),
            None => data.to_vec(),
        }
    }

    /// String variant, for header values.
    pub fn swap_str(&self, s: &str) -> String {
        match &self.matcher {
            Some(matcher) => {
                let replacements: Vec<String> = self
                    .replacements
                    .iter()
                    .map(|r| String::from_utf8_lossy(r).into_owned())
                    .collect();
                matcher.replace_all(s, &replacements)
            }
            None => s.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, &str)]) -> SwapTable {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SwapTable::new(&map)
    }

    #[test]
    fn test_swaps_every_occurrence_in_place() {
        let swap = table(&[("ftl_shadow_key_0011223344556677", "sk_live_real")]);
        let input = b"Bearer ftl_shadow_key_0011223344556677 and ftl_shadow_key_0011223344556677";
        let output = swap.swap_bytes(input);
        assert_eq!(
            output,
            b"Bearer sk_live_real and sk_live_real".to_vec()
        );
    }

    #[test]
    fn test_no_placeholder_survives() {
        let swap = table(&[
            ("ftl_shadow_a_aaaaaaaaaaaaaaaa", "real-a"),
            ("ftl_shadow_b_bbbbbbbbbbbbbbbb", "real-b"),
        ]);
        let input = b"x=ftl_shadow_a_aaaaaaaaaaaaaaaa&y=ftl_shadow_b_bbbbbbbbbbbbbbbb";
        let output = swap.swap_bytes(input);
        let text = String::from_utf8(output).unwrap();
        assert!(!text.contains("ftl_shadow_"));
        assert!(text.contains("real-a"));
        assert!(text.contains("real-b"));
    }

    #[test]
    fn test_binary_payload_untouched_around_match() {
        let swap = table(&[("ftl_shadow_k_0000000000000000", "R")]);
        let mut input = vec![0u8, 1, 2, 255];
        input.extend_from_slice(b"ftl_shadow_k_0000000000000000");
        input.extend_from_slice(&[254, 253]);
        let output = swap.swap_bytes(&input);
        assert_eq!(output, [&[0u8, 1, 2, 255][..], b"R", &[254, 253]].concat());
    }

    #[test]
    fn test_empty_table_is_identity() {
        let swap = table(&[]);
        assert!(swap.is_empty());
        assert_eq!(swap.swap_bytes(b"anything"), b"anything".to_vec());
        assert_eq!(swap.swap_str("anything"), "anything");
    }

    #[test]
    fn test_str_variant() {
        let swap = table(&[("ftl_shadow_tok_1234123412341234", "secret-value")]);
        assert_eq!(
            swap.swap_str("Bearer ftl_shadow_tok_1234123412341234"),
            "Bearer secret-value"
        );
    }

    #[test]
    fn test_value_longer_and_shorter_than_placeholder() {
        let swap = table(&[
            ("ftl_shadow_long_aaaaaaaaaaaaaaaa", "x"),
            ("ftl_shadow_shrt_bbbbbbbbbbbbbbbb", "a-much-longer-replacement-value"),
        ]);
        let output = swap.swap_bytes(
            b"ftl_shadow_long_aaaaaaaaaaaaaaaa|ftl_shadow_shrt_bbbbbbbbbbbbbbbb",
        );
        assert_eq!(output, b"x|a-much-longer-replacement-value".to_vec());
    }
}
