mod bpe;

/// Maximum number of tokens an input text may count before it is rejected.
/// The limit is inclusive: an input counting exactly this many tokens is
/// still accepted.
pub const MAX_INPUT_TOKENS: usize = 1200;

/// Estimates how many sub-word tokens a text occupies under a fixed
/// byte-level byte-pair encoding.
///
/// The estimator is independent of whatever tokenizer the inference backend
/// uses internally: it counts against a fixed embedded merge table, so budget
/// decisions do not change when the model does. Counting is pure and performs
/// no I/O.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudgetEstimator;

impl TokenBudgetEstimator {
    /// Creates a new estimator over the embedded encoding tables.
    pub fn new() -> Self {
        Self
    }

    /// Counts the tokens in a text.
    ///
    /// The text is split into pieces with the encoding's splitting pattern,
    /// each piece is resolved through the merge table, and the per-piece
    /// symbol counts are summed. An empty text counts zero.
    ///
    /// # Arguments
    ///
    /// * `text` - The text to count
    ///
    /// # Returns
    ///
    /// The number of tokens the text occupies
    pub fn count(&self, text: &str) -> usize {
        bpe::PATTERN
            .find_iter(text)
            .map(|piece| bpe::symbol_count(piece.as_str()))
            .sum()
    }

    /// Counts tokens in raw bytes that may not be valid UTF-8.
    ///
    /// Valid stretches are counted normally; each malformed unit in between
    /// counts as a single token.
    pub fn count_bytes(&self, bytes: &[u8]) -> usize {
        let mut total = 0usize;
        let mut rest = bytes;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    total += self.count(valid);
                    return total;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&rest[..valid_len]) {
                        total += self.count(valid);
                    }
                    // One token per malformed unit; a truncated trailing
                    // sequence consumes the remainder
                    total += 1;
                    let bad_len = err.error_len().unwrap_or(rest.len() - valid_len);
                    rest = &rest[valid_len + bad_len..];
                }
            }
        }
    }

    /// Returns true when the text fits within the inclusive input budget.
    pub fn fits_budget(&self, text: &str) -> bool {
        self.count(text) <= MAX_INPUT_TOKENS
    }
}

impl Default for TokenBudgetEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_counts_zero() {
        let estimator = TokenBudgetEstimator::new();
        assert_eq!(estimator.count(""), 0);
    }

    #[test]
    fn common_words_merge_to_single_tokens() {
        let estimator = TokenBudgetEstimator::new();
        // "the" carries a full merge chain, with and without a leading space
        assert_eq!(estimator.count("the"), 1);
        assert_eq!(estimator.count(" the the the"), 3);
    }

    #[test]
    fn unmerged_letters_count_per_symbol() {
        let estimator = TokenBudgetEstimator::new();
        // the table has no rule involving the letter x
        assert_eq!(estimator.count("x"), 1);
        assert_eq!(estimator.count("xx"), 2);
        assert_eq!(estimator.count(" x"), 2);
    }

    #[test]
    fn whitespace_counts_as_tokens() {
        let estimator = TokenBudgetEstimator::new();
        assert_eq!(estimator.count(" "), 1);
    }

    #[test]
    fn english_counts_below_character_length() {
        let estimator = TokenBudgetEstimator::new();
        let text = "the cat sat on the mat";
        assert!(estimator.count(text) < text.chars().count());
    }

    #[test]
    fn budget_boundary_is_inclusive() {
        let estimator = TokenBudgetEstimator::new();
        // "xx" costs 2 tokens, each further " x" costs 2: 2 + 599 * 2 = 1200
        let mut text = String::from("xx");
        for _ in 0..599 {
            text.push_str(" x");
        }
        assert_eq!(estimator.count(&text), MAX_INPUT_TOKENS);
        assert!(estimator.fits_budget(&text));

        // growing the final word by one letter tips the count to 1201
        text.push('x');
        assert_eq!(estimator.count(&text), MAX_INPUT_TOKENS + 1);
        assert!(!estimator.fits_budget(&text));
    }

    #[test]
    fn malformed_bytes_count_one_each() {
        let estimator = TokenBudgetEstimator::new();
        // two standalone invalid bytes after a valid prefix
        assert_eq!(estimator.count_bytes(b"ab\xff\xfe"), estimator.count("ab") + 2);
        // a truncated multi-byte sequence counts once
        assert_eq!(estimator.count_bytes(b"the\xe2\x82"), estimator.count("the") + 1);
        // fully valid bytes match the text count
        assert_eq!(estimator.count_bytes("the".as_bytes()), estimator.count("the"));
    }
}
