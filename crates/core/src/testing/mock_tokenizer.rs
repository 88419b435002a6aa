use crate::sequence::TokenId;
use crate::tokenizer::Tokenizer;

/// Whitespace-separated-number tokenizer: `"1 2 3"` ↔ `[1, 2, 3]`.
///
/// An `offset` shifts the id space, producing a tokenizer that is
/// deliberately *not* interchangeable with the unshifted one (for
/// retokenization paths).
pub struct MockTokenizer {
    eos: TokenId,
    offset: u32,
}

impl MockTokenizer {
    pub fn new(eos: TokenId) -> Self {
        Self { eos, offset: 0 }
    }

    pub fn with_offset(eos: TokenId, offset: u32) -> Self {
        Self { eos, offset }
    }
}

impl Tokenizer for MockTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        text.split_whitespace()
            .filter_map(|t| t.parse::<u32>().ok())
            .map(|t| t + self.offset)
            .collect()
    }

    fn decode(&self, ids: &[TokenId]) -> String {
        ids.iter()
            .map(|&id| (id - self.offset).to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn eos_token_id(&self) -> TokenId {
        self.eos
    }

    fn bos_token_id(&self) -> Option<TokenId> {
        Some(self.offset + 1)
    }
}
