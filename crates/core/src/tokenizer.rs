//! The tokenizer contract.
//!
//! Tokenization rules live outside this crate; the pipeline only needs
//! encode/decode plus the special-token ids. The speculative coordinator
//! additionally probes whether two tokenizers are interchangeable so it can
//! skip the decode-then-encode realignment between draft and main models.

use crate::sequence::TokenId;

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;
    fn decode(&self, ids: &[TokenId]) -> String;
    fn eos_token_id(&self) -> TokenId;
    fn bos_token_id(&self) -> Option<TokenId> {
        None
    }
    fn pad_token_id(&self) -> Option<TokenId> {
        None
    }
}

/// Probe string for tokenizer equivalence checks.
const PROBE_TEXT: &str = "Could you please tell me something about continuous batching?";

/// Two tokenizers are treated as interchangeable when their special tokens
/// agree and a fixed probe string encodes identically through both.
pub fn tokenizers_match(lhs: &dyn Tokenizer, rhs: &dyn Tokenizer) -> bool {
    lhs.eos_token_id() == rhs.eos_token_id()
        && lhs.bos_token_id() == rhs.bos_token_id()
        && lhs.pad_token_id() == rhs.pad_token_id()
        && lhs.encode(PROBE_TEXT) == rhs.encode(PROBE_TEXT)
}
