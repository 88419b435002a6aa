//! Streaming sinks for `generate()`.
//!
//! Callers either provide no streamer, an object implementing
//! [`StreamerBase`], or a plain text callback. The callback case is wrapped
//! in [`TextCallbackStreamer`], which buffers tokens until the detokenizer
//! produces stable text (an incomplete multi-byte sequence decodes to a
//! replacement character and is held back).

use std::sync::Arc;

use crate::sequence::TokenId;
use crate::tokenizer::Tokenizer;

/// Token sink driven once per generated token.
pub trait StreamerBase {
    /// Returns `true` to stop generation.
    fn put(&mut self, token_id: TokenId) -> bool;

    /// Flush any buffered output once generation ends.
    fn end(&mut self) {}
}

/// The streamer styles `generate()` accepts.
pub enum Streamer {
    None,
    Object(Box<dyn StreamerBase>),
    Callback(Box<dyn FnMut(String) -> bool>),
}

impl Streamer {
    pub(crate) fn into_sink(self, tokenizer: Arc<dyn Tokenizer>) -> Option<Box<dyn StreamerBase>> {
        match self {
            Streamer::None => None,
            Streamer::Object(streamer) => Some(streamer),
            Streamer::Callback(callback) => {
                Some(Box::new(TextCallbackStreamer::new(tokenizer, callback)))
            }
        }
    }
}

/// Adapts a text callback into a token streamer, emitting only finished
/// text deltas.
pub struct TextCallbackStreamer {
    tokenizer: Arc<dyn Tokenizer>,
    callback: Box<dyn FnMut(String) -> bool>,
    tokens_cache: Vec<TokenId>,
    printed_len: usize,
}

impl TextCallbackStreamer {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, callback: Box<dyn FnMut(String) -> bool>) -> Self {
        Self {
            tokenizer,
            callback,
            tokens_cache: Vec::new(),
            printed_len: 0,
        }
    }
}

impl StreamerBase for TextCallbackStreamer {
    fn put(&mut self, token_id: TokenId) -> bool {
        self.tokens_cache.push(token_id);
        let text = self.tokenizer.decode(&self.tokens_cache);
        if text.ends_with('\u{FFFD}') {
            // mid-codepoint; wait for the next token
            return false;
        }
        if text.len() <= self.printed_len {
            return false;
        }
        let delta = text[self.printed_len..].to_string();
        self.printed_len = text.len();
        (self.callback)(delta)
    }

    fn end(&mut self) {
        let text = self.tokenizer.decode(&self.tokens_cache);
        if text.len() > self.printed_len {
            let delta = text[self.printed_len..].to_string();
            self.printed_len = text.len();
            let _ = (self.callback)(delta);
        }
    }
}
