//! Chat tokenization.
//!
//! [`ChatTokenizer`] is the capability the converter and mask builder depend
//! on. The production implementation wraps a HuggingFace `tokenizer.json`
//! and renders conversations with the ChatML template; tests use a small
//! deterministic word-level tokenizer.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}

/// Render messages with the ChatML template.
///
/// Each message becomes `<|im_start|>{role}\n{content}<|im_end|>\n`, so a
/// conversation renders to exactly the concatenation of its messages.
pub fn format_chatml(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut formatted: String = messages
        .iter()
        .map(|msg| format!("<|im_start|>{}\n{}<|im_end|>\n", msg.role, msg.content))
        .collect();
    if add_generation_prompt {
        formatted.push_str("<|im_start|>assistant\n");
    }
    formatted
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

pub trait ChatTokenizer {
    /// Tokenize a conversation, including the leading BOS token when the
    /// tokenizer uses one.
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<Vec<u32>>;

    /// The BOS token prepended by [`apply_chat_template`](Self::apply_chat_template).
    fn bos_token_id(&self) -> Option<u32>;

    /// Number of distinct token ids the tokenizer can produce.
    fn vocab_size(&self) -> usize;
}

// ---------------------------------------------------------------------------
// HuggingFace tokenizer
// ---------------------------------------------------------------------------

/// Tokens tried, in order, when looking for a BOS token.
const BOS_CANDIDATES: &[&str] = &["<s>", "<|begin_of_text|>", "<bos>", "<|startoftext|>"];

pub struct HfChatTokenizer {
    tokenizer: Tokenizer,
    bos_token_id: Option<u32>,
}

impl HfChatTokenizer {
    /// Load a `tokenizer.json`. With `add_bos`, the first known BOS token
    /// present in the vocabulary is prepended to every encoding.
    pub fn from_file(path: impl AsRef<Path>, add_bos: bool) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| Error::Tokenizer(format!("failed to load {}: {e}", path.display())))?;

        let bos_token_id = if add_bos {
            BOS_CANDIDATES
                .iter()
                .find_map(|token| tokenizer.token_to_id(token))
        } else {
            None
        };

        info!(
            path = %path.display(),
            vocab_size = tokenizer.get_vocab_size(true),
            bos = ?bos_token_id,
            "loaded tokenizer"
        );
        Ok(Self {
            tokenizer,
            bos_token_id,
        })
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl ChatTokenizer for HfChatTokenizer {
    fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<Vec<u32>> {
        let formatted = format_chatml(messages, false);
        let ids = self.encode(&formatted)?;
        debug!(messages = messages.len(), tokens = ids.len(), "applied chat template");

        Ok(match self.bos_token_id {
            Some(bos) => std::iter::once(bos).chain(ids).collect(),
            None => ids,
        })
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

// ---------------------------------------------------------------------------
// Test tokenizer
// ---------------------------------------------------------------------------
