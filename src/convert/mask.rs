//! Per-token training masks.

use tracing::debug;

use crate::error::Result;
use crate::model::tokenizer::{ChatMessage, ChatTokenizer};

/// Mask value for positions that do not contribute to the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Build a mask aligned with `tokens` in which assistant-authored positions
/// carry their own token id and every other position is [`IGNORE_INDEX`].
///
/// Each message is re-tokenized on its own and laid end to end after the
/// shared BOS token. Where that segmentation disagrees with the full
/// sequence (merged tokens at a boundary), the disagreeing positions stay
/// ignored, so drift can drop assistant tokens but never mark system or
/// user tokens as trainable.
pub fn create_masks(
    tokens: &[u32],
    messages: &[ChatMessage],
    tokenizer: &dyn ChatTokenizer,
) -> Result<Vec<i64>> {
    let mut masks = vec![IGNORE_INDEX; tokens.len()];
    let bos = tokenizer.bos_token_id();

    let mut pos = match (bos, tokens.first()) {
        (Some(b), Some(&first)) if first == b => 1,
        _ => 0,
    };

    let mut drifted = 0usize;
    for msg in messages {
        let mut msg_tokens = tokenizer.apply_chat_template(std::slice::from_ref(msg))?;
        if let (Some(b), Some(&first)) = (bos, msg_tokens.first()) {
            if first == b {
                msg_tokens.remove(0);
            }
        }

        if msg.is_assistant() {
            for (offset, &tok) in msg_tokens.iter().enumerate() {
                let i = pos + offset;
                if i >= tokens.len() {
                    break;
                }
                if tokens[i] == tok {
                    masks[i] = tokens[i] as i64;
                } else {
                    drifted += 1;
                }
            }
        }

        pos += msg_tokens.len();
    }

    if drifted > 0 {
        debug!(drifted, total = tokens.len(), "mask segmentation drifted from full sequence");
    }
    Ok(masks)
}

/// Number of trainable positions in a mask.
pub fn trainable_count(masks: &[i64]) -> usize {
    masks.iter().filter(|&&m| m != IGNORE_INDEX).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tokenizer::testing::WordTokenizer;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You evaluate trading agents."),
            ChatMessage::user("Balance 10000. What next?"),
            ChatMessage::assistant("<thinking>trend up</thinking> buy ACME"),
        ]
    }

    #[test]
    fn test_assistant_span_trainable_with_bos() {
        let tok = WordTokenizer::with_bos();
        let msgs = conversation();
        let tokens = tok.apply_chat_template(&msgs).unwrap();
        let masks = create_masks(&tokens, &msgs, &tok).unwrap();
        assert_eq!(masks.len(), tokens.len());

        // Span lengths without the BOS token.
        let len = |m: &ChatMessage| tok.apply_chat_template(std::slice::from_ref(m)).unwrap().len() - 1;
        let system_end = 1 + len(&msgs[0]);
        let user_end = system_end + len(&msgs[1]);

        assert_eq!(masks[0], IGNORE_INDEX);
        for i in 1..user_end {
            assert_eq!(masks[i], IGNORE_INDEX, "position {i} should be ignored");
        }
        for i in user_end..tokens.len() {
            assert_eq!(masks[i], tokens[i] as i64, "position {i} should be trainable");
        }
    }

    #[test]
    fn test_without_bos() {
        let tok = WordTokenizer { bos: None };
        let msgs = conversation();
        let tokens = tok.apply_chat_template(&msgs).unwrap();
        let masks = create_masks(&tokens, &msgs, &tok).unwrap();
        let assistant_len = tok.apply_chat_template(&msgs[2..]).unwrap().len();
        assert_eq!(trainable_count(&masks), assistant_len);
        assert_eq!(masks[0], IGNORE_INDEX);
    }

    #[test]
    fn test_drift_never_marks_context() {
        let tok = WordTokenizer::with_bos();
        let msgs = conversation();
        let mut tokens = tok.apply_chat_template(&msgs).unwrap();
        // Simulate a merge that removes one token from the system span,
        // shifting everything after it left by one position.
        tokens.remove(2);
        let masks = create_masks(&tokens, &msgs, &tok).unwrap();
        assert_eq!(masks.len(), tokens.len());

        let len = |m: &ChatMessage| tok.apply_chat_template(std::slice::from_ref(m)).unwrap().len() - 1;
        let user_end = 1 + len(&msgs[0]) + len(&msgs[1]) - 1;
        for i in 0..user_end {
            assert_eq!(masks[i], IGNORE_INDEX);
        }
    }

    #[test]
    fn test_truncated_tokens_are_bounded() {
        let tok = WordTokenizer::with_bos();
        let msgs = conversation();
        let tokens = tok.apply_chat_template(&msgs).unwrap();
        let short = &tokens[..tokens.len() - 2];
        let masks = create_masks(short, &msgs, &tok).unwrap();
        assert_eq!(masks.len(), short.len());
    }
}
