//! Model-side collaborators.
//!
//! - [`tokenizer`] -- chat tokenization capability and its HuggingFace
//!   implementation.
//! - [`policy`] -- the small candle language model trained by default.
//! - [`api`] -- inference server client (health, completions).
//! - [`coordinator`] -- coordination service client (register, batches,
//!   scored data).

pub mod api;
pub mod coordinator;
pub mod policy;
pub mod tokenizer;

pub use api::InferenceClient;
pub use coordinator::{CoordinatorClient, Registration, ScoredData};
pub use policy::{PolicyConfig, TinyPolicy};
pub use tokenizer::{format_chatml, ChatMessage, ChatTokenizer, HfChatTokenizer};
