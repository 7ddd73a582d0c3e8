//! facecull-inference — Client for the remote vision-language model.
//!
//! Speaks the Ollama-style HTTP contract: `POST {base}{generate_path}` for
//! generation and `GET {base}/api/tags` for model discovery.

pub mod client;
pub mod models;

pub use client::{GenerationOptions, InferenceClient, InferenceError, OllamaClient};
pub use models::{default_vision_model, ModelInfo};
