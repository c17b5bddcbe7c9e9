//! The auto-reply relay: debounced inbound buffering, session resolution
//! against the Gemini web app, and serialized outbound delivery.

pub mod buffer;
pub mod engine;
pub mod gemini;
pub mod queue;
pub mod resolver;
pub mod settings;
pub mod store;
pub mod telegram;
