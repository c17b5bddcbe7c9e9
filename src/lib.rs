//! gweb - auto-replies to Telegram private messages via the Gemini web app.

pub mod config;
pub mod relay;
pub mod transcribe;
