//! Telegram client using teloxide.
//!
//! All outbound primitives the delivery queue and resolver need are behind
//! the [`Outbound`] trait so they can be faked in tests.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use teloxide::RequestError;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, InputFile, MessageId, ReplyParameters};
use tracing::{info, warn};

/// Failure modes of an outbound send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The platform asked us to wait this many seconds before retrying.
    RateLimited(u64),
    /// Anything else; not worth retrying.
    Other(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited(secs) => write!(f, "rate limited, retry after {secs}s"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SendError {}

fn map_request_error(e: RequestError) -> SendError {
    match e {
        RequestError::RetryAfter(secs) => SendError::RateLimited(secs.seconds() as u64),
        other => SendError::Other(other.to_string()),
    }
}

/// Outbound messaging primitives.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), SendError>;

    async fn send_photo_path(
        &self,
        chat_id: i64,
        path: &Path,
        reply_to: Option<i64>,
    ) -> Result<(), SendError>;

    async fn send_photo_url(
        &self,
        chat_id: i64,
        url: &str,
        reply_to: Option<i64>,
    ) -> Result<(), SendError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), SendError>;

    async fn send_typing(&self, chat_id: i64) -> Result<(), SendError>;

    /// Best-effort notification to the operator. Must never fail the caller.
    async fn notify_operator(&self, text: &str);
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
    operator_chat: i64,
}

impl TelegramClient {
    pub fn new(bot: Bot, operator_chat: i64) -> Self {
        Self { bot, operator_chat }
    }

    /// Download a file by id to `dest`. Used for inbound media.
    pub async fn download_media(&self, file_id: FileId, dest: &Path) -> Result<PathBuf, String> {
        let file = self
            .bot
            .get_file(file_id)
            .await
            .map_err(|e| format!("Failed to get file info: {e}"))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| format!("Failed to download file: {e}"))?;

        tokio::fs::write(dest, &data)
            .await
            .map_err(|e| format!("Failed to write {dest:?}: {e}"))?;

        info!("Downloaded media to {:?} ({} bytes)", dest, data.len());
        Ok(dest.to_path_buf())
    }
}

#[async_trait]
impl Outbound for TelegramClient {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), SendError> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if let Some(msg_id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id as i32)));
        }
        request.await.map(|_| ()).map_err(map_request_error)
    }

    async fn send_photo_path(
        &self,
        chat_id: i64,
        path: &Path,
        reply_to: Option<i64>,
    ) -> Result<(), SendError> {
        info!("Sending photo {:?} to chat {}", path, chat_id);
        let mut request = self
            .bot
            .send_photo(ChatId(chat_id), InputFile::file(path.to_path_buf()));
        if let Some(msg_id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id as i32)));
        }
        request.await.map(|_| ()).map_err(map_request_error)
    }

    async fn send_photo_url(
        &self,
        chat_id: i64,
        url: &str,
        reply_to: Option<i64>,
    ) -> Result<(), SendError> {
        let url = reqwest::Url::parse(url).map_err(|e| SendError::Other(format!("bad url: {e}")))?;
        let mut request = self.bot.send_photo(ChatId(chat_id), InputFile::url(url));
        if let Some(msg_id) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(MessageId(msg_id as i32)));
        }
        request.await.map(|_| ()).map_err(map_request_error)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), SendError> {
        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id as i32))
            .await
            .map(|_| ())
            .map_err(map_request_error)
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), SendError> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
            .map(|_| ())
            .map_err(map_request_error)
    }

    async fn notify_operator(&self, text: &str) {
        if let Err(e) = self
            .bot
            .send_message(ChatId(self.operator_chat), text)
            .await
        {
            warn!("Failed to notify operator: {e}");
        }
    }
}
