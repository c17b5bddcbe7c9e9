//! Inbound message handling: owner commands, reply gating, media download,
//! and debounced hand-off to the session resolver.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use teloxide::types::{ChatKind, FileId, Message};
use tracing::{error, info};

use crate::relay::buffer::DebounceBuffer;
use crate::relay::gemini::Upstream;
use crate::relay::queue::{DeliveryQueue, DeliveryTask, Outgoing};
use crate::relay::resolver::{ResolvedPrompt, SessionResolver};
use crate::relay::settings::Settings;
use crate::relay::telegram::{Outbound, TelegramClient};
use crate::transcribe::Transcriber;

/// Canned reactions for stickers and animations.
const SMILEYS: [&str; 6] = ["-.-", "):", ":)", "*.*", ")*", ";)"];

/// One buffered inbound message.
#[derive(Debug, Clone)]
pub struct InboundItem {
    pub message_id: i64,
    pub kind: InboundKind,
}

#[derive(Debug, Clone)]
pub enum InboundKind {
    Text(String),
    Attachment {
        path: PathBuf,
        caption: Option<String>,
    },
}

pub struct Engine {
    owner_id: i64,
    client: Arc<TelegramClient>,
    outbound: Arc<dyn Outbound>,
    upstream: Arc<dyn Upstream>,
    settings: Settings,
    queue: Arc<DeliveryQueue>,
    transcriber: Option<Arc<Transcriber>>,
    buffer: DebounceBuffer<InboundItem>,
    smileys: DebounceBuffer<i64>,
    temp_dir: PathBuf,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner_id: i64,
        client: Arc<TelegramClient>,
        outbound: Arc<dyn Outbound>,
        upstream: Arc<dyn Upstream>,
        settings: Settings,
        queue: Arc<DeliveryQueue>,
        transcriber: Option<Arc<Transcriber>>,
        quiet_window: Duration,
        temp_dir: PathBuf,
    ) -> Arc<Self> {
        let resolver = Arc::new(SessionResolver::new(
            upstream.clone(),
            settings.clone(),
            queue.clone(),
            outbound.clone(),
        ));

        let buffer = {
            let resolver = resolver.clone();
            DebounceBuffer::new(quiet_window, move |user_id, items| {
                let resolver = resolver.clone();
                let prompt = combine(user_id, items);
                tokio::spawn(async move {
                    resolver.resolve(prompt).await;
                });
            })
        };

        let smileys = {
            let queue = queue.clone();
            DebounceBuffer::new(quiet_window, move |user_id, ids: Vec<i64>| {
                if let Some(&last) = ids.last() {
                    queue.enqueue(DeliveryTask::new(Outgoing::Text {
                        chat_id: user_id,
                        text: smiley_for(user_id, last).to_string(),
                        reply_to: Some(last),
                    }));
                }
            })
        };

        Arc::new(Self {
            owner_id,
            client,
            outbound,
            upstream,
            settings,
            queue,
            transcriber,
            buffer,
            smileys,
            temp_dir,
        })
    }

    /// Entry point for the dispatcher. Nothing escapes; failures go to the
    /// operator chat.
    pub async fn handle_message(&self, msg: Message) {
        if let Err(e) = self.process(msg).await {
            error!("Handler error: {e}");
            self.outbound
                .notify_operator(&format!("Handler error: {e}"))
                .await;
        }
    }

    async fn process(&self, msg: Message) -> Result<(), String> {
        if !matches!(msg.chat.kind, ChatKind::Private(_)) {
            return Ok(());
        }
        let Some(user) = msg.from.as_ref() else {
            return Ok(());
        };
        let user_id = user.id.0 as i64;
        let message_id = i64::from(msg.id.0);

        if user_id == self.owner_id
            && let Some(text) = msg.text()
            && text.starts_with('/')
        {
            return self.handle_command(&msg, text).await;
        }

        // Re-read toggles on every message.
        let snapshot = self.settings.snapshot();
        if !snapshot.should_reply(user_id) {
            return Ok(());
        }

        if msg.sticker().is_some() || msg.animation().is_some() {
            self.smileys.submit(user_id, message_id).await;
            return Ok(());
        }

        let mut items = Vec::new();
        if let Some(text) = msg.text() {
            items.push(InboundItem {
                message_id,
                kind: InboundKind::Text(text.to_string()),
            });
        }
        if let Some((file_id, ext)) = media_file(&msg) {
            let path = self
                .temp_dir
                .join(format!("gweb_{user_id}_{message_id}.{ext}"));
            self.client.download_media(file_id, &path).await?;
            items.push(InboundItem {
                message_id,
                kind: InboundKind::Attachment {
                    path,
                    caption: msg.caption().map(str::to_string),
                },
            });
        }
        // Media in the quoted message rides along with the prompt.
        if let Some(parent) = msg.reply_to_message()
            && let Some((file_id, ext)) = media_file(parent)
        {
            let path = self
                .temp_dir
                .join(format!("gweb_{user_id}_{message_id}_q.{ext}"));
            self.client.download_media(file_id, &path).await?;
            items.push(InboundItem {
                message_id,
                kind: InboundKind::Attachment {
                    path,
                    caption: parent.caption().map(str::to_string),
                },
            });
        }

        if items.is_empty() {
            return Ok(());
        }
        for item in items {
            self.buffer.submit(user_id, item).await;
        }
        Ok(())
    }

    async fn handle_command(&self, msg: &Message, text: &str) -> Result<(), String> {
        let message_id = i64::from(msg.id.0);
        info!("Owner command: {text}");

        let response = match parse_command(text) {
            None => USAGE.to_string(),
            Some(Command::Transcribe) => self.transcribe_replied(msg).await,
            Some(Command::PersonaList) => match self.upstream.list_personas().await {
                Ok(personas) if personas.is_empty() => "No personas available.".to_string(),
                Ok(personas) => personas
                    .iter()
                    .map(|p| format!("{} - {}", p.id, p.name))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("Failed to list personas: {e}"),
            },
            Some(cmd) => settings_command_response(&self.settings, &cmd),
        };

        self.queue.enqueue(DeliveryTask::new(Outgoing::Text {
            chat_id: self.owner_id,
            text: response,
            reply_to: None,
        }));
        // Keep the owner chat tidy.
        self.queue.enqueue(DeliveryTask::new(Outgoing::Delete {
            chat_id: self.owner_id,
            message_id,
        }));
        Ok(())
    }

    /// Transcribe the voice or audio message the command replies to.
    async fn transcribe_replied(&self, msg: &Message) -> String {
        let Some(transcriber) = self.transcriber.as_ref() else {
            return "No transcription provider configured.".to_string();
        };
        let Some(parent) = msg.reply_to_message() else {
            return "Reply to a voice or audio message with /ts.".to_string();
        };
        let Some((file_id, ext)) = audio_file(parent) else {
            return "The replied message has no voice or audio.".to_string();
        };

        let path = self
            .temp_dir
            .join(format!("gweb_ts_{}.{ext}", i64::from(parent.id.0)));
        let result = match self.client.download_media(file_id, &path).await {
            Ok(_) => match transcriber.transcribe(&path).await {
                Ok(text) if text.trim().is_empty() => "(no speech detected)".to_string(),
                Ok(text) => text,
                Err(e) => format!("Transcription failed: {e}"),
            },
            Err(e) => format!("Download failed: {e}"),
        };
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!("Failed to remove temp file {:?}: {e}", path);
        }
        result
    }
}

const USAGE: &str = "Commands:\n\
/gweb on <user_id>\n\
/gweb off <user_id>\n\
/gweb del <user_id>\n\
/gweb all\n\
/gweb status\n\
/persona list\n\
/persona default <gem_id|clear>\n\
/persona user <user_id> <gem_id|clear>\n\
/ts (reply to a voice or audio message)";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    ReplyOn(i64),
    ReplyOff(i64),
    Forget(i64),
    ToggleAll,
    Status,
    PersonaList,
    PersonaDefault(Option<String>),
    PersonaUser(i64, Option<String>),
    Transcribe,
}

fn parse_command(text: &str) -> Option<Command> {
    let mut words = text.split_whitespace();
    match words.next()? {
        "/gweb" => match words.next()? {
            "on" => Some(Command::ReplyOn(words.next()?.parse().ok()?)),
            "off" => Some(Command::ReplyOff(words.next()?.parse().ok()?)),
            "del" => Some(Command::Forget(words.next()?.parse().ok()?)),
            "all" => Some(Command::ToggleAll),
            "status" => Some(Command::Status),
            _ => None,
        },
        "/persona" => match words.next()? {
            "list" => Some(Command::PersonaList),
            "default" => Some(Command::PersonaDefault(gem_arg(words.next()?))),
            "user" => {
                let user_id = words.next()?.parse().ok()?;
                Some(Command::PersonaUser(user_id, gem_arg(words.next()?)))
            }
            _ => None,
        },
        "/ts" => Some(Command::Transcribe),
        _ => None,
    }
}

fn gem_arg(word: &str) -> Option<String> {
    if word == "clear" {
        None
    } else {
        Some(word.to_string())
    }
}

/// Runs the commands that only touch stored settings.
fn settings_command_response(settings: &Settings, cmd: &Command) -> String {
    match cmd {
        Command::ReplyOn(user_id) => {
            settings.enable_user(*user_id);
            format!("Auto-reply enabled for {user_id}.")
        }
        Command::ReplyOff(user_id) => {
            settings.disable_user(*user_id);
            format!("Auto-reply disabled for {user_id}.")
        }
        Command::Forget(user_id) => {
            settings.clear_continuation(*user_id);
            if settings.forget_user(*user_id) {
                format!("Forgot {user_id}.")
            } else {
                format!("{user_id} was not listed.")
            }
        }
        Command::ToggleAll => {
            if settings.toggle_for_all() {
                "Replying to everyone.".to_string()
            } else {
                "Replying to listed users only.".to_string()
            }
        }
        Command::Status => {
            let snap = settings.snapshot();
            let mut enabled: Vec<i64> = snap.enabled_users.iter().copied().collect();
            let mut disabled: Vec<i64> = snap.disabled_users.iter().copied().collect();
            enabled.sort_unstable();
            disabled.sort_unstable();
            format!(
                "for_all: {}\nenabled: {:?}\ndisabled: {:?}\ndefault persona: {}",
                snap.for_all,
                enabled,
                disabled,
                snap.default_persona.as_deref().unwrap_or("(none)")
            )
        }
        Command::PersonaDefault(gem) => {
            settings.set_default_persona(gem.as_deref());
            match gem {
                Some(g) => format!("Default persona set to {g}."),
                None => "Default persona cleared.".to_string(),
            }
        }
        Command::PersonaUser(user_id, gem) => {
            settings.set_user_persona(*user_id, gem.as_deref());
            match gem {
                Some(g) => format!("Persona for {user_id} set to {g}."),
                None => format!("Persona for {user_id} cleared."),
            }
        }
        Command::PersonaList | Command::Transcribe => unreachable!("handled by the engine"),
    }
}

/// Merge a flushed batch into one prompt: text and captions in arrival
/// order, attachments collected, the last message quoted by the reply.
fn combine(user_id: i64, items: Vec<InboundItem>) -> ResolvedPrompt {
    let mut parts = Vec::new();
    let mut files = Vec::new();
    let mut reply_to = 0;

    for item in items {
        reply_to = reply_to.max(item.message_id);
        match item.kind {
            InboundKind::Text(text) => parts.push(text),
            InboundKind::Attachment { path, caption } => {
                if let Some(caption) = caption {
                    parts.push(caption);
                }
                files.push(path);
            }
        }
    }

    let text = if parts.is_empty() {
        // The upstream rejects empty prompts; a bare attachment still
        // needs some text.
        ".".to_string()
    } else {
        parts.join(" ")
    };

    ResolvedPrompt {
        user_id,
        reply_to,
        text,
        files,
    }
}

fn smiley_for(user_id: i64, message_id: i64) -> &'static str {
    let index = (user_id ^ message_id).unsigned_abs() as usize % SMILEYS.len();
    SMILEYS[index]
}

fn media_file(msg: &Message) -> Option<(FileId, String)> {
    if let Some(sizes) = msg.photo() {
        let largest = sizes.last()?;
        return Some((largest.file.id.clone(), "jpg".to_string()));
    }
    if let Some(video) = msg.video() {
        return Some((video.file.id.clone(), "mp4".to_string()));
    }
    if let Some(document) = msg.document() {
        let ext = document
            .file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_else(|| "bin".to_string());
        return Some((document.file.id.clone(), ext));
    }
    audio_file(msg)
}

fn audio_file(msg: &Message) -> Option<(FileId, String)> {
    if let Some(voice) = msg.voice() {
        return Some((voice.file.id.clone(), "ogg".to_string()));
    }
    if let Some(note) = msg.video_note() {
        return Some((note.file.id.clone(), "mp4".to_string()));
    }
    if let Some(audio) = msg.audio() {
        return Some((audio.file.id.clone(), "mp3".to_string()));
    }
    None
}
