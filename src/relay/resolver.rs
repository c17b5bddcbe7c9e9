//! Per-user session resolution against the upstream chat service.
//!
//! One exchange per user runs at a time; different users proceed in
//! parallel. The resolver loads the user's persona and continuation state,
//! shows a typing indicator while the upstream call is in flight, persists
//! the new continuation, and hands the reply to the delivery queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::relay::gemini::{ReplyImage, Upstream, UpstreamReply};
use crate::relay::queue::{DeliveryQueue, DeliveryTask, Outgoing};
use crate::relay::settings::Settings;
use crate::relay::telegram::Outbound;

const TYPING_REFRESH: Duration = Duration::from_secs(4);

/// One flushed batch ready for the upstream.
#[derive(Debug, Clone)]
pub struct ResolvedPrompt {
    pub user_id: i64,
    /// Message id the reply should quote.
    pub reply_to: i64,
    pub text: String,
    /// Downloaded attachments; deleted once the exchange finishes.
    pub files: Vec<PathBuf>,
}

/// Aborts the wrapped task when dropped. Keeps the typing refresher from
/// outliving the exchange on any exit path.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct SessionResolver {
    upstream: Arc<dyn Upstream>,
    settings: Settings,
    queue: Arc<DeliveryQueue>,
    outbound: Arc<dyn Outbound>,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SessionResolver {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        settings: Settings,
        queue: Arc<DeliveryQueue>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            upstream,
            settings,
            queue,
            outbound,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run one exchange for the user. Serialized per user; errors are
    /// reported, never propagated.
    pub async fn resolve(&self, prompt: ResolvedPrompt) {
        let user_lock = self.user_lock(prompt.user_id).await;
        let _guard = user_lock.lock().await;

        let _typing = self.start_typing(prompt.user_id);
        self.run_exchange(&prompt).await;
        drop(_guard);
        drop(user_lock);

        self.evict_lock(prompt.user_id).await;
        self.remove_files(&prompt.files).await;
    }

    async fn run_exchange(&self, prompt: &ResolvedPrompt) {
        let user_id = prompt.user_id;
        let persona = self.settings.persona_for(user_id);
        let continuation = self.settings.continuation(user_id);
        info!(
            user_id,
            has_continuation = continuation.is_some(),
            "Resolving prompt ({} chars, {} files)",
            prompt.text.len(),
            prompt.files.len()
        );

        let first = self
            .upstream
            .send(
                continuation.clone(),
                persona.as_deref(),
                &prompt.text,
                &prompt.files,
            )
            .await;

        let reply = match first {
            Ok(reply) => reply,
            Err(e) => {
                // A dead continuation is the usual culprit. Drop it and
                // retry once from a fresh session.
                warn!(user_id, "Upstream failed, retrying with fresh session: {e}");
                self.outbound
                    .notify_operator(&format!("Upstream error for {user_id}, retrying: {e}"))
                    .await;
                self.settings.clear_continuation(user_id);

                match self
                    .upstream
                    .send(None, persona.as_deref(), &prompt.text, &prompt.files)
                    .await
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(user_id, "Upstream failed after retry: {e}");
                        self.outbound
                            .notify_operator(&format!(
                                "Upstream failed for {user_id} after retry: {e}"
                            ))
                            .await;
                        self.queue.enqueue(DeliveryTask::new(Outgoing::Text {
                            chat_id: user_id,
                            text: "Sorry, something went wrong. Please try again later."
                                .to_string(),
                            reply_to: Some(prompt.reply_to),
                        }));
                        return;
                    }
                }
            }
        };

        if let Some(ref token) = reply.continuation {
            self.settings.set_continuation(user_id, token);
        }
        self.deliver(user_id, prompt.reply_to, reply);
    }

    fn deliver(&self, user_id: i64, reply_to: i64, reply: UpstreamReply) {
        if !reply.text.is_empty() {
            self.queue.enqueue(DeliveryTask::new(Outgoing::Text {
                chat_id: user_id,
                text: reply.text,
                reply_to: Some(reply_to),
            }));
        }
        for image in reply.images {
            let task = match image {
                ReplyImage::Saved(path) => DeliveryTask::with_cleanup(
                    Outgoing::PhotoPath {
                        chat_id: user_id,
                        path: path.clone(),
                        reply_to: None,
                    },
                    path,
                ),
                ReplyImage::Linked(url) => DeliveryTask::new(Outgoing::PhotoUrl {
                    chat_id: user_id,
                    url,
                    reply_to: None,
                }),
            };
            self.queue.enqueue(task);
        }
    }

    /// Keep the "typing..." indicator alive until the guard drops.
    fn start_typing(&self, chat_id: i64) -> AbortOnDrop {
        let outbound = self.outbound.clone();
        AbortOnDrop(tokio::spawn(async move {
            loop {
                if let Err(e) = outbound.send_typing(chat_id).await {
                    warn!("Typing indicator failed: {e}");
                    break;
                }
                tokio::time::sleep(TYPING_REFRESH).await;
            }
        }))
    }

    async fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(user_id).or_default().clone()
    }

    /// Drop the map entry once nobody else holds the lock.
    async fn evict_lock(&self, user_id: i64) {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(&user_id)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(&user_id);
        }
    }

    async fn remove_files(&self, files: &[PathBuf]) {
        for path in files {
            if path.exists()
                && let Err(e) = tokio::fs::remove_file(path).await
            {
                warn!("Failed to remove temp file {:?}: {e}", path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::store::Store;
    use crate::relay::telegram::SendError;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::path::Path;
    use tokio::time::sleep;

    struct MockUpstream {
        /// Scripted results, popped per call.
        outcomes: Mutex<VecDeque<Result<UpstreamReply, String>>>,
        /// (continuation, prompt) per call.
        calls: Mutex<Vec<(Option<Value>, String)>>,
        delay: Duration,
    }

    impl MockUpstream {
        fn new(outcomes: Vec<Result<UpstreamReply, String>>) -> Arc<Self> {
            Self::with_delay(outcomes, Duration::ZERO)
        }

        fn with_delay(
            outcomes: Vec<Result<UpstreamReply, String>>,
            delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl Upstream for MockUpstream {
        async fn send(
            &self,
            continuation: Option<Value>,
            _persona: Option<&str>,
            prompt: &str,
            _files: &[PathBuf],
        ) -> Result<UpstreamReply, String> {
            self.calls
                .lock()
                .await
                .push((continuation, prompt.to_string()));
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.outcomes
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(reply("fallback")))
        }

        async fn list_personas(&self) -> Result<Vec<crate::relay::gemini::Persona>, String> {
            Ok(Vec::new())
        }
    }

    struct SilentOutbound {
        notices: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Outbound for SilentOutbound {
        async fn send_text(&self, _: i64, _: &str, _: Option<i64>) -> Result<(), SendError> {
            Ok(())
        }
        async fn send_photo_path(
            &self,
            _: i64,
            _: &Path,
            _: Option<i64>,
        ) -> Result<(), SendError> {
            Ok(())
        }
        async fn send_photo_url(&self, _: i64, _: &str, _: Option<i64>) -> Result<(), SendError> {
            Ok(())
        }
        async fn delete_message(&self, _: i64, _: i64) -> Result<(), SendError> {
            Ok(())
        }
        async fn send_typing(&self, _: i64) -> Result<(), SendError> {
            Ok(())
        }
        async fn notify_operator(&self, text: &str) {
            self.notices.lock().await.push(text.to_string());
        }
    }

    fn reply(text: &str) -> UpstreamReply {
        UpstreamReply {
            text: text.to_string(),
            images: Vec::new(),
            continuation: Some(json!(["c", "r", "rc"])),
        }
    }

    fn prompt(user_id: i64, text: &str) -> ResolvedPrompt {
        ResolvedPrompt {
            user_id,
            reply_to: 100,
            text: text.to_string(),
            files: Vec::new(),
        }
    }

    fn resolver(
        upstream: Arc<MockUpstream>,
    ) -> (Arc<SessionResolver>, Settings, Arc<SilentOutbound>) {
        let settings = Settings::new(Arc::new(Store::new()));
        let outbound = Arc::new(SilentOutbound {
            notices: Mutex::new(Vec::new()),
        });
        // No worker is started, so enqueued tasks just accumulate.
        let queue = Arc::new(DeliveryQueue::new());
        let resolver = Arc::new(SessionResolver::new(
            upstream,
            settings.clone(),
            queue,
            outbound.clone(),
        ));
        (resolver, settings, outbound)
    }

    #[tokio::test]
    async fn test_continuation_persisted_after_success() {
        let upstream = MockUpstream::new(vec![Ok(reply("hi"))]);
        let (resolver, settings, _) = resolver(upstream.clone());

        resolver.resolve(prompt(1, "hello")).await;

        assert_eq!(settings.continuation(1), Some(json!(["c", "r", "rc"])));
        let calls = upstream.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (None, "hello".to_string()));
    }

    #[tokio::test]
    async fn test_second_exchange_replays_continuation() {
        let upstream = MockUpstream::new(vec![Ok(reply("one")), Ok(reply("two"))]);
        let (resolver, _, _) = resolver(upstream.clone());

        resolver.resolve(prompt(1, "first")).await;
        resolver.resolve(prompt(1, "second")).await;

        let calls = upstream.calls.lock().await;
        assert_eq!(calls[1].0, Some(json!(["c", "r", "rc"])));
    }

    #[tokio::test]
    async fn test_failure_clears_state_and_retries_once() {
        let upstream = MockUpstream::new(vec![Err("stale session".into()), Ok(reply("fresh"))]);
        let (resolver, settings, outbound) = resolver(upstream.clone());
        settings.set_continuation(1, &json!(["old", "old", "old"]));

        resolver.resolve(prompt(1, "hello")).await;

        let calls = upstream.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, Some(json!(["old", "old", "old"])));
        // Retry starts clean.
        assert_eq!(calls[1].0, None);
        // New continuation stored after the successful retry.
        assert_eq!(settings.continuation(1), Some(json!(["c", "r", "rc"])));
        let notices = outbound.notices.lock().await;
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("retrying"));
    }

    #[tokio::test]
    async fn test_double_failure_reports_and_stops() {
        let upstream = MockUpstream::new(vec![Err("down".into()), Err("still down".into())]);
        let (resolver, settings, outbound) = resolver(upstream.clone());

        resolver.resolve(prompt(1, "hello")).await;

        assert_eq!(upstream.calls.lock().await.len(), 2);
        assert_eq!(settings.continuation(1), None);
        let notices = outbound.notices.lock().await;
        assert!(notices.iter().any(|n| n.contains("after retry")));
    }

    #[tokio::test]
    async fn test_exchanges_for_same_user_are_serialized() {
        let upstream = MockUpstream::with_delay(
            vec![Ok(reply("a")), Ok(reply("b"))],
            Duration::from_millis(50),
        );
        let (resolver, _, _) = resolver(upstream.clone());

        let r1 = resolver.clone();
        let r2 = resolver.clone();
        let t1 = tokio::spawn(async move { r1.resolve(prompt(1, "one")).await });
        sleep(Duration::from_millis(10)).await;
        let t2 = tokio::spawn(async move { r2.resolve(prompt(1, "two")).await });

        // While the first call is in flight the second must be parked.
        sleep(Duration::from_millis(30)).await;
        assert_eq!(upstream.calls.lock().await.len(), 1);

        t1.await.unwrap();
        t2.await.unwrap();
        let calls = upstream.calls.lock().await;
        assert_eq!(calls.len(), 2);
        // The second exchange saw the continuation the first one stored.
        assert_eq!(calls[1].0, Some(json!(["c", "r", "rc"])));
    }

    #[tokio::test]
    async fn test_different_users_run_concurrently() {
        let upstream = MockUpstream::with_delay(
            vec![Ok(reply("a")), Ok(reply("b"))],
            Duration::from_millis(50),
        );
        let (resolver, _, _) = resolver(upstream.clone());

        let r1 = resolver.clone();
        let r2 = resolver.clone();
        let t1 = tokio::spawn(async move { r1.resolve(prompt(1, "one")).await });
        let t2 = tokio::spawn(async move { r2.resolve(prompt(2, "two")).await });

        sleep(Duration::from_millis(30)).await;
        // Both upstream calls in flight at once.
        assert_eq!(upstream.calls.lock().await.len(), 2);

        t1.await.unwrap();
        t2.await.unwrap();
    }

    #[tokio::test]
    async fn test_input_files_removed_after_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let voice = dir.path().join("gweb_1_100.ogg");
        std::fs::write(&voice, b"opus").unwrap();

        let upstream = MockUpstream::new(vec![Ok(reply("heard it"))]);
        let (resolver, _, _) = resolver(upstream);

        let mut p = prompt(1, "listen");
        p.files = vec![voice.clone()];
        resolver.resolve(p).await;

        assert!(!voice.exists());
    }

    #[tokio::test]
    async fn test_input_files_removed_on_failure_too() {
        let dir = tempfile::tempdir().unwrap();
        let photo = dir.path().join("gweb_1_100.jpg");
        std::fs::write(&photo, b"jpg").unwrap();

        let upstream = MockUpstream::new(vec![Err("down".into()), Err("down".into())]);
        let (resolver, _, _) = resolver(upstream);

        let mut p = prompt(1, "look");
        p.files = vec![photo.clone()];
        resolver.resolve(p).await;

        assert!(!photo.exists());
    }

    #[tokio::test]
    async fn test_lock_map_does_not_grow() {
        let upstream = MockUpstream::new(vec![Ok(reply("a")), Ok(reply("b"))]);
        let (resolver, _, _) = resolver(upstream);

        resolver.resolve(prompt(1, "one")).await;
        resolver.resolve(prompt(2, "two")).await;

        assert!(resolver.locks.lock().await.is_empty());
    }
}
