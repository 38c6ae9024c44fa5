//! Chat turn coordination: one `send_message` walks readiness, windowing, the retried request
//! and the reply, keeping message statuses and the observable phase in step.
//!
//! Phases per turn: `Idle → Thinking → (ServerWaking) → Typing → Idle`. Only one turn runs at a
//! time; a second `send_message` while one is in flight is rejected with [`ChatError::Busy`].

use crate::client::{RequestExecutor, RequestOptions, RetryController, RetryPolicy, Transport};
use crate::config::{self, Config, MessagesConfig};
use crate::conversation::{
    ContextInfo, ConversationContext, Message, MessagePatch, MessageStatus, Sender,
};
use crate::error::{ChatError, FallbackCategory};
use crate::protocol::{self, BodyBuilder, ChatReply};
use crate::readiness::{self, ReadyOutcome, ServerReadiness};
use crate::session::{DebouncedSave, SessionSnapshot, SessionStore};
use crate::storage::KeyValueStore;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Thinking,
    ServerWaking,
    Typing,
}

/// What the rendering layer observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatState {
    pub phase: Phase,
    /// Latest readiness progress text, cleared when the turn ends.
    pub server_status: Option<String>,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            server_status: None,
        }
    }
}

/// Releases the in-flight flag and returns the phase to Idle however the turn ends.
struct TurnGuard<'a> {
    in_flight: &'a AtomicBool,
    state: &'a watch::Sender<ChatState>,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(ChatState::default());
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

pub struct ChatOrchestrator {
    executor: RequestExecutor,
    retry: RetryController,
    readiness: ServerReadiness,
    conversation: Arc<RwLock<ConversationContext>>,
    sessions: Arc<SessionStore>,
    autosave: DebouncedSave,
    /// Held across capture+save and across reset+delete.
    save_gate: Arc<Mutex<()>>,
    /// Bumped by every clear; an autosave armed under an older generation is dropped.
    generation: Arc<AtomicU64>,
    body_builder: Box<dyn BodyBuilder>,
    chat_path: String,
    texts: MessagesConfig,
    state: Arc<watch::Sender<ChatState>>,
    in_flight: AtomicBool,
}

impl ChatOrchestrator {
    /// Wire every component from config. `transport` and `storage` are the platform primitives.
    pub fn from_config(
        config: &Config,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        let base_url = config::resolve_backend_url(config);
        let executor = RequestExecutor::new(transport, base_url, config.retry.request_timeout())
            .with_headers(
                config
                    .backend
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        let retry = RetryController::new(RetryPolicy::from_config(&config.retry));
        let readiness = ServerReadiness::new(
            executor.clone(),
            retry.clone(),
            config.backend.health_path.clone(),
            &config.readiness,
        );
        let (state, _) = watch::channel(ChatState::default());
        Self {
            executor,
            retry,
            readiness,
            conversation: Arc::new(RwLock::new(ConversationContext::new(
                &config.messages.greeting,
                &config.context,
            ))),
            sessions: Arc::new(SessionStore::new(storage, &config.session)),
            autosave: DebouncedSave::new(Duration::from_millis(config.session.debounce_ms)),
            save_gate: Arc::new(Mutex::new(())),
            generation: Arc::new(AtomicU64::new(0)),
            body_builder: protocol::body_builder_for(config.product.as_ref()),
            chat_path: config.backend.chat_path.clone(),
            texts: config.messages.clone(),
            state: Arc::new(state),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Replace the request body builder (e.g. for product-specific fields).
    pub fn with_body_builder(mut self, builder: Box<dyn BodyBuilder>) -> Self {
        self.body_builder = builder;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ChatState {
        self.state.borrow().clone()
    }

    pub fn readiness(&self) -> &ServerReadiness {
        &self.readiness
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.conversation.read().await.messages().to_vec()
    }

    pub async fn context_info(&self) -> ContextInfo {
        self.conversation.read().await.context_info()
    }

    /// Most recent failed user message, if any (what a "retry" button would target).
    pub async fn last_failed_user_message(&self) -> Option<Message> {
        self.conversation
            .read()
            .await
            .conversation()
            .filter(|m| m.sender == Sender::User && m.status == MessageStatus::Failed)
            .last()
            .cloned()
    }

    /// Rehydrate the conversation from the stored session. Returns false when there is none.
    pub async fn restore_session(&self) -> bool {
        let Some(snapshot) = self.sessions.load() else {
            return false;
        };
        let count = snapshot.messages.len();
        self.conversation
            .write()
            .await
            .restore(snapshot.messages, snapshot.context_info);
        log::info!("chat: restored session with {} messages", count);
        true
    }

    /// Run one turn. On success returns the id of the bot reply. On failure the user message is
    /// marked failed; backend and transport failures also append an error reply from the bot.
    pub async fn send_message(&self, text: &str) -> Result<i64, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Validation("message is empty".to_string()));
        }
        let _turn = self.claim_turn()?;
        self.run_turn(text).await
    }

    /// Take the single in-flight slot. Released (and the phase reset) when the guard drops.
    fn claim_turn(&self) -> Result<TurnGuard<'_>, ChatError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ChatError::Busy);
        }
        Ok(TurnGuard {
            in_flight: &self.in_flight,
            state: &self.state,
        })
    }

    /// The turn body. Caller holds the in-flight slot.
    async fn run_turn(&self, text: &str) -> Result<i64, ChatError> {
        self.set_phase(Phase::Thinking);

        let user_id = self
            .mutate(|c| c.push(Sender::User, text, MessageStatus::Sending, false, None))
            .await;

        if let Err(e) = self.ensure_ready().await {
            log::warn!("chat: server not ready: {}", e);
            self.mutate(|c| c.patch(user_id, MessagePatch::status(MessageStatus::Failed)))
                .await;
            return Err(e);
        }

        self.mutate(|c| c.patch(user_id, MessagePatch::status(MessageStatus::Sent)))
            .await;
        self.set_phase(Phase::Typing);

        let window = self.conversation.write().await.window_for_send();
        let history = protocol::history_from(&window.messages);
        let body = self.body_builder.build(text, &history);
        log::debug!(
            "chat: sending with {} context messages ({} chars, truncated: {})",
            window.info.messages_in_context,
            window.info.context_characters,
            window.info.context_truncated
        );

        let result = self
            .retry
            .run(
                || {
                    self.executor
                        .execute(&self.chat_path, RequestOptions::post_json(body.clone()))
                },
                None,
            )
            .await
            .and_then(|res| ChatReply::from_json(&res.body));

        match result {
            Ok(reply) => {
                let metadata = reply.metadata(&window.info);
                let bot_id = self
                    .mutate(|c| {
                        let id = c.push(
                            Sender::Bot,
                            reply.text.clone(),
                            MessageStatus::Delivered,
                            false,
                            Some(metadata),
                        );
                        c.patch(user_id, MessagePatch::status(MessageStatus::Delivered));
                        id
                    })
                    .await;
                Ok(bot_id)
            }
            Err(e) => {
                log::warn!("chat: turn failed: {}", e);
                let fallback = self.fallback_text(&e).to_string();
                let metadata = json!({
                    "error": e.to_string(),
                    "contextWindow": window.info,
                });
                self.mutate(|c| {
                    c.push(
                        Sender::Bot,
                        fallback,
                        MessageStatus::Delivered,
                        true,
                        Some(metadata),
                    );
                    c.patch(user_id, MessagePatch::status(MessageStatus::Failed));
                })
                .await;
                Err(e)
            }
        }
    }

    /// Resend a user message by replay: the message and everything after it are discarded, then
    /// its text is sent again as a new turn.
    pub async fn retry_message(&self, message_id: i64) -> Result<i64, ChatError> {
        let _turn = self.claim_turn()?;
        let original = {
            let c = self.conversation.read().await;
            c.get(message_id).cloned()
        };
        let original = match original {
            Some(m) if m.sender == Sender::User => m,
            Some(_) => {
                return Err(ChatError::Validation(
                    "only user messages can be retried".to_string(),
                ))
            }
            None => return Err(ChatError::Validation(format!("no message {}", message_id))),
        };
        // Timestamps are unique to the millisecond, so this drops the original as well.
        let cutoff = original.timestamp - chrono::Duration::milliseconds(1);
        let removed = self.conversation.write().await.remove_after(cutoff);
        log::info!("chat: retrying message {} ({} removed)", message_id, removed);
        self.run_turn(&original.text).await
    }

    /// Back to the greeting only; the stored session is deleted.
    pub async fn clear_conversation(&self) -> Result<(), ChatError> {
        let _turn = self.claim_turn()?;
        self.autosave.disarm();
        // Waits out an autosave that already started, so it cannot write the old log back.
        let _gate = self.save_gate.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.conversation.write().await.reset(&self.texts.greeting);
        self.sessions.clear();
        log::info!("chat: conversation cleared");
        Ok(())
    }

    /// Persist immediately, bypassing the debounce.
    pub async fn save_now(&self) -> anyhow::Result<()> {
        self.autosave.disarm();
        let _gate = self.save_gate.lock().await;
        let snapshot = SessionSnapshot::capture(&*self.conversation.read().await);
        self.sessions.save(&snapshot)
    }

    async fn ensure_ready(&self) -> Result<(), ChatError> {
        let state = self.state.clone();
        // The first check runs under Thinking; the phase only turns to ServerWaking once a
        // check has failed and the wake-up is retrying.
        let mut on_progress = move |status: &str| {
            state.send_modify(|s| {
                if status == readiness::STATUS_CONNECTING {
                    s.phase = Phase::ServerWaking;
                }
                s.server_status = Some(status.to_string());
            });
        };
        match self.readiness.ensure_ready(&mut on_progress).await? {
            ReadyOutcome::AlreadyWaking => Err(ChatError::AlreadyWaking),
            ReadyOutcome::Warm | ReadyOutcome::Woken => Ok(()),
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.state.send_modify(|s| {
            s.phase = phase;
            if phase != Phase::ServerWaking {
                s.server_status = None;
            }
        });
    }

    fn fallback_text(&self, err: &ChatError) -> &str {
        if let ChatError::Application(_) = err {
            return &self.texts.application_fallback;
        }
        match err.fallback_category() {
            FallbackCategory::Connectivity => &self.texts.connectivity_fallback,
            FallbackCategory::Starting => &self.texts.starting_fallback,
            FallbackCategory::Generic => &self.texts.generic_fallback,
        }
    }

    /// Apply a change to the conversation and re-arm the autosave.
    async fn mutate<R>(&self, f: impl FnOnce(&mut ConversationContext) -> R) -> R {
        let out = f(&mut *self.conversation.write().await);
        self.schedule_save();
        out
    }

    fn schedule_save(&self) {
        let conversation = self.conversation.clone();
        let sessions = self.sessions.clone();
        let state = self.state.subscribe();
        let gate = self.save_gate.clone();
        let generation = self.generation.clone();
        let armed_at = generation.load(Ordering::SeqCst);
        self.autosave.arm(async move {
            let _gate = gate.lock().await;
            if generation.load(Ordering::SeqCst) != armed_at {
                log::debug!("session: cleared since armed, skipping autosave");
                return;
            }
            let idle = state.borrow().phase == Phase::Idle;
            if !idle {
                log::debug!("session: busy, skipping autosave");
                return;
            }
            let snapshot = SessionSnapshot::capture(&*conversation.read().await);
            if let Err(e) = sessions.save(&snapshot) {
                log::warn!("session: autosave failed: {:#}", e);
            }
        });
    }
}
