use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use companion_schemas::{EventStatus, ScheduledEvent, UserId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::event_store::EventStore;
use crate::expansion::{expand_event, MemoryClient};
use crate::generation::{GenerationClient, APOLOGY_TEXT};

/// A proactive message lands badly while the user is mid-conversation, so
/// anything inside this window defers the event.
pub const ACTIVE_WINDOW_MINUTES: i64 = 15;
/// How far a deferred event gets pushed back.
pub const RESCHEDULE_DELAY_MINUTES: i64 = 30;
/// Execution attempts before an event is written off.
pub const MAX_ATTEMPTS: i64 = 3;

/// Where the user's latest inbound-interaction timestamp comes from.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn last_interaction(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>>;
}

/// Delivers a fired event to the outside world.
#[async_trait]
pub trait EventExecutor: Send + Sync {
    async fn execute(&self, event: &ScheduledEvent) -> Result<()>;

    /// One-shot apology after an event burns all its attempts. Best effort;
    /// the event is cancelled either way.
    async fn apologize(&self, event: &ScheduledEvent) -> Result<()>;
}

/// What happened to a claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Sent,
    Deferred,
    FailedWillRetry,
    Cancelled,
}

/// Drives a claimed event through the defer/execute/retry decision.
pub struct EventScheduler {
    store: Arc<Mutex<EventStore>>,
    activity: Arc<dyn ActivitySource>,
    executor: Arc<dyn EventExecutor>,
}

impl EventScheduler {
    pub fn new(
        store: Arc<Mutex<EventStore>>,
        activity: Arc<dyn ActivitySource>,
        executor: Arc<dyn EventExecutor>,
    ) -> Self {
        Self {
            store,
            activity,
            executor,
        }
    }

    /// Process one event the sweep has already claimed.
    ///
    /// Active user -> defer by RESCHEDULE_DELAY_MINUTES. Idle or unknown
    /// activity -> execute. Execution failure spends an attempt; the last
    /// failure cancels the event and sends a single apology.
    pub async fn process_event(&self, event: &ScheduledEvent) -> Result<ProcessOutcome> {
        if self.user_is_active(event).await {
            let new_time = (Utc::now() + Duration::minutes(RESCHEDULE_DELAY_MINUTES)).to_rfc3339();
            self.store.lock().await.defer(&event.id, &new_time)?;
            return Ok(ProcessOutcome::Deferred);
        }

        match self.executor.execute(event).await {
            Ok(()) => {
                self.store.lock().await.mark_sent(&event.id)?;
                info!("Event {} executed and sent", event.id);
                Ok(ProcessOutcome::Sent)
            }
            Err(e) => {
                error!("Execution failed for event {}: {}", event.id, e);
                let status = self
                    .store
                    .lock()
                    .await
                    .record_failure(&event.id, MAX_ATTEMPTS)?;

                if status == EventStatus::Cancelled {
                    if let Err(e) = self.executor.apologize(event).await {
                        warn!("Apology for event {} also failed: {}", event.id, e);
                    }
                    Ok(ProcessOutcome::Cancelled)
                } else {
                    Ok(ProcessOutcome::FailedWillRetry)
                }
            }
        }
    }

    /// An event without a bound user always proceeds; so does one whose
    /// activity record is missing or unreadable.
    async fn user_is_active(&self, event: &ScheduledEvent) -> bool {
        let user_id = match &event.user_id {
            Some(user_id) => user_id,
            None => return false,
        };

        let last = match self.activity.last_interaction(user_id).await {
            Ok(Some(last)) => last,
            Ok(None) => return false,
            Err(e) => {
                warn!("Activity lookup failed for {}: {}", user_id, e);
                return false;
            }
        };

        let idle = Utc::now().signed_duration_since(last);
        idle < Duration::minutes(ACTIVE_WINDOW_MINUTES)
    }
}

/// Activity source backed by the memory service's activity tracker.
pub struct MemoryActivitySource {
    memory: Arc<MemoryClient>,
}

impl MemoryActivitySource {
    pub fn new(memory: Arc<MemoryClient>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl ActivitySource for MemoryActivitySource {
    async fn last_interaction(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        let record = match self.memory.fetch_activity(user_id).await? {
            Some(record) => record,
            None => return Ok(None),
        };

        match DateTime::parse_from_rfc3339(&record.last_interaction_at) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(e) => {
                warn!(
                    "Unparseable activity timestamp for {}: {} ({})",
                    user_id, record.last_interaction_at, e
                );
                Ok(None)
            }
        }
    }
}

/// Executor that expands the event against the live fact store and posts
/// the result to the persona's chat webhook.
pub struct WebhookExecutor {
    memory: Arc<MemoryClient>,
    generation: Arc<GenerationClient>,
    client: reqwest::Client,
}

impl WebhookExecutor {
    pub fn new(memory: Arc<MemoryClient>, generation: Arc<GenerationClient>) -> Self {
        Self {
            memory,
            generation,
            client: reqwest::Client::new(),
        }
    }

    async fn fetch_persona(&self, event: &ScheduledEvent) -> Result<companion_schemas::Persona> {
        self.memory
            .fetch_persona(&event.persona_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("persona {} not found", event.persona_id))
    }

    async fn deliver(
        &self,
        event: &ScheduledEvent,
        persona: &companion_schemas::Persona,
        text: &str,
    ) -> Result<()> {
        let chat_url = match &persona.chat_url {
            Some(url) => url,
            None => {
                // No channel bound yet: skipping is not a failure.
                warn!(
                    "Persona {} has no chat_url - dropping event {}",
                    event.persona_id, event.id
                );
                return Ok(());
            }
        };

        let payload = serde_json::json!({
            "persona_id": event.persona_id,
            "event_id": event.id,
            "event_type": event.event_type,
            "text": text,
        });

        let response = self.client.post(chat_url).json(&payload).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned status {}", response.status());
        }

        Ok(())
    }
}

#[async_trait]
impl EventExecutor for WebhookExecutor {
    async fn execute(&self, event: &ScheduledEvent) -> Result<()> {
        let persona = self.fetch_persona(event).await?;
        let text = expand_event(&self.memory, &self.generation, event, &persona).await?;
        self.deliver(event, &persona, &text).await
    }

    async fn apologize(&self, event: &ScheduledEvent) -> Result<()> {
        let persona = self.fetch_persona(event).await?;
        self.deliver(event, &persona, APOLOGY_TEXT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_schemas::{generate_persona_id, CreateEventRequest, EventType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct StubActivity {
        last: Option<DateTime<Utc>>,
    }

    #[async_trait]
    impl ActivitySource for StubActivity {
        async fn last_interaction(&self, _user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
            Ok(self.last)
        }
    }

    struct StubExecutor {
        should_fail: bool,
        executions: AtomicUsize,
        apologies: AtomicUsize,
    }

    impl StubExecutor {
        fn new(should_fail: bool) -> Self {
            Self {
                should_fail,
                executions: AtomicUsize::new(0),
                apologies: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventExecutor for StubExecutor {
        async fn execute(&self, _event: &ScheduledEvent) -> Result<()> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if self.should_fail {
                anyhow::bail!("stubbed delivery failure");
            }
            Ok(())
        }

        async fn apologize(&self, _event: &ScheduledEvent) -> Result<()> {
            self.apologies.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(
        activity: StubActivity,
        executor: Arc<StubExecutor>,
    ) -> (TempDir, Arc<Mutex<EventStore>>, EventScheduler) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(
            EventStore::new(tmp.path().join("events.db")).unwrap(),
        ));
        let scheduler =
            EventScheduler::new(store.clone(), Arc::new(activity), executor);
        (tmp, store, scheduler)
    }

    async fn claimed_event(
        store: &Arc<Mutex<EventStore>>,
        user_id: Option<UserId>,
    ) -> ScheduledEvent {
        let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let store = store.lock().await;
        let event = store
            .create_event(&CreateEventRequest {
                persona_id: generate_persona_id(),
                user_id,
                event_type: EventType::Text,
                context_prompt: "Check in about their day".to_string(),
                scheduled_at: past,
            })
            .unwrap();
        assert!(store.claim(&event.id).unwrap());
        event
    }

    #[tokio::test]
    async fn active_user_defers_event() {
        let executor = Arc::new(StubExecutor::new(false));
        let (_tmp, store, scheduler) = setup(
            StubActivity {
                last: Some(Utc::now() - Duration::minutes(2)),
            },
            executor.clone(),
        );

        let user = UserId("user_test".to_string());
        let event = claimed_event(&store, Some(user)).await;

        let outcome = scheduler.process_event(&event).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Deferred);
        assert_eq!(executor.executions.load(Ordering::SeqCst), 0);

        let loaded = store.lock().await.get_event(&event.id).unwrap().unwrap();
        assert_eq!(loaded.status, EventStatus::Rescheduled);
        // Fire time moved into the future.
        assert!(loaded.scheduled_at > Utc::now().to_rfc3339());
    }

    #[tokio::test]
    async fn idle_user_gets_the_message() {
        let executor = Arc::new(StubExecutor::new(false));
        let (_tmp, store, scheduler) = setup(
            StubActivity {
                last: Some(Utc::now() - Duration::hours(3)),
            },
            executor.clone(),
        );

        let user = UserId("user_test".to_string());
        let event = claimed_event(&store, Some(user)).await;

        let outcome = scheduler.process_event(&event).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Sent);
        assert_eq!(executor.executions.load(Ordering::SeqCst), 1);

        let loaded = store.lock().await.get_event(&event.id).unwrap().unwrap();
        assert_eq!(loaded.status, EventStatus::Sent);
    }

    #[tokio::test]
    async fn event_without_user_always_proceeds() {
        let executor = Arc::new(StubExecutor::new(false));
        // Activity source says "just now", but the event has no bound user.
        let (_tmp, store, scheduler) = setup(
            StubActivity {
                last: Some(Utc::now()),
            },
            executor.clone(),
        );

        let event = claimed_event(&store, None).await;

        let outcome = scheduler.process_event(&event).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Sent);
    }

    #[tokio::test]
    async fn unknown_activity_proceeds() {
        let executor = Arc::new(StubExecutor::new(false));
        let (_tmp, store, scheduler) = setup(StubActivity { last: None }, executor.clone());

        let user = UserId("user_test".to_string());
        let event = claimed_event(&store, Some(user)).await;

        let outcome = scheduler.process_event(&event).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Sent);
    }

    #[tokio::test]
    async fn repeated_failures_cancel_with_single_apology() {
        let executor = Arc::new(StubExecutor::new(true));
        let (_tmp, store, scheduler) = setup(StubActivity { last: None }, executor.clone());

        let user = UserId("user_test".to_string());
        let event = claimed_event(&store, Some(user)).await;

        // Attempts 1 and 2: failed but re-claimable, no apology yet.
        for _ in 0..2 {
            let outcome = scheduler.process_event(&event).await.unwrap();
            assert_eq!(outcome, ProcessOutcome::FailedWillRetry);
            assert!(store.lock().await.claim(&event.id).unwrap());
        }
        assert_eq!(executor.apologies.load(Ordering::SeqCst), 0);

        // Attempt 3: budget spent, cancelled, exactly one apology.
        let outcome = scheduler.process_event(&event).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Cancelled);
        assert_eq!(executor.executions.load(Ordering::SeqCst), 3);
        assert_eq!(executor.apologies.load(Ordering::SeqCst), 1);

        let loaded = store.lock().await.get_event(&event.id).unwrap().unwrap();
        assert_eq!(loaded.status, EventStatus::Cancelled);
        assert_eq!(loaded.attempts, 3);
        // The spent event is gone for good.
        assert!(!store.lock().await.claim(&event.id).unwrap());
    }
}
