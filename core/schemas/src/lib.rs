use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersonaId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for PersonaId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Persona Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: PersonaId,
    pub name: String,
    /// System description injected into every generation/extraction prompt.
    pub description: String,
    /// Webhook the transport adapter listens on. None means no channel is
    /// bound yet and proactive sends are skipped.
    pub chat_url: Option<String>,
    pub user_id: Option<UserId>,
    pub created_at: String, // RFC3339
}

// ============================================================================
// Fact Schema
// ============================================================================

/// Whether a fact describes the human or the persona itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactTarget {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "self")]
    Persona,
}

impl FactTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactTarget::User => "user",
            FactTarget::Persona => "self",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(FactTarget::User),
            "self" => Some(FactTarget::Persona),
            _ => None,
        }
    }
}

pub const IMPORTANCE_MIN: i64 = 1;
pub const IMPORTANCE_MAX: i64 = 10;
pub const IMPORTANCE_DEFAULT: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub persona_id: PersonaId,
    pub target: FactTarget,
    /// Short free-text label, e.g. "favorite_food", "current_mood".
    pub category: String,
    pub value: String,
    /// Optional provenance note (when/why this was learned).
    pub context: Option<String>,
    /// 1-10, consolidation's ranking signal. Not used for retrieval tiering.
    pub importance: i64,
    pub created_at: String,              // RFC3339
    pub updated_at: String,              // RFC3339
    pub last_consolidated_at: Option<String>, // RFC3339
}

// ============================================================================
// Reconciliation Diff Schema
// ============================================================================

/// A new fact proposed by the extraction backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactDraft {
    pub target: FactTarget,
    pub category: String,
    pub value: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactUpdate {
    pub id: FactId,
    pub value: String,
    pub context: Option<String>,
}

/// The add/update/remove diff the extraction backend returns for one
/// conversation excerpt. All three keys must be present in the raw JSON or
/// the whole batch is discarded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactDiff {
    pub add: Vec<FactDraft>,
    pub update: Vec<FactUpdate>,
    pub remove: Vec<FactId>,
}

impl FactDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

// ============================================================================
// Consolidation Plan Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationUpdate {
    pub id: FactId,
    pub value: String,
    pub importance: i64,
}

/// The update/delete plan the summarization backend returns for a full
/// fact-store pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidationPlan {
    pub update: Vec<ConsolidationUpdate>,
    pub delete: Vec<FactId>,
}

// ============================================================================
// Scheduled Event Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "image_generation")]
    ImageGeneration,
    #[serde(rename = "wake_up")]
    WakeUp,
    #[serde(rename = "sleep")]
    Sleep,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Text => "text",
            EventType::ImageGeneration => "image_generation",
            EventType::WakeUp => "wake_up",
            EventType::Sleep => "sleep",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(EventType::Text),
            "image_generation" => Some(EventType::ImageGeneration),
            "wake_up" => Some(EventType::WakeUp),
            "sleep" => Some(EventType::Sleep),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    #[serde(rename = "pending")]
    Pending,
    /// Transient claim marker set by the due-sweep's compare-and-swap so two
    /// sweep cycles can never fire the same event.
    #[serde(rename = "in_flight")]
    InFlight,
    #[serde(rename = "rescheduled")]
    Rescheduled,
    #[serde(rename = "sent")]
    Sent,
    /// Execution failed but attempts remain; re-claimable by the sweep.
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::InFlight => "in_flight",
            EventStatus::Rescheduled => "rescheduled",
            EventStatus::Sent => "sent",
            EventStatus::Failed => "failed",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(EventStatus::Pending),
            "in_flight" => Some(EventStatus::InFlight),
            "rescheduled" => Some(EventStatus::Rescheduled),
            "sent" => Some(EventStatus::Sent),
            "failed" => Some(EventStatus::Failed),
            "cancelled" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Sent | EventStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: EventId,
    pub persona_id: PersonaId,
    pub user_id: Option<UserId>,
    pub event_type: EventType,
    /// An instruction, not final message text. Expanded at fire time against
    /// the persona's live fact store.
    pub context_prompt: String,
    pub scheduled_at: String, // RFC3339, advanced on every defer
    pub status: EventStatus,
    pub attempts: i64,
    pub created_at: String, // RFC3339
    pub updated_at: String, // RFC3339
}

// ============================================================================
// Activity Record Schema
// ============================================================================

/// One row per user holding only the latest inbound-interaction timestamp.
/// Overwritten on every message; read by the scheduler's defer decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub user_id: UserId,
    pub last_interaction_at: String, // RFC3339
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectRequest {
    pub persona_id: PersonaId,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsResponse {
    pub facts: Vec<Fact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub persona_id: PersonaId,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// True when the extraction response was malformed and the whole batch
    /// was discarded.
    pub discarded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidateResponse {
    pub updated: usize,
    pub deleted: usize,
    /// True when the summarization response was malformed and the run was a
    /// no-op.
    pub skipped: bool,
}

/// Direct upsert into a one-fact-per-category slot (outfit, mood), used by
/// flows that set state outside a reconciliation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertFactRequest {
    pub persona_id: PersonaId,
    pub target: FactTarget,
    pub category: String,
    pub value: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePersonaRequest {
    pub name: String,
    pub description: String,
    pub chat_url: Option<String>,
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEventRequest {
    pub persona_id: PersonaId,
    pub user_id: Option<UserId>,
    pub event_type: EventType,
    pub context_prompt: String,
    pub scheduled_at: String, // RFC3339
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_persona_id() -> PersonaId {
    PersonaId(format!("persona_{}", ulid::Ulid::new()))
}

pub fn generate_fact_id() -> FactId {
    FactId(format!("fact_{}", ulid::Ulid::new()))
}

pub fn generate_event_id() -> EventId {
    EventId(format!("evt_{}", ulid::Ulid::new()))
}

pub fn generate_user_id() -> UserId {
    UserId(format!("user_{}", ulid::Ulid::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let persona_id = generate_persona_id();
        assert!(persona_id.0.starts_with("persona_"));
        assert_eq!(persona_id.0.len(), 34); // "persona_" + 26 chars

        let fact_id = generate_fact_id();
        assert!(fact_id.0.starts_with("fact_"));

        let event_id = generate_event_id();
        assert!(event_id.0.starts_with("evt_"));

        let user_id = generate_user_id();
        assert!(user_id.0.starts_with("user_"));
    }

    #[test]
    fn test_fact_target_serialization() {
        // The persona side serializes as "self" on the wire; "self" is not a
        // usable variant name in Rust.
        let json = serde_json::to_string(&FactTarget::Persona).unwrap();
        assert_eq!(json, "\"self\"");
        let json = serde_json::to_string(&FactTarget::User).unwrap();
        assert_eq!(json, "\"user\"");

        assert_eq!(FactTarget::parse("self"), Some(FactTarget::Persona));
        assert_eq!(FactTarget::parse("user"), Some(FactTarget::User));
        assert_eq!(FactTarget::parse("bot"), None);
    }

    #[test]
    fn test_fact_serialization() {
        let fact = Fact {
            id: generate_fact_id(),
            persona_id: generate_persona_id(),
            target: FactTarget::User,
            category: "favorite_drink".to_string(),
            value: "oat milk latte".to_string(),
            context: Some("mentioned during morning chat".to_string()),
            importance: IMPORTANCE_DEFAULT,
            created_at: "2025-11-02T18:00:00Z".to_string(),
            updated_at: "2025-11-02T18:00:00Z".to_string(),
            last_consolidated_at: None,
        };

        let json = serde_json::to_string(&fact).unwrap();
        let deserialized: Fact = serde_json::from_str(&json).unwrap();
        assert_eq!(fact.value, deserialized.value);
        assert_eq!(fact.category, deserialized.category);
    }

    #[test]
    fn test_fact_diff_deserialization() {
        let raw = r#"{
            "add": [
                {"target": "user", "category": "favorite_drink", "value": "oat milk latte"}
            ],
            "update": [
                {"id": "fact_01ABC", "value": "Sad because ignored"}
            ],
            "remove": ["fact_01DEF"]
        }"#;

        let diff: FactDiff = serde_json::from_str(raw).unwrap();
        assert_eq!(diff.add.len(), 1);
        assert_eq!(diff.update.len(), 1);
        assert_eq!(diff.remove.len(), 1);
        assert_eq!(diff.add[0].target, FactTarget::User);
        assert!(diff.add[0].context.is_none());
        assert!(!diff.is_empty());
        assert!(FactDiff::default().is_empty());
    }

    #[test]
    fn test_event_status_round_trip() {
        for status in [
            EventStatus::Pending,
            EventStatus::InFlight,
            EventStatus::Rescheduled,
            EventStatus::Sent,
            EventStatus::Failed,
            EventStatus::Cancelled,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert!(EventStatus::Sent.is_terminal());
        assert!(EventStatus::Cancelled.is_terminal());
        assert!(!EventStatus::Failed.is_terminal());
        assert!(!EventStatus::InFlight.is_terminal());
    }

    #[test]
    fn test_scheduled_event_serialization() {
        let event = ScheduledEvent {
            id: generate_event_id(),
            persona_id: generate_persona_id(),
            user_id: Some(generate_user_id()),
            event_type: EventType::Text,
            context_prompt: "Send a morning greeting, ask how they slept".to_string(),
            scheduled_at: "2025-11-03T08:00:00Z".to_string(),
            status: EventStatus::Pending,
            attempts: 0,
            created_at: "2025-11-02T22:00:00Z".to_string(),
            updated_at: "2025-11-02T22:00:00Z".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"text\""));
        assert!(json.contains("\"pending\""));
        let restored: ScheduledEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.context_prompt, event.context_prompt);
        assert_eq!(restored.status, EventStatus::Pending);
    }
}
