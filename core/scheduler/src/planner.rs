use anyhow::Result;
use chrono::{DateTime, Utc};
use companion_schemas::{EventType, Persona, UserId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::event_store::EventStore;
use crate::generation::GenerationClient;

/// Hard cap on how many events a single planning run may schedule.
pub const MAX_PLANNED_EVENTS: usize = 8;

/// One entry of a parsed day plan, ready to become a pending event.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEvent {
    pub event_type: EventType,
    pub scheduled_at: String,
    pub context_prompt: String,
}

#[derive(Debug)]
pub enum ParsedDayPlan {
    Valid(Vec<PlannedEvent>),
    Malformed(String),
}

/// Parse the planning response. Same tolerance policy as the memory
/// service's diff parsing: a broken top level voids the run, broken
/// entries are skipped.
pub fn parse_day_plan(raw: &str) -> ParsedDayPlan {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return ParsedDayPlan::Malformed(format!("not valid JSON: {}", e)),
    };

    let entries = match value.get("events").and_then(Value::as_array) {
        Some(arr) => arr,
        None => return ParsedDayPlan::Malformed("missing or non-array key 'events'".to_string()),
    };

    let mut planned = Vec::new();
    for entry in entries {
        match parse_entry(entry) {
            Some(event) => planned.push(event),
            None => warn!("Skipping unusable plan entry: {}", entry),
        }
    }

    if planned.len() > MAX_PLANNED_EVENTS {
        warn!(
            "Plan produced {} events, truncating to {}",
            planned.len(),
            MAX_PLANNED_EVENTS
        );
        planned.truncate(MAX_PLANNED_EVENTS);
    }

    ParsedDayPlan::Valid(planned)
}

fn parse_entry(entry: &Value) -> Option<PlannedEvent> {
    let event_type = EventType::parse(entry.get("event_type")?.as_str()?)?;
    // The backend may answer in any offset; the event store orders
    // timestamps lexically, so normalize to UTC here.
    let scheduled_at = DateTime::parse_from_rfc3339(entry.get("scheduled_at")?.as_str()?)
        .ok()?
        .with_timezone(&Utc)
        .to_rfc3339();

    let context_prompt = entry
        .get("context_prompt")?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())?;

    Some(PlannedEvent {
        event_type,
        scheduled_at,
        context_prompt: context_prompt.to_string(),
    })
}

/// Build the day-planning prompt for a persona.
pub fn build_planning_prompt(persona: &Persona, day_start: &str) -> String {
    format!(
        r#"You plan the day of the companion persona described below. Decide when the persona should proactively reach out today and why.

Persona:
{description}

The day starts at {day_start} (all times must be RFC3339 with offset, on this same day).

Return a JSON object with exactly this shape:
{{
  "events": [
    {{"event_type": "wake_up|text|image_generation|sleep", "scheduled_at": "RFC3339 timestamp", "context_prompt": "instruction for the message, not the message itself"}}
  ]
}}

Rules:
- At most {max} events.
- Typically one wake_up early, one sleep late, and a few text check-ins in between.
- context_prompt is an instruction like "Ask how the presentation went", never final message text.
- Order events chronologically."#,
        description = persona.description,
        day_start = day_start,
        max = MAX_PLANNED_EVENTS,
    )
}

const PLANNING_SYSTEM: &str =
    "You are a day-planning assistant. Return only valid JSON matching the requested schema.";

/// Generates a persona's proactive schedule for the day and stores it as
/// pending events. A failed or malformed run plans nothing; yesterday's
/// leftovers are untouched either way.
pub struct DayPlanner {
    generation: Arc<GenerationClient>,
}

impl DayPlanner {
    pub fn new(generation: Arc<GenerationClient>) -> Self {
        Self { generation }
    }

    pub async fn plan_day(
        &self,
        store: &Arc<Mutex<EventStore>>,
        persona: &Persona,
        user_id: Option<UserId>,
    ) -> Result<usize> {
        let day_start = Utc::now().to_rfc3339();
        let prompt = build_planning_prompt(persona, &day_start);

        let raw = match self.generation.complete_json(PLANNING_SYSTEM, &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Planning call failed for {}: {}", persona.id, e);
                return Ok(0);
            }
        };

        let planned = match parse_day_plan(&raw) {
            ParsedDayPlan::Valid(planned) => planned,
            ParsedDayPlan::Malformed(reason) => {
                error!("Discarding day plan for {}: {}", persona.id, reason);
                return Ok(0);
            }
        };

        let store = store.lock().await;
        let mut inserted = 0;
        for event in &planned {
            store.create_event(&companion_schemas::CreateEventRequest {
                persona_id: persona.id.clone(),
                user_id: user_id.clone(),
                event_type: event.event_type,
                context_prompt: event.context_prompt.clone(),
                scheduled_at: event.scheduled_at.clone(),
            })?;
            inserted += 1;
        }

        info!("Planned {} events for {}", inserted, persona.id);
        Ok(inserted)
    }
}
