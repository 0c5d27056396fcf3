use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use companion_schemas::{
    generate_event_id, CreateEventRequest, EventId, EventStatus, EventType, PersonaId,
    ScheduledEvent, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::{debug, info, warn};

/// Durable store for scheduled events. Status transitions all go through
/// conditional UPDATEs so two sweep cycles can never both act on the same
/// event.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Event store initialized");
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                persona_id TEXT NOT NULL,
                user_id TEXT,
                event_type TEXT NOT NULL,
                context_prompt TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // The sweep's due query scans on (status, scheduled_at)
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_status_scheduled
             ON events(status, scheduled_at)",
            [],
        )?;

        debug!("Event store schema initialized");
        Ok(())
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<ScheduledEvent> {
        let type_raw: String = row.get(3)?;
        let status_raw: String = row.get(6)?;

        Ok(ScheduledEvent {
            id: EventId(row.get(0)?),
            persona_id: PersonaId(row.get(1)?),
            user_id: row.get::<_, Option<String>>(2)?.map(UserId),
            event_type: EventType::parse(&type_raw).unwrap_or(EventType::Text),
            context_prompt: row.get(4)?,
            scheduled_at: row.get(5)?,
            status: EventStatus::parse(&status_raw).unwrap_or(EventStatus::Cancelled),
            attempts: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    const EVENT_COLUMNS: &'static str = "id, persona_id, user_id, event_type, context_prompt,
                scheduled_at, status, attempts, created_at, updated_at";

    pub fn insert_event(&self, event: &ScheduledEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, persona_id, user_id, event_type, context_prompt,
                                 scheduled_at, status, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.id.0,
                event.persona_id.0,
                event.user_id.as_ref().map(|u| u.0.as_str()),
                event.event_type.as_str(),
                event.context_prompt,
                event.scheduled_at,
                event.status.as_str(),
                event.attempts,
                event.created_at,
                event.updated_at,
            ],
        )?;

        debug!("Inserted event {} ({})", event.id, event.event_type.as_str());
        Ok(())
    }

    /// Create a pending event from an API request with a fresh id.
    ///
    /// `scheduled_at` is re-serialized in UTC: the due query orders
    /// timestamps lexically, so an event stored with a non-UTC offset
    /// would fire at the wrong instant.
    pub fn create_event(&self, request: &CreateEventRequest) -> Result<ScheduledEvent> {
        let scheduled_at = DateTime::parse_from_rfc3339(&request.scheduled_at)
            .with_context(|| format!("scheduled_at is not RFC3339: {}", request.scheduled_at))?
            .with_timezone(&Utc)
            .to_rfc3339();

        let now = Utc::now().to_rfc3339();
        let event = ScheduledEvent {
            id: generate_event_id(),
            persona_id: request.persona_id.clone(),
            user_id: request.user_id.clone(),
            event_type: request.event_type,
            context_prompt: request.context_prompt.clone(),
            scheduled_at,
            status: EventStatus::Pending,
            attempts: 0,
            created_at: now.clone(),
            updated_at: now,
        };

        self.insert_event(&event)?;
        Ok(event)
    }

    pub fn get_event(&self, id: &EventId) -> Result<Option<ScheduledEvent>> {
        let query = format!("SELECT {} FROM events WHERE id = ?1", Self::EVENT_COLUMNS);
        let event = self
            .conn
            .query_row(&query, params![id.0], Self::row_to_event)
            .optional()?;

        Ok(event)
    }

    pub fn events_for_persona(&self, persona_id: &PersonaId) -> Result<Vec<ScheduledEvent>> {
        let query = format!(
            "SELECT {} FROM events WHERE persona_id = ?1 ORDER BY scheduled_at ASC",
            Self::EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;

        let events = stmt
            .query_map(params![persona_id.0], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Events ready to fire: pending, rescheduled, or failed-with-retries,
    /// whose scheduled time has passed. In-flight and terminal events are
    /// never returned.
    pub fn due_events(&self, now: &str) -> Result<Vec<ScheduledEvent>> {
        let query = format!(
            "SELECT {} FROM events
             WHERE status IN ('pending', 'rescheduled', 'failed')
               AND scheduled_at <= ?1
             ORDER BY scheduled_at ASC",
            Self::EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;

        let events = stmt
            .query_map(params![now], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// Claim an event for execution. The conditional UPDATE is the
    /// compare-and-swap: it only succeeds while the event is still in a
    /// claimable status, so exactly one claimer wins.
    pub fn claim(&self, id: &EventId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE events SET status = 'in_flight', updated_at = ?1
             WHERE id = ?2 AND status IN ('pending', 'rescheduled', 'failed')",
            params![now, id.0],
        )?;

        if changed == 0 {
            debug!("Event {} already claimed or terminal", id);
        }
        Ok(changed > 0)
    }

    /// Push an event back by setting a new fire time. Used when the user is
    /// mid-conversation at fire time. Only applies while the event is still
    /// in flight; a cancel that landed in the meantime wins.
    pub fn defer(&self, id: &EventId, new_scheduled_at: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE events SET status = 'rescheduled', scheduled_at = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'in_flight'",
            params![new_scheduled_at, now, id.0],
        )?;

        if changed == 0 {
            warn!("Not deferring event {} - no longer in flight", id);
        } else {
            info!("Deferred event {} to {}", id, new_scheduled_at);
        }
        Ok(())
    }

    /// Mark a claimed event delivered. Same in-flight condition as `defer`.
    pub fn mark_sent(&self, id: &EventId) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE events SET status = 'sent', updated_at = ?1
             WHERE id = ?2 AND status = 'in_flight'",
            params![now, id.0],
        )?;

        if changed == 0 {
            warn!("Not marking event {} sent - no longer in flight", id);
        } else {
            info!("Event {} sent", id);
        }
        Ok(())
    }

    /// Record a failed execution attempt. Returns the resulting status:
    /// `Failed` (re-claimable on the next sweep) while attempts remain,
    /// `Cancelled` once the attempt budget is spent.
    pub fn record_failure(&self, id: &EventId, max_attempts: i64) -> Result<EventStatus> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();

        let (status_raw, attempts): (String, i64) = tx.query_row(
            "SELECT status, attempts FROM events WHERE id = ?1",
            params![id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        // A cancel that raced the execution keeps the event cancelled.
        if status_raw != "in_flight" {
            warn!(
                "Not recording failure for event {} - status is {}",
                id, status_raw
            );
            return Ok(EventStatus::parse(&status_raw).unwrap_or(EventStatus::Cancelled));
        }
        let attempts = attempts + 1;

        let status = if attempts >= max_attempts {
            EventStatus::Cancelled
        } else {
            EventStatus::Failed
        };

        tx.execute(
            "UPDATE events SET status = ?1, attempts = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), attempts, now, id.0],
        )?;
        tx.commit()?;

        warn!(
            "Event {} failed (attempt {}/{}) -> {}",
            id,
            attempts,
            max_attempts,
            status.as_str()
        );
        Ok(status)
    }

    /// Manual cancellation. Only non-terminal events can be cancelled;
    /// returns false for sent, already-cancelled, or unknown events.
    pub fn cancel(&self, id: &EventId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE events SET status = 'cancelled', updated_at = ?1
             WHERE id = ?2 AND status NOT IN ('sent', 'cancelled')",
            params![now, id.0],
        )?;

        info!("Cancel event {} (applied: {})", id, changed > 0);
        Ok(changed > 0)
    }
}
