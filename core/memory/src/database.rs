use anyhow::Result;
use chrono::Utc;
use companion_schemas::{
    generate_fact_id, ActivityRecord, ConsolidationPlan, Fact, FactDiff, FactDraft, FactId,
    FactTarget, Persona, PersonaId, UserId, IMPORTANCE_DEFAULT, IMPORTANCE_MAX, IMPORTANCE_MIN,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Categories that hold exactly one fact per persona. A diff add for one
/// of these replaces the existing row instead of stacking a duplicate.
pub const SINGLE_INSTANCE_CATEGORIES: &[&str] = &["outfit", "current_mood"];

/// Counts of the mutations actually applied from a reconciliation diff,
/// after ownership filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedDiff {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Counts of the mutations actually applied from a consolidation plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedPlan {
    pub updated: usize,
    pub deleted: usize,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Initialize database with schema
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self { conn };
        db.init_schema()?;

        info!("Database initialized");
        Ok(db)
    }

    /// Create all tables and indexes
    fn init_schema(&self) -> Result<()> {
        // Personas (fact and event owner)
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS personas (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                chat_url TEXT,
                user_id TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        // Facts (durable memory entries, one owner each)
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                persona_id TEXT NOT NULL,
                target TEXT NOT NULL,
                category TEXT NOT NULL,
                value TEXT NOT NULL,
                context TEXT,
                importance INTEGER NOT NULL DEFAULT 5,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_consolidated_at TEXT,
                FOREIGN KEY (persona_id) REFERENCES personas(id) ON DELETE CASCADE
            )",
            [],
        )?;

        // Activity records (one row per user, overwritten on every message)
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS activity (
                user_id TEXT PRIMARY KEY,
                last_interaction_at TEXT NOT NULL
            )",
            [],
        )?;

        // Indexes for the selector's tier queries
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_facts_persona_category ON facts(persona_id, category)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_facts_persona_updated ON facts(persona_id, updated_at DESC)",
            [],
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========== PERSONAS ==========

    pub fn insert_persona(&self, persona: &Persona) -> Result<()> {
        self.conn.execute(
            "INSERT INTO personas (id, name, description, chat_url, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                persona.id.0,
                persona.name,
                persona.description,
                persona.chat_url,
                persona.user_id.as_ref().map(|u| u.0.as_str()),
                persona.created_at,
            ],
        )?;

        debug!("Inserted persona: {}", persona.id);
        Ok(())
    }

    pub fn get_persona(&self, id: &PersonaId) -> Result<Option<Persona>> {
        let persona = self
            .conn
            .query_row(
                "SELECT id, name, description, chat_url, user_id, created_at
                 FROM personas WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok(Persona {
                        id: PersonaId(row.get(0)?),
                        name: row.get(1)?,
                        description: row.get(2)?,
                        chat_url: row.get(3)?,
                        user_id: row.get::<_, Option<String>>(4)?.map(UserId),
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;

        Ok(persona)
    }

    /// Delete a persona and everything it owns. Facts go in the same
    /// transaction so a crash can never leave orphans.
    pub fn delete_persona(&self, id: &PersonaId) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM facts WHERE persona_id = ?1", params![id.0])?;
        let removed = tx.execute("DELETE FROM personas WHERE id = ?1", params![id.0])?;
        tx.commit()?;

        info!("Deleted persona {} (existed: {})", id, removed > 0);
        Ok(removed > 0)
    }

    // ========== FACTS ==========

    fn row_to_fact(row: &Row) -> rusqlite::Result<Fact> {
        let target_raw: String = row.get(2)?;
        // Unknown target values should never exist; default to user rather
        // than failing the whole query.
        let target = FactTarget::parse(&target_raw).unwrap_or(FactTarget::User);

        Ok(Fact {
            id: FactId(row.get(0)?),
            persona_id: PersonaId(row.get(1)?),
            target,
            category: row.get(3)?,
            value: row.get(4)?,
            context: row.get(5)?,
            importance: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            last_consolidated_at: row.get(9)?,
        })
    }

    const FACT_COLUMNS: &'static str = "id, persona_id, target, category, value, context,
                importance, created_at, updated_at, last_consolidated_at";

    pub fn insert_fact(&self, fact: &Fact) -> Result<()> {
        self.conn.execute(
            "INSERT INTO facts (id, persona_id, target, category, value, context,
                                importance, created_at, updated_at, last_consolidated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                fact.id.0,
                fact.persona_id.0,
                fact.target.as_str(),
                fact.category,
                fact.value,
                fact.context,
                fact.importance,
                fact.created_at,
                fact.updated_at,
                fact.last_consolidated_at,
            ],
        )?;

        debug!("Inserted fact: {} (category: {})", fact.id, fact.category);
        Ok(())
    }

    /// Create a fact from a reconciliation draft with a fresh id and
    /// default importance.
    pub fn create_fact(&self, persona_id: &PersonaId, draft: &FactDraft) -> Result<Fact> {
        let now = Utc::now().to_rfc3339();
        let fact = Fact {
            id: generate_fact_id(),
            persona_id: persona_id.clone(),
            target: draft.target,
            category: draft.category.clone(),
            value: draft.value.clone(),
            context: draft.context.clone(),
            importance: IMPORTANCE_DEFAULT,
            created_at: now.clone(),
            updated_at: now,
            last_consolidated_at: None,
        };

        self.insert_fact(&fact)?;
        Ok(fact)
    }

    pub fn get_fact(&self, id: &FactId) -> Result<Option<Fact>> {
        let query = format!("SELECT {} FROM facts WHERE id = ?1", Self::FACT_COLUMNS);
        let fact = self
            .conn
            .query_row(&query, params![id.0], Self::row_to_fact)
            .optional()?;

        Ok(fact)
    }

    pub fn facts_for_persona(&self, persona_id: &PersonaId) -> Result<Vec<Fact>> {
        let query = format!(
            "SELECT {} FROM facts WHERE persona_id = ?1 ORDER BY updated_at DESC",
            Self::FACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;

        let facts = stmt
            .query_map(params![persona_id.0], Self::row_to_fact)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(facts)
    }

    /// Facts updated at or after the given RFC3339 cutoff (recency tier).
    pub fn facts_updated_since(&self, persona_id: &PersonaId, cutoff: &str) -> Result<Vec<Fact>> {
        let query = format!(
            "SELECT {} FROM facts
             WHERE persona_id = ?1 AND updated_at >= ?2
             ORDER BY updated_at DESC",
            Self::FACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&query)?;

        let facts = stmt
            .query_map(params![persona_id.0, cutoff], Self::row_to_fact)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(facts)
    }

    /// Facts whose category is in the given set (core and keyword tiers).
    pub fn facts_in_categories(
        &self,
        persona_id: &PersonaId,
        categories: &[&str],
    ) -> Result<Vec<Fact>> {
        if categories.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..categories.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT {} FROM facts
             WHERE persona_id = ?1 AND category IN ({})
             ORDER BY updated_at DESC",
            Self::FACT_COLUMNS,
            placeholders
        );

        let mut stmt = self.conn.prepare(&query)?;
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&persona_id.0];
        for category in categories {
            values.push(category);
        }

        let facts = stmt
            .query_map(values.as_slice(), Self::row_to_fact)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(facts)
    }

    /// One-fact-per-category semantics for categories like outfit and mood:
    /// update the existing row if present, insert otherwise.
    pub fn upsert_fact_by_category(
        &self,
        persona_id: &PersonaId,
        target: FactTarget,
        category: &str,
        value: &str,
        context: Option<&str>,
    ) -> Result<Fact> {
        let now = Utc::now().to_rfc3339();

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM facts WHERE persona_id = ?1 AND category = ?2
                 ORDER BY updated_at DESC LIMIT 1",
                params![persona_id.0, category],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            self.conn.execute(
                "UPDATE facts SET target = ?1, value = ?2, context = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![target.as_str(), value, context, now, id],
            )?;

            let fact_id = FactId(id);
            debug!("Upserted fact {} in category {}", fact_id, category);
            return Ok(self
                .get_fact(&fact_id)?
                .expect("fact row vanished during upsert"));
        }

        self.create_fact(
            persona_id,
            &FactDraft {
                target,
                category: category.to_string(),
                value: value.to_string(),
                context: context.map(|c| c.to_string()),
            },
        )
    }

    pub fn count_facts(&self, persona_id: &PersonaId) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE persona_id = ?1",
            params![persona_id.0],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========== RECONCILIATION APPLY ==========

    /// Apply an add/update/remove diff inside one transaction.
    ///
    /// Updates and removes referencing facts not owned by the persona are
    /// filtered out (authorization boundary), not errors. Applied in
    /// add -> update -> remove order so a remove targeting an updated id
    /// wins. Adds to a single-instance category count as updates when a
    /// row already exists.
    pub fn apply_diff(&self, persona_id: &PersonaId, diff: &FactDiff) -> Result<AppliedDiff> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut applied = AppliedDiff::default();

        for draft in &diff.add {
            // Single-instance categories replace in place so a mood or
            // outfit add can never pile up duplicate rows.
            if SINGLE_INSTANCE_CATEGORIES.contains(&draft.category.as_str()) {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT id FROM facts WHERE persona_id = ?1 AND category = ?2
                         ORDER BY updated_at DESC LIMIT 1",
                        params![persona_id.0, draft.category],
                        |row| row.get(0),
                    )
                    .optional()?;

                if let Some(id) = existing {
                    tx.execute(
                        "UPDATE facts SET target = ?1, value = ?2, context = ?3, updated_at = ?4
                         WHERE id = ?5",
                        params![draft.target.as_str(), draft.value, draft.context, now, id],
                    )?;
                    applied.updated += 1;
                    continue;
                }
            }

            let fact_id = generate_fact_id();
            tx.execute(
                "INSERT INTO facts (id, persona_id, target, category, value, context,
                                    importance, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    fact_id.0,
                    persona_id.0,
                    draft.target.as_str(),
                    draft.category,
                    draft.value,
                    draft.context,
                    IMPORTANCE_DEFAULT,
                    now,
                ],
            )?;
            applied.added += 1;
        }

        for update in &diff.update {
            let changed = tx.execute(
                "UPDATE facts
                 SET value = ?1,
                     context = COALESCE(?2, context),
                     updated_at = ?3
                 WHERE id = ?4 AND persona_id = ?5",
                params![update.value, update.context, now, update.id.0, persona_id.0],
            )?;

            if changed == 0 {
                warn!(
                    "Skipping update for fact {} - not owned by persona {}",
                    update.id, persona_id
                );
            } else {
                applied.updated += 1;
            }
        }

        for id in &diff.remove {
            let removed = tx.execute(
                "DELETE FROM facts WHERE id = ?1 AND persona_id = ?2",
                params![id.0, persona_id.0],
            )?;

            if removed == 0 {
                warn!(
                    "Skipping remove for fact {} - not owned by persona {}",
                    id, persona_id
                );
            } else {
                applied.removed += 1;
            }
        }

        tx.commit()?;

        info!(
            "Applied diff for {}: +{} ~{} -{}",
            persona_id, applied.added, applied.updated, applied.removed
        );
        Ok(applied)
    }

    // ========== CONSOLIDATION APPLY ==========

    /// Apply a consolidation plan inside one transaction.
    ///
    /// Importance is clamped to [1, 10] at the store boundary. Delete ids
    /// are filtered to facts the persona owns, and categories named in
    /// `protected_categories` are exempt from deletion so the summarizer
    /// can never prune facts the retrieval core tier depends on.
    ///
    /// Updates touch `last_consolidated_at` only: `updated_at` tracks
    /// conversational recency, and a maintenance pass must not drag every
    /// rewritten fact into the recency tier.
    pub fn apply_consolidation(
        &self,
        persona_id: &PersonaId,
        plan: &ConsolidationPlan,
        protected_categories: &[&str],
    ) -> Result<AppliedPlan> {
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        let protected: HashSet<&str> = protected_categories.iter().copied().collect();
        let mut applied = AppliedPlan::default();

        for update in &plan.update {
            let importance = update.importance.clamp(IMPORTANCE_MIN, IMPORTANCE_MAX);
            let changed = tx.execute(
                "UPDATE facts
                 SET value = ?1, importance = ?2, last_consolidated_at = ?3
                 WHERE id = ?4 AND persona_id = ?5",
                params![update.value, importance, now, update.id.0, persona_id.0],
            )?;

            if changed == 0 {
                warn!(
                    "Skipping consolidation update for fact {} - not owned by persona {}",
                    update.id, persona_id
                );
            } else {
                applied.updated += 1;
            }
        }

        for id in &plan.delete {
            let category: Option<String> = tx
                .query_row(
                    "SELECT category FROM facts WHERE id = ?1 AND persona_id = ?2",
                    params![id.0, persona_id.0],
                    |row| row.get(0),
                )
                .optional()?;

            match category {
                None => {
                    warn!(
                        "Skipping consolidation delete for fact {} - not owned by persona {}",
                        id, persona_id
                    );
                }
                Some(category) if protected.contains(category.as_str()) => {
                    debug!(
                        "Keeping fact {} - category {} is protected from pruning",
                        id, category
                    );
                }
                Some(_) => {
                    tx.execute("DELETE FROM facts WHERE id = ?1", params![id.0])?;
                    applied.deleted += 1;
                }
            }
        }

        tx.commit()?;

        info!(
            "Applied consolidation for {}: ~{} -{}",
            persona_id, applied.updated, applied.deleted
        );
        Ok(applied)
    }

    // ========== ACTIVITY TRACKER ==========

    /// Overwrite the user's latest-interaction timestamp.
    pub fn set_activity(&self, user_id: &UserId, at: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO activity (user_id, last_interaction_at)
             VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_interaction_at = excluded.last_interaction_at",
            params![user_id.0, at],
        )?;

        debug!("Recorded activity for {}", user_id);
        Ok(())
    }

    pub fn get_activity(&self, user_id: &UserId) -> Result<Option<ActivityRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT user_id, last_interaction_at FROM activity WHERE user_id = ?1",
                params![user_id.0],
                |row| {
                    Ok(ActivityRecord {
                        user_id: UserId(row.get(0)?),
                        last_interaction_at: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_schemas::{generate_persona_id, generate_user_id, ConsolidationUpdate, FactUpdate};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database, PersonaId) {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(tmp.path().join("memory.db")).unwrap();

        let persona_id = generate_persona_id();
        db.insert_persona(&Persona {
            id: persona_id.clone(),
            name: "Mika".to_string(),
            description: "A cheerful companion".to_string(),
            chat_url: None,
            user_id: None,
            created_at: Utc::now().to_rfc3339(),
        })
        .unwrap();

        (tmp, db, persona_id)
    }

    fn draft(target: FactTarget, category: &str, value: &str) -> FactDraft {
        FactDraft {
            target,
            category: category.to_string(),
            value: value.to_string(),
            context: None,
        }
    }

    #[test]
    fn create_and_get_fact() {
        let (_tmp, db, persona_id) = setup();

        let fact = db
            .create_fact(&persona_id, &draft(FactTarget::User, "favorite_drink", "oat milk latte"))
            .unwrap();
        assert!(fact.id.0.starts_with("fact_"));
        assert_eq!(fact.importance, IMPORTANCE_DEFAULT);

        let loaded = db.get_fact(&fact.id).unwrap().unwrap();
        assert_eq!(loaded.value, "oat milk latte");
        assert_eq!(loaded.target, FactTarget::User);
        assert!(loaded.last_consolidated_at.is_none());
    }

    #[test]
    fn facts_in_categories_filters() {
        let (_tmp, db, persona_id) = setup();
        db.create_fact(&persona_id, &draft(FactTarget::User, "favorite_food", "sushi"))
            .unwrap();
        db.create_fact(&persona_id, &draft(FactTarget::User, "job", "engineer"))
            .unwrap();

        let facts = db
            .facts_in_categories(&persona_id, &["favorite_food", "diet"])
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].category, "favorite_food");

        assert!(db.facts_in_categories(&persona_id, &[]).unwrap().is_empty());
    }

    #[test]
    fn upsert_by_category_keeps_one_row() {
        let (_tmp, db, persona_id) = setup();

        let first = db
            .upsert_fact_by_category(&persona_id, FactTarget::Persona, "current_mood", "Happy because sunny", None)
            .unwrap();
        let second = db
            .upsert_fact_by_category(&persona_id, FactTarget::Persona, "current_mood", "Sad because rain", None)
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.value, "Sad because rain");
        assert_eq!(db.count_facts(&persona_id).unwrap(), 1);
    }

    #[test]
    fn apply_diff_add_update_remove() {
        let (_tmp, db, persona_id) = setup();
        let mood = db
            .create_fact(&persona_id, &draft(FactTarget::Persona, "current_mood", "Happy because sunny"))
            .unwrap();
        let food = db
            .create_fact(&persona_id, &draft(FactTarget::User, "favorite_food", "sushi"))
            .unwrap();

        let diff = FactDiff {
            add: vec![draft(FactTarget::User, "favorite_drink", "oat milk latte")],
            update: vec![FactUpdate {
                id: mood.id.clone(),
                value: "Sad because ignored".to_string(),
                context: None,
            }],
            remove: vec![food.id.clone()],
        };

        let applied = db.apply_diff(&persona_id, &diff).unwrap();
        assert_eq!(applied, AppliedDiff { added: 1, updated: 1, removed: 1 });

        assert_eq!(db.get_fact(&mood.id).unwrap().unwrap().value, "Sad because ignored");
        assert!(db.get_fact(&food.id).unwrap().is_none());
        assert_eq!(db.count_facts(&persona_id).unwrap(), 2);
    }

    #[test]
    fn apply_diff_add_replaces_single_instance_category() {
        let (_tmp, db, persona_id) = setup();
        let mood = db
            .create_fact(&persona_id, &draft(FactTarget::Persona, "current_mood", "Happy because sunny"))
            .unwrap();

        let diff = FactDiff {
            add: vec![draft(FactTarget::Persona, "current_mood", "Sad because rain")],
            update: vec![],
            remove: vec![],
        };

        let applied = db.apply_diff(&persona_id, &diff).unwrap();
        assert_eq!(applied, AppliedDiff { added: 0, updated: 1, removed: 0 });
        assert_eq!(db.count_facts(&persona_id).unwrap(), 1);
        assert_eq!(
            db.get_fact(&mood.id).unwrap().unwrap().value,
            "Sad because rain"
        );
    }

    #[test]
    fn apply_diff_remove_wins_over_update() {
        let (_tmp, db, persona_id) = setup();
        let fact = db
            .create_fact(&persona_id, &draft(FactTarget::User, "hobby", "chess"))
            .unwrap();

        let diff = FactDiff {
            add: vec![],
            update: vec![FactUpdate {
                id: fact.id.clone(),
                value: "speed chess".to_string(),
                context: None,
            }],
            remove: vec![fact.id.clone()],
        };

        db.apply_diff(&persona_id, &diff).unwrap();
        assert!(db.get_fact(&fact.id).unwrap().is_none());
    }

    #[test]
    fn apply_diff_rejects_cross_persona_mutations() {
        let (_tmp, db, persona_id) = setup();

        let other_id = generate_persona_id();
        db.insert_persona(&Persona {
            id: other_id.clone(),
            name: "Rival".to_string(),
            description: "Another persona".to_string(),
            chat_url: None,
            user_id: None,
            created_at: Utc::now().to_rfc3339(),
        })
        .unwrap();
        let foreign = db
            .create_fact(&other_id, &draft(FactTarget::User, "secret", "do not touch"))
            .unwrap();

        let diff = FactDiff {
            add: vec![],
            update: vec![FactUpdate {
                id: foreign.id.clone(),
                value: "overwritten".to_string(),
                context: None,
            }],
            remove: vec![foreign.id.clone()],
        };

        let applied = db.apply_diff(&persona_id, &diff).unwrap();
        assert_eq!(applied, AppliedDiff::default());
        assert_eq!(db.get_fact(&foreign.id).unwrap().unwrap().value, "do not touch");
    }

    #[test]
    fn apply_consolidation_clamps_importance_and_protects_core() {
        let (_tmp, db, persona_id) = setup();
        let mood = db
            .create_fact(&persona_id, &draft(FactTarget::Persona, "current_mood", "Happy because sunny"))
            .unwrap();
        let trivia = db
            .create_fact(&persona_id, &draft(FactTarget::User, "weather_smalltalk", "it rained once"))
            .unwrap();

        let plan = ConsolidationPlan {
            update: vec![ConsolidationUpdate {
                id: mood.id.clone(),
                value: "Happy because sunny".to_string(),
                importance: 42,
            }],
            delete: vec![mood.id.clone(), trivia.id.clone()],
        };

        let applied = db
            .apply_consolidation(&persona_id, &plan, &["current_mood"])
            .unwrap();
        assert_eq!(applied.updated, 1);
        assert_eq!(applied.deleted, 1);

        let kept = db.get_fact(&mood.id).unwrap().unwrap();
        assert_eq!(kept.importance, IMPORTANCE_MAX);
        assert!(kept.last_consolidated_at.is_some());
        // Recency belongs to conversation, not maintenance.
        assert_eq!(kept.updated_at, mood.updated_at);
        assert!(db.get_fact(&trivia.id).unwrap().is_none());
    }

    #[test]
    fn delete_persona_cascades_to_facts() {
        let (_tmp, db, persona_id) = setup();
        let fact = db
            .create_fact(&persona_id, &draft(FactTarget::User, "name", "Sam"))
            .unwrap();

        assert!(db.delete_persona(&persona_id).unwrap());
        assert!(db.get_persona(&persona_id).unwrap().is_none());
        assert!(db.get_fact(&fact.id).unwrap().is_none());
    }

    #[test]
    fn activity_record_is_overwritten() {
        let (_tmp, db, _persona_id) = setup();
        let user_id = generate_user_id();

        assert!(db.get_activity(&user_id).unwrap().is_none());

        db.set_activity(&user_id, "2025-11-02T18:00:00+00:00").unwrap();
        db.set_activity(&user_id, "2025-11-02T19:30:00+00:00").unwrap();

        let record = db.get_activity(&user_id).unwrap().unwrap();
        assert_eq!(record.last_interaction_at, "2025-11-02T19:30:00+00:00");
    }
}
