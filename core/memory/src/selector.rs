use anyhow::Result;
use chrono::{Duration, Utc};
use companion_schemas::{Fact, FactId, PersonaId};
use std::collections::HashSet;
use tracing::debug;

use crate::database::Database;

/// Categories that are always injected into prompts regardless of recency
/// or topic. Also the set consolidation may never prune.
pub const CORE_CATEGORIES: &[&str] = &[
    "outfit",
    "identity",
    "name",
    "age",
    "location",
    "current_mood",
];

/// Static topic table: if the inbound text contains any keyword of a row,
/// every category of that row joins the match set. Evaluated in order,
/// short-circuiting per row, not per keyword. Plain substring matching by
/// design - no stemming, no NLP.
const KEYWORD_MAP: &[(&[&str], &[&str])] = &[
    (
        &["eat", "food", "hungry", "dinner", "lunch", "breakfast", "cook", "snack", "meal"],
        &["food_preference", "favorite_food", "diet"],
    ),
    (
        &["drink", "coffee", "tea", "thirsty", "juice"],
        &["favorite_drink", "drink_preference"],
    ),
    (
        &["work", "job", "office", "boss", "meeting", "deadline", "colleague"],
        &["job", "work_situation", "career_goal"],
    ),
    (
        &["family", "mother", "father", "mom", "dad", "sister", "brother", "parents"],
        &["family"],
    ),
    (
        &["sleep", "tired", "nap", "bed", "dream", "insomnia"],
        &["sleep_habit", "daily_routine"],
    ),
    (
        &["music", "song", "listen", "band", "concert", "playlist"],
        &["music_taste", "favorite_artist"],
    ),
    (
        &["movie", "film", "watch", "series", "show", "anime"],
        &["movie_taste", "favorite_show"],
    ),
    (&["pet", "dog", "cat", "puppy", "kitten"], &["pets"]),
    (
        &["travel", "trip", "vacation", "holiday", "flight", "abroad"],
        &["travel_plans", "favorite_place"],
    ),
    (
        &["sad", "happy", "angry", "upset", "anxious", "excited", "lonely", "feel", "feeling"],
        &["current_mood", "emotional_trigger"],
    ),
    (
        &["hobby", "hobbies", "weekend", "free time", "game", "play", "sport"],
        &["hobby", "interest"],
    ),
];

/// Tiered relevance selection over a persona's fact store.
///
/// Three filters are unioned and deduplicated by id: recently updated
/// facts, facts in the always-needed core categories, and facts whose
/// category matches a topic keyword in the inbound text. The result is an
/// unordered set; callers group by target when rendering prompts.
pub struct RelevanceSelector {
    recency_window: Duration,
}

impl Default for RelevanceSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl RelevanceSelector {
    pub fn new() -> Self {
        Self {
            recency_window: Duration::days(3),
        }
    }

    pub fn with_recency_window(days: i64) -> Self {
        Self {
            recency_window: Duration::days(days),
        }
    }

    /// Pure read: selects the bounded fact subset for prompt injection.
    /// An empty store yields an empty vec; the caller substitutes a
    /// "no memories yet" placeholder.
    pub fn select(
        &self,
        db: &Database,
        persona_id: &PersonaId,
        inbound_text: &str,
    ) -> Result<Vec<Fact>> {
        let cutoff = (Utc::now() - self.recency_window).to_rfc3339();

        let recent = db.facts_updated_since(persona_id, &cutoff)?;
        let core = db.facts_in_categories(persona_id, CORE_CATEGORIES)?;

        let matched_categories = Self::match_categories(inbound_text);
        let keyword = db.facts_in_categories(persona_id, &matched_categories)?;

        let mut seen: HashSet<FactId> = HashSet::new();
        let mut selected = Vec::new();
        for fact in recent.into_iter().chain(core).chain(keyword) {
            if seen.insert(fact.id.clone()) {
                selected.push(fact);
            }
        }

        debug!(
            "Selected {} facts for {} ({} keyword categories matched)",
            selected.len(),
            persona_id,
            matched_categories.len()
        );
        Ok(selected)
    }

    /// Scan the lowercased inbound text against the keyword table.
    fn match_categories(inbound_text: &str) -> Vec<&'static str> {
        let lowered = inbound_text.to_lowercase();
        let mut categories = Vec::new();

        for (keywords, mapped) in KEYWORD_MAP {
            if keywords.iter().any(|kw| lowered.contains(kw)) {
                for category in *mapped {
                    if !categories.contains(category) {
                        categories.push(*category);
                    }
                }
            }
        }

        categories
    }
}
