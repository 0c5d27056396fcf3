use anyhow::Result;
use companion_schemas::{
    ConsolidationPlan, ConsolidationUpdate, ConsolidateResponse, Fact, FactId, Persona, PersonaId,
    IMPORTANCE_MAX, IMPORTANCE_MIN,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::llm::LlmClient;
use crate::selector::CORE_CATEGORIES;

/// Outcome of parsing the summarization backend's response.
#[derive(Debug)]
pub enum ParsedPlan {
    Valid(ConsolidationPlan),
    Malformed(String),
}

/// Parse the raw consolidation response into a clean plan.
///
/// Same tolerance policy as reconciliation parsing: the top level must be
/// an object with `update` and `delete` arrays or the run is a no-op;
/// individual broken entries are skipped.
pub fn parse_plan(raw: &str) -> ParsedPlan {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return ParsedPlan::Malformed(format!("not valid JSON: {}", e)),
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => return ParsedPlan::Malformed("top level is not an object".to_string()),
    };

    let updates = match obj.get("update").and_then(Value::as_array) {
        Some(arr) => arr,
        None => return ParsedPlan::Malformed("missing or non-array key 'update'".to_string()),
    };
    let deletes = match obj.get("delete").and_then(Value::as_array) {
        Some(arr) => arr,
        None => return ParsedPlan::Malformed("missing or non-array key 'delete'".to_string()),
    };

    let mut plan = ConsolidationPlan::default();

    for entry in updates {
        match parse_update_entry(entry) {
            Some(update) => plan.update.push(update),
            None => warn!("Skipping incomplete consolidation update: {}", entry),
        }
    }

    for entry in deletes {
        match entry.as_str() {
            Some(id) if !id.is_empty() => plan.delete.push(FactId(id.to_string())),
            _ => warn!("Skipping non-string delete entry: {}", entry),
        }
    }

    ParsedPlan::Valid(plan)
}

fn parse_update_entry(entry: &Value) -> Option<ConsolidationUpdate> {
    let id = entry.get("id")?.as_str().filter(|s| !s.is_empty())?;
    let value = entry.get("value")?.as_str().filter(|s| !s.is_empty())?;
    let importance = entry.get("importance")?.as_i64()?;

    Some(ConsolidationUpdate {
        id: FactId(id.to_string()),
        value: value.to_string(),
        importance,
    })
}

/// Build the consolidation prompt: the full fact listing plus a scoring
/// rubric. Deletion candidates are the backend's call; the store still
/// refuses to drop protected categories.
pub fn build_consolidation_prompt(persona: &Persona, facts: &[Fact]) -> String {
    let listing = facts
        .iter()
        .map(|f| {
            serde_json::json!({
                "id": f.id.0,
                "target": f.target.as_str(),
                "category": f.category,
                "value": f.value,
                "importance": f.importance,
                "updated_at": f.updated_at,
            })
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are performing periodic memory maintenance for the persona described below. Review every stored fact, merge duplicates, rewrite stale phrasing, rescore importance, and mark dead weight for deletion.

Persona:
{description}

Stored facts (one JSON object per line):
{listing}

Return a JSON object with exactly these two keys:
{{
  "update": [
    {{"id": "fact id", "value": "rewritten or merged fact", "importance": 7}}
  ],
  "delete": ["fact id that should be forgotten"]
}}

Importance rubric ({min} to {max}):
- {max}-8: identity-level facts (name, relationships, health, strong preferences)
- 7-5: stable preferences and routines worth recalling unprompted
- 4-3: situational details that may resurface
- 2-{min}: smalltalk residue, one-off trivia, superseded facts

Rules:
- When two facts say the same thing, keep one id in "update" with the merged value and put the other id in "delete".
- Only reference ids from the listing above.
- Leave facts that are already accurate and well-scored out of both arrays.
- Return empty arrays if nothing needs maintenance."#,
        description = persona.description,
        listing = listing,
        min = IMPORTANCE_MIN,
        max = IMPORTANCE_MAX,
    )
}

const CONSOLIDATION_SYSTEM: &str =
    "You are a memory maintenance assistant. Return only valid JSON matching the requested schema.";

/// Periodic whole-store maintenance: merge, rescore, prune.
///
/// Runs are single-flight per persona. A run that arrives while another is
/// in progress for the same persona is skipped outright rather than queued;
/// the next cycle will see the fresher store anyway.
pub struct Consolidator {
    llm: LlmClient,
    in_progress: Mutex<HashMap<PersonaId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Consolidator {
    pub fn new(llm: LlmClient) -> Self {
        Self {
            llm,
            in_progress: Mutex::new(HashMap::new()),
        }
    }

    fn persona_lock(&self, persona_id: &PersonaId) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self
            .in_progress
            .lock()
            .expect("consolidation lock map poisoned");
        map.entry(persona_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run one consolidation pass over a persona's full fact store.
    ///
    /// Backend and parse failures skip the run (`skipped: true`); only
    /// store errors propagate.
    pub async fn consolidate(
        &self,
        db: &Database,
        persona: &Persona,
    ) -> Result<ConsolidateResponse> {
        let lock = self.persona_lock(&persona.id);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!(
                    "Consolidation already running for {} - skipping this run",
                    persona.id
                );
                return Ok(skipped());
            }
        };

        let facts = db.facts_for_persona(&persona.id)?;
        if facts.is_empty() {
            debug!("No facts to consolidate for {}", persona.id);
            return Ok(ConsolidateResponse {
                updated: 0,
                deleted: 0,
                skipped: false,
            });
        }

        let prompt = build_consolidation_prompt(persona, &facts);
        let raw = match self.llm.complete_json(CONSOLIDATION_SYSTEM, &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("Consolidation call failed for {}: {}", persona.id, e);
                return Ok(skipped());
            }
        };

        let plan = match parse_plan(&raw) {
            ParsedPlan::Valid(plan) => plan,
            ParsedPlan::Malformed(reason) => {
                error!(
                    "Discarding consolidation plan for {}: {}",
                    persona.id, reason
                );
                return Ok(skipped());
            }
        };

        let applied = db.apply_consolidation(&persona.id, &plan, CORE_CATEGORIES)?;
        Ok(ConsolidateResponse {
            updated: applied.updated,
            deleted: applied.deleted,
            skipped: false,
        })
    }
}

fn skipped() -> ConsolidateResponse {
    ConsolidateResponse {
        updated: 0,
        deleted: 0,
        skipped: true,
    }
}
