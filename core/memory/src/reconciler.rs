use anyhow::Result;
use companion_schemas::{
    Fact, FactDiff, FactDraft, FactId, FactTarget, FactUpdate, Persona, ReconcileResponse,
};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::database::Database;
use crate::llm::LlmClient;

/// Outcome of parsing the extraction backend's response. The raw JSON is
/// loosely typed, so validation happens before anything touches the store.
#[derive(Debug)]
pub enum ParsedDiff {
    Valid(FactDiff),
    Malformed(String),
}

/// Parse the raw extraction response into a clean diff.
///
/// The top level must be an object carrying all three of `add`, `update`,
/// `remove` as arrays; anything else discards the whole batch. Individual
/// entries missing required fields are skipped with a warning while the
/// rest of the batch proceeds.
pub fn parse_diff(raw: &str) -> ParsedDiff {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return ParsedDiff::Malformed(format!("not valid JSON: {}", e)),
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => return ParsedDiff::Malformed("top level is not an object".to_string()),
    };

    let mut arrays = Vec::with_capacity(3);
    for key in ["add", "update", "remove"] {
        match obj.get(key).and_then(Value::as_array) {
            Some(arr) => arrays.push(arr),
            None => {
                return ParsedDiff::Malformed(format!("missing or non-array key '{}'", key));
            }
        }
    }

    let mut diff = FactDiff::default();

    for entry in arrays[0] {
        match parse_add_entry(entry) {
            Some(draft) => diff.add.push(draft),
            None => warn!("Skipping incomplete add entry: {}", entry),
        }
    }

    for entry in arrays[1] {
        match parse_update_entry(entry) {
            Some(update) => diff.update.push(update),
            None => warn!("Skipping incomplete update entry: {}", entry),
        }
    }

    for entry in arrays[2] {
        match entry.as_str() {
            Some(id) if !id.is_empty() => diff.remove.push(FactId(id.to_string())),
            _ => warn!("Skipping non-string remove entry: {}", entry),
        }
    }

    ParsedDiff::Valid(diff)
}

fn non_empty_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_add_entry(entry: &Value) -> Option<FactDraft> {
    let target = FactTarget::parse(&non_empty_str(entry, "target")?)?;
    Some(FactDraft {
        target,
        category: non_empty_str(entry, "category")?,
        value: non_empty_str(entry, "value")?,
        context: non_empty_str(entry, "context"),
    })
}

fn parse_update_entry(entry: &Value) -> Option<FactUpdate> {
    Some(FactUpdate {
        id: FactId(non_empty_str(entry, "id")?),
        value: non_empty_str(entry, "value")?,
        context: non_empty_str(entry, "context"),
    })
}

/// Serialize the current fact snapshot for the extraction prompt:
/// one compact JSON object per line, only the fields the backend needs to
/// target facts.
pub fn serialize_snapshot(facts: &[Fact]) -> String {
    if facts.is_empty() {
        return "(no facts stored yet)".to_string();
    }

    facts
        .iter()
        .map(|f| {
            serde_json::json!({
                "id": f.id.0,
                "target": f.target.as_str(),
                "category": f.category,
                "value": f.value,
            })
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the extraction prompt. The output schema and the mood-tracking
/// requirement are prompt-level contracts; the parser only enforces the
/// three-key shape.
pub fn build_extraction_prompt(persona: &Persona, excerpt: &str, snapshot: &str) -> String {
    format!(
        r#"You maintain the long-term memory of the persona described below. Compare the conversation excerpt against the currently stored facts and return the changes needed to keep the memory accurate.

Persona:
{description}

Currently stored facts (one JSON object per line):
{snapshot}

Conversation excerpt:
{excerpt}

Return a JSON object with exactly these three keys:
{{
  "add": [
    {{"target": "user|self", "category": "short_label", "value": "the fact", "context": "when/why learned (optional)"}}
  ],
  "update": [
    {{"id": "existing fact id", "value": "corrected fact", "context": "optional"}}
  ],
  "remove": ["fact id that is now wrong or obsolete"]
}}

Rules:
- "target" is "user" for facts about the human, "self" for facts about the persona.
- Only reference ids that appear in the stored facts above.
- If the persona's emotional state plausibly changed during this excerpt, you MUST update the fact with category "current_mood" and target "self" (or add it if absent). Its value must be formatted as "{{Emotion}} because {{Reason}}".
- Return empty arrays when nothing changed. Do not invent facts."#,
        description = persona.description,
        snapshot = snapshot,
        excerpt = excerpt,
    )
}

const EXTRACTION_SYSTEM: &str =
    "You are a memory reconciliation assistant. Return only valid JSON matching the requested schema.";

/// Orchestrates one reconciliation cycle: extraction call, tolerant parse,
/// transactional apply.
pub struct Reconciler {
    llm: LlmClient,
}

impl Reconciler {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    /// Derive and apply a fact diff from a conversation excerpt.
    ///
    /// Extraction is non-critical: backend and parse failures degrade to a
    /// no-op diff rather than failing the caller. Only store errors
    /// propagate.
    pub async fn reconcile(
        &self,
        db: &Database,
        persona: &Persona,
        excerpt: &str,
    ) -> Result<ReconcileResponse> {
        let snapshot_facts = db.facts_for_persona(&persona.id)?;
        let snapshot = serialize_snapshot(&snapshot_facts);
        let prompt = build_extraction_prompt(persona, excerpt, &snapshot);

        let raw = match self.llm.complete_json(EXTRACTION_SYSTEM, &prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                // Memory extraction must never break the conversation path.
                error!("Fact extraction failed for {}: {}", persona.id, e);
                return Ok(ReconcileResponse {
                    added: 0,
                    updated: 0,
                    removed: 0,
                    discarded: true,
                });
            }
        };

        let diff = match parse_diff(&raw) {
            ParsedDiff::Valid(diff) => diff,
            ParsedDiff::Malformed(reason) => {
                error!(
                    "Discarding extraction batch for {}: {}",
                    persona.id, reason
                );
                return Ok(ReconcileResponse {
                    added: 0,
                    updated: 0,
                    removed: 0,
                    discarded: true,
                });
            }
        };

        if diff.is_empty() {
            debug!("Empty diff for {} - nothing to apply", persona.id);
            return Ok(ReconcileResponse {
                added: 0,
                updated: 0,
                removed: 0,
                discarded: false,
            });
        }

        let applied = db.apply_diff(&persona.id, &diff)?;
        Ok(ReconcileResponse {
            added: applied.added,
            updated: applied.updated,
            removed: applied.removed,
            discarded: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use companion_schemas::generate_persona_id;
    use tempfile::TempDir;

    fn test_persona() -> Persona {
        Persona {
            id: generate_persona_id(),
            name: "Mika".to_string(),
            description: "A cheerful companion who loves mornings".to_string(),
            chat_url: None,
            user_id: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn parse_valid_diff() {
        let raw = r#"{
            "add": [{"target": "user", "category": "favorite_drink", "value": "oat milk latte"}],
            "update": [{"id": "fact_01", "value": "Sad because ignored"}],
            "remove": ["fact_02"]
        }"#;

        match parse_diff(raw) {
            ParsedDiff::Valid(diff) => {
                assert_eq!(diff.add.len(), 1);
                assert_eq!(diff.update.len(), 1);
                assert_eq!(diff.remove.len(), 1);
                assert_eq!(diff.add[0].category, "favorite_drink");
                assert_eq!(diff.update[0].id.0, "fact_01");
            }
            ParsedDiff::Malformed(reason) => panic!("unexpected malformed: {}", reason),
        }
    }

    #[test]
    fn missing_key_discards_batch() {
        // update/remove absent: the whole batch must be rejected, not
        // partially applied.
        let raw = r#"{"add": []}"#;
        assert!(matches!(parse_diff(raw), ParsedDiff::Malformed(_)));
    }

    #[test]
    fn non_object_discards_batch() {
        assert!(matches!(parse_diff("[1, 2, 3]"), ParsedDiff::Malformed(_)));
        assert!(matches!(parse_diff("not json at all"), ParsedDiff::Malformed(_)));
        assert!(matches!(parse_diff("null"), ParsedDiff::Malformed(_)));
    }

    #[test]
    fn incomplete_add_entry_is_skipped() {
        let raw = r#"{
            "add": [
                {"target": "user", "category": "favorite_drink", "value": "latte"},
                {"target": "user", "value": "missing category"},
                {"target": "martian", "category": "x", "value": "bad target"}
            ],
            "update": [],
            "remove": []
        }"#;

        match parse_diff(raw) {
            ParsedDiff::Valid(diff) => {
                assert_eq!(diff.add.len(), 1);
                assert_eq!(diff.add[0].value, "latte");
            }
            ParsedDiff::Malformed(reason) => panic!("unexpected malformed: {}", reason),
        }
    }

    #[test]
    fn incomplete_update_and_remove_entries_are_skipped() {
        let raw = r#"{
            "add": [],
            "update": [
                {"id": "fact_01", "value": "ok"},
                {"value": "no id"},
                {"id": "fact_02"}
            ],
            "remove": ["fact_03", 42, ""]
        }"#;

        match parse_diff(raw) {
            ParsedDiff::Valid(diff) => {
                assert_eq!(diff.update.len(), 1);
                assert_eq!(diff.remove.len(), 1);
                assert_eq!(diff.remove[0].0, "fact_03");
            }
            ParsedDiff::Malformed(reason) => panic!("unexpected malformed: {}", reason),
        }
    }

    #[test]
    fn extraction_prompt_carries_mood_contract() {
        let persona = test_persona();
        let prompt = build_extraction_prompt(&persona, "User: hi!", "(no facts stored yet)");

        assert!(prompt.contains("current_mood"));
        assert!(prompt.contains("{Emotion} because {Reason}"));
        assert!(prompt.contains(&persona.description));
        assert!(prompt.contains("\"add\""));
        assert!(prompt.contains("\"update\""));
        assert!(prompt.contains("\"remove\""));
    }

    #[test]
    fn snapshot_serialization_is_one_line_per_fact() {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(tmp.path().join("memory.db")).unwrap();
        let persona = test_persona();
        db.insert_persona(&persona).unwrap();

        assert_eq!(serialize_snapshot(&[]), "(no facts stored yet)");

        db.create_fact(
            &persona.id,
            &FactDraft {
                target: FactTarget::User,
                category: "name".to_string(),
                value: "Sam".to_string(),
                context: None,
            },
        )
        .unwrap();
        db.create_fact(
            &persona.id,
            &FactDraft {
                target: FactTarget::Persona,
                category: "current_mood".to_string(),
                value: "Happy because sunny".to_string(),
                context: None,
            },
        )
        .unwrap();

        let facts = db.facts_for_persona(&persona.id).unwrap();
        let snapshot = serialize_snapshot(&facts);
        assert_eq!(snapshot.lines().count(), 2);
        assert!(snapshot.contains("\"category\":\"name\""));
        assert!(snapshot.contains("\"target\":\"self\""));
    }

    #[test]
    fn parsed_diff_applies_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(tmp.path().join("memory.db")).unwrap();
        let persona = test_persona();
        db.insert_persona(&persona).unwrap();

        let raw = r#"{
            "add": [{"target": "user", "category": "favorite_drink", "value": "oat milk latte"}],
            "update": [],
            "remove": []
        }"#;

        let diff = match parse_diff(raw) {
            ParsedDiff::Valid(diff) => diff,
            ParsedDiff::Malformed(reason) => panic!("unexpected malformed: {}", reason),
        };
        db.apply_diff(&persona.id, &diff).unwrap();

        let facts = db.facts_for_persona(&persona.id).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].category, "favorite_drink");
        assert_eq!(facts[0].value, "oat milk latte");
        assert!(facts[0].id.0.starts_with("fact_"));
    }
}
