//! End-to-end memory flow over a real SQLite store: reconcile an excerpt's
//! diff into the store, select relevant facts for the next message, then
//! consolidate and verify protections held.

use anyhow::Result;
use chrono::Utc;
use companion_memory::{parse_diff, parse_plan, Database, ParsedDiff, ParsedPlan, RelevanceSelector, CORE_CATEGORIES};
use companion_schemas::{generate_persona_id, Persona, PersonaId};
use tempfile::TempDir;

fn setup() -> Result<(TempDir, Database, PersonaId)> {
    let tmp = TempDir::new()?;
    let db = Database::new(tmp.path().join("memory.db"))?;

    let persona_id = generate_persona_id();
    db.insert_persona(&Persona {
        id: persona_id.clone(),
        name: "Mika".to_string(),
        description: "A cheerful companion who loves mornings".to_string(),
        chat_url: None,
        user_id: None,
        created_at: Utc::now().to_rfc3339(),
    })?;

    Ok((tmp, db, persona_id))
}

fn apply_raw_diff(db: &Database, persona_id: &PersonaId, raw: &str) -> Result<()> {
    match parse_diff(raw) {
        ParsedDiff::Valid(diff) => {
            db.apply_diff(persona_id, &diff)?;
            Ok(())
        }
        ParsedDiff::Malformed(reason) => anyhow::bail!("diff rejected: {}", reason),
    }
}

#[test]
fn reconcile_then_select_round_trip() -> Result<()> {
    let (_tmp, db, persona_id) = setup()?;

    // First conversation: the backend learns a name, a food preference, and
    // the persona's mood.
    apply_raw_diff(
        &db,
        &persona_id,
        r#"{
            "add": [
                {"target": "user", "category": "name", "value": "Sam"},
                {"target": "user", "category": "favorite_food", "value": "sushi"},
                {"target": "self", "category": "current_mood", "value": "Happy because Sam came back"}
            ],
            "update": [],
            "remove": []
        }"#,
    )?;
    assert_eq!(db.count_facts(&persona_id)?, 3);

    // Next inbound message is about food: selection must carry the core
    // facts plus the food preference.
    let selector = RelevanceSelector::new();
    let facts = selector.select(&db, &persona_id, "what should I eat for dinner?")?;

    let categories: Vec<&str> = facts.iter().map(|f| f.category.as_str()).collect();
    assert!(categories.contains(&"name"));
    assert!(categories.contains(&"current_mood"));
    assert!(categories.contains(&"favorite_food"));

    Ok(())
}

#[test]
fn correction_updates_and_forgetting_removes() -> Result<()> {
    let (_tmp, db, persona_id) = setup()?;

    apply_raw_diff(
        &db,
        &persona_id,
        r#"{
            "add": [
                {"target": "user", "category": "favorite_food", "value": "sushi"},
                {"target": "user", "category": "job", "value": "barista"}
            ],
            "update": [],
            "remove": []
        }"#,
    )?;

    let facts = db.facts_for_persona(&persona_id)?;
    let food = facts.iter().find(|f| f.category == "favorite_food").unwrap();
    let job = facts.iter().find(|f| f.category == "job").unwrap();

    // "Actually I'm vegetarian now, and I quit my job."
    apply_raw_diff(
        &db,
        &persona_id,
        &format!(
            r#"{{
                "add": [],
                "update": [{{"id": "{}", "value": "vegetarian sushi only"}}],
                "remove": ["{}"]
            }}"#,
            food.id.0, job.id.0
        ),
    )?;

    let facts = db.facts_for_persona(&persona_id)?;
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].value, "vegetarian sushi only");

    Ok(())
}

#[test]
fn malformed_extraction_leaves_store_untouched() -> Result<()> {
    let (_tmp, db, persona_id) = setup()?;

    apply_raw_diff(
        &db,
        &persona_id,
        r#"{"add": [{"target": "user", "category": "name", "value": "Sam"}], "update": [], "remove": []}"#,
    )?;

    // Backend drops the remove key: whole batch must be rejected.
    let result = apply_raw_diff(
        &db,
        &persona_id,
        r#"{"add": [{"target": "user", "category": "name", "value": "Mallory"}], "update": []}"#,
    );
    assert!(result.is_err());

    let facts = db.facts_for_persona(&persona_id)?;
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].value, "Sam");

    Ok(())
}

#[test]
fn consolidation_prunes_trivia_but_never_core() -> Result<()> {
    let (_tmp, db, persona_id) = setup()?;

    apply_raw_diff(
        &db,
        &persona_id,
        r#"{
            "add": [
                {"target": "self", "category": "current_mood", "value": "Calm because rested"},
                {"target": "user", "category": "weather_smalltalk", "value": "it rained once"},
                {"target": "user", "category": "name", "value": "Sam"}
            ],
            "update": [],
            "remove": []
        }"#,
    )?;

    let facts = db.facts_for_persona(&persona_id)?;
    let ids: Vec<String> = facts.iter().map(|f| f.id.0.clone()).collect();

    // A plan that tries to delete everything, with an out-of-range rescore
    // on the name fact.
    let name_id = facts.iter().find(|f| f.category == "name").unwrap().id.0.clone();
    let raw = format!(
        r#"{{
            "update": [{{"id": "{}", "value": "Sam", "importance": 99}}],
            "delete": ["{}", "{}", "{}"]
        }}"#,
        name_id, ids[0], ids[1], ids[2]
    );

    let plan = match parse_plan(&raw) {
        ParsedPlan::Valid(plan) => plan,
        ParsedPlan::Malformed(reason) => panic!("plan rejected: {}", reason),
    };
    db.apply_consolidation(&persona_id, &plan, CORE_CATEGORIES)?;

    let remaining = db.facts_for_persona(&persona_id)?;
    let categories: Vec<&str> = remaining.iter().map(|f| f.category.as_str()).collect();

    // Core categories survive, trivia does not.
    assert!(categories.contains(&"current_mood"));
    assert!(categories.contains(&"name"));
    assert!(!categories.contains(&"weather_smalltalk"));

    // Clamped at the store boundary.
    let name = remaining.iter().find(|f| f.category == "name").unwrap();
    assert_eq!(name.importance, 10);

    Ok(())
}
