use anyhow::{Context, Result};
use companion_schemas::{
    ActivityRecord, EventType, Fact, FactTarget, FactsResponse, Persona, PersonaId, ScheduledEvent,
    SelectRequest, UserId,
};
use tracing::{debug, info, warn};

/// Fixed copy for ritual events; no generation call involved.
pub const WAKE_UP_TEXT: &str = "Good morning! I just woke up and you were my first thought.";
pub const SLEEP_TEXT: &str = "I'm heading to sleep now. Good night, talk tomorrow!";

/// Placeholder injected when the persona has no relevant memories yet.
pub const NO_MEMORIES_PLACEHOLDER: &str =
    "(You have no stored memories about this person yet - keep it light and curious.)";

/// HTTP client for the memory service. Events store instructions, not
/// message text; everything user-visible is expanded against the live fact
/// store at fire time.
pub struct MemoryClient {
    client: reqwest::Client,
    memory_url: String,
}

impl MemoryClient {
    pub fn new(memory_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            memory_url,
        }
    }

    pub fn from_env() -> Self {
        let memory_url =
            std::env::var("MEMORY_URL").unwrap_or_else(|_| "http://127.0.0.1:21870".to_string());
        Self::new(memory_url)
    }

    pub async fn fetch_persona(&self, persona_id: &PersonaId) -> Result<Option<Persona>> {
        let url = format!("{}/personas/{}", self.memory_url, persona_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("memory service unreachable")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("persona fetch failed with status {}", response.status());
        }

        let persona: Persona = response.json().await?;
        Ok(Some(persona))
    }

    /// Tiered relevance selection, keyed on the event's context prompt so
    /// topical memories surface alongside the core set.
    pub async fn select_facts(&self, persona_id: &PersonaId, text: &str) -> Result<Vec<Fact>> {
        let url = format!("{}/facts/select", self.memory_url);
        let request = SelectRequest {
            persona_id: persona_id.clone(),
            text: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("memory service unreachable")?;

        if !response.status().is_success() {
            anyhow::bail!("fact selection failed with status {}", response.status());
        }

        let facts: FactsResponse = response.json().await?;
        debug!("Fetched {} facts for {}", facts.facts.len(), persona_id);
        Ok(facts.facts)
    }

    /// Latest inbound-interaction timestamp for the user, if any.
    pub async fn fetch_activity(&self, user_id: &UserId) -> Result<Option<ActivityRecord>> {
        let url = format!("{}/activity/{}", self.memory_url, user_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("memory service unreachable")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("activity fetch failed with status {}", response.status());
        }

        let record: ActivityRecord = response.json().await?;
        Ok(Some(record))
    }
}

/// Render the selected facts as prompt lines, persona's own facts first so
/// mood and outfit shape the voice before user facts shape the content.
fn render_facts(facts: &[Fact]) -> String {
    if facts.is_empty() {
        return NO_MEMORIES_PLACEHOLDER.to_string();
    }

    let mut lines = Vec::with_capacity(facts.len());
    for target in [FactTarget::Persona, FactTarget::User] {
        for fact in facts.iter().filter(|f| f.target == target) {
            let owner = match target {
                FactTarget::Persona => "you",
                FactTarget::User => "them",
            };
            lines.push(format!("- [{}] {}: {}", owner, fact.category, fact.value));
        }
    }

    lines.join("\n")
}

/// Expand a text event into the generation prompt. Ritual events short-
/// circuit to fixed copy and never reach this.
pub fn build_event_prompt(event: &ScheduledEvent, persona: &Persona, facts: &[Fact]) -> String {
    format!(
        r#"You are {name}. Stay fully in character.

{description}

What you remember:
{memories}

It's time to reach out to them proactively. Your instruction for this moment:
{instruction}

Write the message you would send right now. Output only the message text, nothing else."#,
        name = persona.name,
        description = persona.description,
        memories = render_facts(facts),
        instruction = event.context_prompt,
    )
}

/// Resolve the outgoing text for an event that is ready to fire. Ritual
/// events use fixed copy; text events are expanded and generated.
pub async fn expand_event(
    memory: &MemoryClient,
    generation: &crate::generation::GenerationClient,
    event: &ScheduledEvent,
    persona: &Persona,
) -> Result<String> {
    match event.event_type {
        EventType::WakeUp => return Ok(WAKE_UP_TEXT.to_string()),
        EventType::Sleep => return Ok(SLEEP_TEXT.to_string()),
        EventType::Text | EventType::ImageGeneration => {}
    }

    // Fact fetch failures degrade to an empty memory block rather than
    // blocking the send.
    let facts = memory
        .select_facts(&event.persona_id, &event.context_prompt)
        .await
        .unwrap_or_else(|e| {
            warn!("Fact fetch failed for event {}: {}", event.id, e);
            Vec::new()
        });

    let prompt = build_event_prompt(event, persona, &facts);
    let system = format!("You are the companion persona {}.", persona.name);

    let text = generation
        .complete(&system, &prompt)
        .await
        .with_context(|| format!("generation failed for event {}", event.id))?;

    info!("Expanded event {} into {} chars", event.id, text.len());
    Ok(text)
}
