//! Turn execution and rollback for a story.
//!
//! All mutation of a story's turn log goes through here, serialized per
//! story, so an in-flight generation can never race a rollback on the same
//! story.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;

use crate::config::AppConfig;
use crate::database::{
    ProviderSettings, ResolvedDelta, Story, StoryDatabase, StoryMode, StoryTurn, WorldSchemaField,
};
use crate::llm_client::{DialogueLine, GenParams, GenerationRequest, Generator, TurnOutput};
use crate::prompt::{self, RosterEntry};
use crate::state;

/// Pre-network validation failure: bad input, missing API key, broken
/// roster. Nothing was sent and nothing was persisted.
#[derive(Debug)]
pub struct ValidationError(pub String);

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ValidationError(message.into()))
}

#[derive(Debug, Clone)]
pub enum StoryEvent {
    TurnAppended {
        story_id: String,
        turn_index: i64,
        turn_count: i64,
    },
    TurnsRolledBack {
        story_id: String,
        target_index: i64,
        turn_count: i64,
    },
    StateEdited {
        story_id: String,
        story_character_id: String,
        schema_key: String,
    },
    StoryUpdated {
        story_id: String,
    },
    ModelError {
        story_id: String,
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn: StoryTurn,
    pub turn_count: i64,
}

#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub turns: Vec<StoryTurn>,
    pub turn_count: i64,
}

/// Per-story generation params after override resolution.
struct EffectiveSettings {
    api_key: String,
    model: String,
    params: GenParams,
    context_turns: usize,
}

/// JSON shape of `stories.params_override_json`.
#[derive(Debug, Default, Deserialize)]
struct ParamsOverride {
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

/// Provider defaults used until a provider_settings row is saved.
pub fn provider_fallback(config: &AppConfig) -> ProviderSettings {
    ProviderSettings {
        api_key: config.api_key.clone(),
        model: config.default_model.clone(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        context_turns: config.context_turns,
        updated_at: Utc::now(),
    }
}

pub struct StoryEngine {
    db: Arc<StoryDatabase>,
    generator: Arc<dyn Generator>,
    fallback: ProviderSettings,
    event_tx: flume::Sender<StoryEvent>,
    story_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StoryEngine {
    pub fn new(
        db: Arc<StoryDatabase>,
        generator: Arc<dyn Generator>,
        fallback: ProviderSettings,
        event_tx: flume::Sender<StoryEvent>,
    ) -> Self {
        Self {
            db,
            generator,
            fallback,
            event_tx,
            story_locks: Mutex::new(HashMap::new()),
        }
    }

    fn emit(&self, event: StoryEvent) {
        let _ = self.event_tx.send(event);
    }

    fn story_lock(&self, story_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .story_locks
            .lock()
            .map_err(|e| anyhow::anyhow!("Story lock map poisoned: {}", e))?;
        Ok(locks
            .entry(story_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }

    /// Execute one turn: validate, assemble context, call the model once,
    /// persist the turn and its state deltas atomically.
    pub async fn execute_turn(&self, story_id: &str, user_input: &str) -> Result<TurnOutcome> {
        let lock = self.story_lock(story_id)?;
        let _guard = lock.lock().await;
        self.execute_turn_locked(story_id, user_input).await
    }

    async fn execute_turn_locked(&self, story_id: &str, user_input: &str) -> Result<TurnOutcome> {
        let input = user_input.trim();
        if input.is_empty() {
            return Err(invalid("input cannot be empty"));
        }

        let story = self
            .db
            .get_story(story_id)?
            .ok_or_else(|| anyhow::anyhow!("story {} not found", story_id))?;
        let settings = self.effective_settings(&story)?;

        let world = self
            .db
            .get_world(&story.world_id)?
            .ok_or_else(|| anyhow::anyhow!("world {} not found", story.world_id))?;
        let schema = self.db.list_schema_for_world(&world.id)?;
        let roster = self.load_roster(&story, &schema)?;

        if story.mode == StoryMode::PlayerCharacter {
            let players = roster.iter().filter(|e| e.member.is_player).count();
            if players != 1 {
                return Err(invalid(format!(
                    "a PLAYER_CHARACTER story needs exactly one player character, found {}",
                    players
                )));
            }
        }

        let turns = self.db.list_turns(story_id)?;
        let window_start = turns.len().saturating_sub(settings.context_turns);
        let messages = prompt::build_messages(&world, &story, &roster, &turns[window_start..], input);

        let request = GenerationRequest {
            api_key: settings.api_key,
            model: settings.model,
            params: settings.params,
            messages,
        };
        let output = match self.generator.generate_turn(&request).await {
            Ok(output) => output,
            Err(error) => {
                self.emit(StoryEvent::ModelError {
                    story_id: story_id.to_string(),
                    error: error.to_string(),
                });
                return Err(error);
            }
        };

        let dialogue = resolve_dialogue(&output, &roster);
        let deltas = resolve_deltas(&output, &roster, &schema);

        let (turn, turn_count) = self
            .db
            .append_turn(
                story_id,
                input,
                &output.narrative_text,
                &dialogue,
                &deltas,
                output.summary.as_deref(),
            )
            .context("Failed to persist generated turn")?;

        tracing::info!(
            "Story {} advanced to turn {} ({} state delta(s))",
            story_id,
            turn_count,
            deltas.len()
        );
        self.emit(StoryEvent::TurnAppended {
            story_id: story_id.to_string(),
            turn_index: turn.turn_index,
            turn_count,
        });

        Ok(TurnOutcome { turn, turn_count })
    }

    /// Delete every turn at or after `target_index` and revert their state
    /// writes. Destructive; there is no redo log.
    pub async fn rollback(&self, story_id: &str, target_index: i64) -> Result<RollbackOutcome> {
        let lock = self.story_lock(story_id)?;
        let _guard = lock.lock().await;
        self.rollback_locked(story_id, target_index)
    }

    fn rollback_locked(&self, story_id: &str, target_index: i64) -> Result<RollbackOutcome> {
        let turns = self.db.rollback_story(story_id, target_index)?;
        let turn_count = turns.last().map(|t| t.turn_index).unwrap_or(0);

        tracing::info!(
            "Story {} rolled back to target {} ({} turn(s) remain)",
            story_id,
            target_index,
            turns.len()
        );
        self.emit(StoryEvent::TurnsRolledBack {
            story_id: story_id.to_string(),
            target_index,
            turn_count,
        });

        Ok(RollbackOutcome { turns, turn_count })
    }

    /// Roll back the last turn and re-execute it with the same input. If the
    /// re-execute fails after the rollback committed, the store is re-read so
    /// callers see the rolled-back truth; the primary error is surfaced.
    pub async fn regenerate(&self, story_id: &str) -> Result<TurnOutcome> {
        let lock = self.story_lock(story_id)?;
        let _guard = lock.lock().await;

        let turns = self.db.list_turns(story_id)?;
        let last = turns
            .last()
            .ok_or_else(|| invalid("story has no turns to regenerate"))?;
        let target_index = last.turn_index;
        let input = last.user_input.clone();

        self.rollback_locked(story_id, target_index)?;

        match self.execute_turn_locked(story_id, &input).await {
            Ok(outcome) => Ok(outcome),
            Err(primary) => {
                // Resynchronize from the store; a secondary failure here must
                // not mask the primary error.
                match self.db.list_turns(story_id) {
                    Ok(remaining) => {
                        let turn_count = remaining.last().map(|t| t.turn_index).unwrap_or(0);
                        self.emit(StoryEvent::TurnsRolledBack {
                            story_id: story_id.to_string(),
                            target_index,
                            turn_count,
                        });
                    }
                    Err(resync_error) => {
                        tracing::warn!(
                            "Failed to re-read turns for {} after regenerate failure: {}",
                            story_id,
                            resync_error
                        );
                    }
                }
                Err(primary)
            }
        }
    }

    /// Editor path: validate one state value against the world schema and
    /// write it, bypassing the turn undo log.
    pub fn set_state_value(
        &self,
        story_id: &str,
        story_character_id: &str,
        schema_key: &str,
        value: &serde_json::Value,
    ) -> Result<state::FieldValue> {
        let story = self
            .db
            .get_story(story_id)?
            .ok_or_else(|| anyhow::anyhow!("story {} not found", story_id))?;
        let member = self
            .db
            .get_story_character(story_character_id)?
            .filter(|m| m.story_id == story.id)
            .ok_or_else(|| invalid("character is not part of this story"))?;

        let schema = self.db.list_schema_for_world(&story.world_id)?;
        let field = schema
            .iter()
            .find(|f| f.schema_key == schema_key)
            .ok_or_else(|| invalid(format!("unknown schema key '{}'", schema_key)))?;

        let validated = state::validate(field, value).map_err(|e| invalid(e.to_string()))?;
        self.db
            .set_state_value(story_id, &member.id, schema_key, &validated.encode())?;

        self.emit(StoryEvent::StateEdited {
            story_id: story_id.to_string(),
            story_character_id: member.id,
            schema_key: schema_key.to_string(),
        });
        Ok(validated)
    }

    /// Resolved state maps for every story member (or one member).
    pub fn resolve_story_state(
        &self,
        story_id: &str,
        only_member: Option<&str>,
    ) -> Result<Vec<(String, std::collections::BTreeMap<String, state::FieldValue>)>> {
        let story = self
            .db
            .get_story(story_id)?
            .ok_or_else(|| anyhow::anyhow!("story {} not found", story_id))?;
        let schema = self.db.list_schema_for_world(&story.world_id)?;

        let mut resolved = Vec::new();
        for member in self.db.list_story_characters(story_id)? {
            if let Some(only) = only_member {
                if member.id != only {
                    continue;
                }
            }
            let stored = self.db.state_map_for_character(story_id, &member.id)?;
            resolved.push((member.id, state::resolve(&schema, &stored)));
        }
        Ok(resolved)
    }

    /// Merge provider settings with per-story overrides. Fails before any
    /// network call when no API key is configured.
    fn effective_settings(&self, story: &Story) -> Result<EffectiveSettings> {
        let defaults = self
            .db
            .get_provider_settings()?
            .unwrap_or_else(|| self.fallback.clone());

        let api_key = defaults
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| invalid("no API key configured; set one in provider settings"))?
            .to_string();

        let override_params: ParamsOverride = story
            .params_override_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();

        Ok(EffectiveSettings {
            api_key,
            model: story
                .model_override
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(defaults.model),
            params: GenParams {
                temperature: override_params.temperature.unwrap_or(defaults.temperature),
                max_tokens: override_params.max_tokens.or(defaults.max_tokens),
                top_p: None,
            },
            context_turns: story
                .context_turns_override
                .unwrap_or(defaults.context_turns) as usize,
        })
    }

    fn load_roster(&self, story: &Story, schema: &[WorldSchemaField]) -> Result<Vec<RosterEntry>> {
        let mut roster = Vec::new();
        for member in self.db.list_story_characters(&story.id)? {
            let Some(character) = self.db.get_character(&member.character_id)? else {
                tracing::warn!(
                    "Story {} references missing character {}",
                    story.id,
                    member.character_id
                );
                continue;
            };
            let stored = self.db.state_map_for_character(&story.id, &member.id)?;
            roster.push(RosterEntry {
                state: state::resolve(schema, &stored),
                member,
                character,
            });
        }
        Ok(roster)
    }
}

/// Resolve dialogue speakers against the roster: ids are kept when they
/// match a member, names are matched case-insensitively against override and
/// character names, and anything unresolved keeps its raw speaker text.
fn resolve_dialogue(output: &TurnOutput, roster: &[RosterEntry]) -> Vec<DialogueLine> {
    output
        .dialogue
        .iter()
        .map(|line| {
            let resolved_id = line
                .speaker_story_character_id
                .as_deref()
                .filter(|id| roster.iter().any(|entry| entry.member.id == *id))
                .map(str::to_string)
                .or_else(|| {
                    line.speaker
                        .as_deref()
                        .and_then(|name| member_by_name(roster, name))
                });
            DialogueLine {
                speaker_story_character_id: resolved_id,
                speaker: line.speaker.clone(),
                text: line.text.clone(),
            }
        })
        .collect()
}

/// Resolve state deltas to validated writes. Unknown characters and schema
/// keys are skipped with a warning; a bad value for a known key is likewise
/// skipped rather than failing the whole turn.
fn resolve_deltas(
    output: &TurnOutput,
    roster: &[RosterEntry],
    schema: &[WorldSchemaField],
) -> Vec<ResolvedDelta> {
    let mut resolved = Vec::new();
    for delta in &output.state_deltas {
        let member_id = delta
            .story_character_id
            .as_deref()
            .filter(|id| roster.iter().any(|entry| entry.member.id == *id))
            .map(str::to_string)
            .or_else(|| {
                delta
                    .character
                    .as_deref()
                    .and_then(|name| member_by_name(roster, name))
            });
        let Some(member_id) = member_id else {
            tracing::warn!(
                "Skipping state delta for unknown character ({:?}/{:?})",
                delta.story_character_id,
                delta.character
            );
            continue;
        };

        let Some(field) = schema.iter().find(|f| f.schema_key == delta.schema_key) else {
            tracing::warn!("Skipping state delta for unknown schema key '{}'", delta.schema_key);
            continue;
        };

        match state::validate(field, &delta.value) {
            Ok(value) => resolved.push(ResolvedDelta {
                story_character_id: member_id,
                schema_key: field.schema_key.clone(),
                value_json: value.encode(),
            }),
            Err(error) => {
                tracing::warn!("Skipping invalid state delta for '{}': {}", field.schema_key, error);
            }
        }
    }
    resolved
}

fn member_by_name(roster: &[RosterEntry], name: &str) -> Option<String> {
    let name = name.trim();
    roster
        .iter()
        .find(|entry| {
            entry.display_name().eq_ignore_ascii_case(name)
                || entry.character.name.eq_ignore_ascii_case(name)
        })
        .map(|entry| entry.member.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{extract_json, StateDelta};
    use crate::state::FieldType;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Generator that replays scripted outputs and counts calls.
    struct ScriptedGenerator {
        outputs: Mutex<VecDeque<Result<TurnOutput>>>,
        calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        fn new(outputs: Vec<Result<TurnOutput>>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn narrating(texts: &[&str]) -> Self {
            Self::new(
                texts
                    .iter()
                    .map(|text| {
                        Ok(TurnOutput {
                            narrative_text: text.to_string(),
                            dialogue: Vec::new(),
                            state_deltas: Vec::new(),
                            summary: None,
                        })
                    })
                    .collect(),
            )
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate_turn(&self, _request: &GenerationRequest) -> Result<TurnOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outputs
                .lock()
                .expect("scripted outputs lock")
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted output left")))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<StoryDatabase>,
        generator: Arc<ScriptedGenerator>,
        engine: StoryEngine,
        events: flume::Receiver<StoryEvent>,
        story_id: String,
        member_id: String,
    }

    fn fixture(name: &str, generator: ScriptedGenerator, with_api_key: bool) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join(format!("{}.db", name));
        let db = Arc::new(StoryDatabase::new(&db_path).expect("db init"));

        let world = db
            .create_world("Eldoria", "High fantasy", "Magic is scarce.")
            .expect("world");
        db.create_schema_field(
            &world.id,
            "hp",
            FieldType::Number,
            "Hit points",
            Some("100"),
            &[],
            Some(0.0),
            Some(100.0),
            None,
        )
        .expect("schema field");
        let story = db
            .create_story(
                &world.id,
                "The Ashen Road",
                "A missing caravan",
                "",
                StoryMode::PlayerCharacter,
                None,
                None,
                None,
            )
            .expect("story");
        let character = db
            .create_character("Mira", "A wary scout", &[], None)
            .expect("character");
        let member = db
            .add_story_character(&story.id, &character.id, true, None)
            .expect("member");

        let mut config = AppConfig::default();
        config.api_key = with_api_key.then(|| "sk-test".to_string());

        let generator = Arc::new(generator);
        let (event_tx, events) = flume::unbounded();
        let engine = StoryEngine::new(
            db.clone(),
            generator.clone(),
            provider_fallback(&config),
            event_tx,
        );

        Fixture {
            _dir: dir,
            db,
            generator,
            engine,
            events,
            story_id: story.id,
            member_id: member.id,
        }
    }

    #[tokio::test]
    async fn happy_path_appends_turn_and_applies_deltas() {
        let output = TurnOutput {
            narrative_text: "A goblin lunges from the rocks.".to_string(),
            dialogue: vec![DialogueLine {
                speaker_story_character_id: None,
                speaker: Some("mira".to_string()),
                text: "Behind you!".to_string(),
            }],
            state_deltas: vec![StateDelta {
                story_character_id: None,
                character: Some("Mira".to_string()),
                schema_key: "hp".to_string(),
                value: serde_json::json!(85),
            }],
            summary: Some("Mira is ambushed in the hills.".to_string()),
        };
        let fx = fixture("happy", ScriptedGenerator::new(vec![Ok(output)]), true);

        let outcome = fx
            .engine
            .execute_turn(&fx.story_id, "  search the rocks  ")
            .await
            .expect("turn executes");

        assert_eq!(outcome.turn.turn_index, 1);
        assert_eq!(outcome.turn_count, 1);
        assert_eq!(outcome.turn.user_input, "search the rocks");
        // Name-addressed speaker resolved to the member id
        assert_eq!(
            outcome.turn.dialogue[0].speaker_story_character_id.as_deref(),
            Some(fx.member_id.as_str())
        );

        let stored = fx
            .db
            .state_map_for_character(&fx.story_id, &fx.member_id)
            .expect("state map");
        assert_eq!(stored.get("hp").map(String::as_str), Some("85.0"));

        let story = fx.db.get_story(&fx.story_id).expect("get").expect("exists");
        assert_eq!(
            story.summary_text.as_deref(),
            Some("Mira is ambushed in the hills.")
        );

        assert!(matches!(
            fx.events.try_recv().expect("event"),
            StoryEvent::TurnAppended { turn_index: 1, .. }
        ));
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_network_call() {
        let fx = fixture("no_key", ScriptedGenerator::narrating(&["unused"]), false);

        let err = fx
            .engine
            .execute_turn(&fx.story_id, "look around")
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
        assert_eq!(fx.generator.call_count(), 0);
        assert!(fx.db.list_turns(&fx.story_id).expect("turns").is_empty());
    }

    #[tokio::test]
    async fn empty_input_is_rejected_without_a_call() {
        let fx = fixture("empty_input", ScriptedGenerator::narrating(&["unused"]), true);
        let err = fx.engine.execute_turn(&fx.story_id, "   ").await.unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
        assert_eq!(fx.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn player_character_story_requires_exactly_one_player() {
        let fx = fixture("no_player", ScriptedGenerator::narrating(&["unused"]), true);
        let member = fx
            .db
            .get_story_character(&fx.member_id)
            .expect("get member")
            .expect("member exists");
        fx.db
            .update_story_character(&member.id, false, None)
            .expect("demote player");

        let err = fx
            .engine
            .execute_turn(&fx.story_id, "look")
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
        assert_eq!(fx.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_output_persists_nothing() {
        let fx = fixture(
            "malformed",
            ScriptedGenerator::new(vec![extract_json::<TurnOutput>("not json").map(|_| {
                unreachable!()
            })]),
            true,
        );

        let err = fx.engine.execute_turn(&fx.story_id, "go").await.unwrap_err();
        assert!(err
            .downcast_ref::<crate::llm_client::MalformedOutput>()
            .is_some());
        assert!(fx.db.list_turns(&fx.story_id).expect("turns").is_empty());
        let story = fx.db.get_story(&fx.story_id).expect("get").expect("exists");
        assert_eq!(story.turn_count, 0);
        assert!(matches!(
            fx.events.try_recv().expect("event"),
            StoryEvent::ModelError { .. }
        ));
    }

    #[tokio::test]
    async fn rollback_then_submit_lands_at_target_index() {
        let fx = fixture(
            "rollback_submit",
            ScriptedGenerator::narrating(&["one", "two", "three", "redo"]),
            true,
        );
        for input in ["a", "b", "c"] {
            fx.engine.execute_turn(&fx.story_id, input).await.expect("turn");
        }

        let rolled = fx.engine.rollback(&fx.story_id, 2).await.expect("rollback");
        assert_eq!(rolled.turn_count, 1);
        assert_eq!(rolled.turns.len(), 1);

        let outcome = fx.engine.execute_turn(&fx.story_id, "d").await.expect("resubmit");
        assert_eq!(outcome.turn.turn_index, 2);
        assert_eq!(outcome.turn_count, 2);
    }

    #[tokio::test]
    async fn regenerate_replaces_the_last_turn() {
        let fx = fixture(
            "regen",
            ScriptedGenerator::narrating(&["first", "second", "second, retold"]),
            true,
        );
        fx.engine.execute_turn(&fx.story_id, "a").await.expect("turn 1");
        fx.engine.execute_turn(&fx.story_id, "b").await.expect("turn 2");

        let outcome = fx.engine.regenerate(&fx.story_id).await.expect("regenerate");
        assert_eq!(outcome.turn.turn_index, 2);
        assert_eq!(outcome.turn.user_input, "b");
        assert_eq!(outcome.turn.narrative_text, "second, retold");

        let turns = fx.db.list_turns(&fx.story_id).expect("turns");
        assert_eq!(turns.len(), 2);
    }

    #[tokio::test]
    async fn regenerate_failure_leaves_rolled_back_story() {
        let fx = fixture(
            "regen_fail",
            ScriptedGenerator::new(vec![
                Ok(TurnOutput {
                    narrative_text: "first".to_string(),
                    dialogue: Vec::new(),
                    state_deltas: Vec::new(),
                    summary: None,
                }),
                Err(anyhow::anyhow!("provider quota exceeded")),
            ]),
            true,
        );
        fx.engine.execute_turn(&fx.story_id, "a").await.expect("turn 1");

        let err = fx.engine.regenerate(&fx.story_id).await.unwrap_err();
        assert!(err.to_string().contains("quota"));

        // Rollback committed before the failed re-execute
        assert!(fx.db.list_turns(&fx.story_id).expect("turns").is_empty());
        let story = fx.db.get_story(&fx.story_id).expect("get").expect("exists");
        assert_eq!(story.turn_count, 0);
    }

    #[tokio::test]
    async fn unknown_delta_targets_are_skipped_but_turn_persists() {
        let output = TurnOutput {
            narrative_text: "The wind shifts.".to_string(),
            dialogue: Vec::new(),
            state_deltas: vec![
                StateDelta {
                    story_character_id: None,
                    character: Some("Nobody".to_string()),
                    schema_key: "hp".to_string(),
                    value: serde_json::json!(1),
                },
                StateDelta {
                    story_character_id: None,
                    character: Some("Mira".to_string()),
                    schema_key: "mana".to_string(),
                    value: serde_json::json!(3),
                },
            ],
            summary: None,
        };
        let fx = fixture("skip_deltas", ScriptedGenerator::new(vec![Ok(output)]), true);

        let outcome = fx.engine.execute_turn(&fx.story_id, "wait").await.expect("turn");
        assert_eq!(outcome.turn_count, 1);
        assert!(fx
            .db
            .state_map_for_character(&fx.story_id, &fx.member_id)
            .expect("state map")
            .is_empty());
    }

    #[tokio::test]
    async fn delta_values_are_clamped_by_schema_bounds() {
        let output = TurnOutput {
            narrative_text: "A miracle.".to_string(),
            dialogue: Vec::new(),
            state_deltas: vec![StateDelta {
                story_character_id: None,
                character: Some("Mira".to_string()),
                schema_key: "hp".to_string(),
                value: serde_json::json!(250),
            }],
            summary: None,
        };
        let fx = fixture("clamp", ScriptedGenerator::new(vec![Ok(output)]), true);

        fx.engine.execute_turn(&fx.story_id, "rest").await.expect("turn");
        let stored = fx
            .db
            .state_map_for_character(&fx.story_id, &fx.member_id)
            .expect("state map");
        assert_eq!(stored.get("hp").map(String::as_str), Some("100.0"));
    }

    #[tokio::test]
    async fn manual_state_edit_validates_against_schema() {
        let fx = fixture("manual_edit", ScriptedGenerator::narrating(&[]), true);

        let value = fx
            .engine
            .set_state_value(&fx.story_id, &fx.member_id, "hp", &serde_json::json!(42))
            .expect("edit");
        assert_eq!(value, state::FieldValue::Number(42.0));

        let err = fx
            .engine
            .set_state_value(&fx.story_id, &fx.member_id, "mana", &serde_json::json!(1))
            .unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
    }

    #[tokio::test]
    async fn resolved_state_covers_every_schema_key() {
        let fx = fixture("resolve_all", ScriptedGenerator::narrating(&[]), true);

        let resolved = fx
            .engine
            .resolve_story_state(&fx.story_id, None)
            .expect("resolve");
        assert_eq!(resolved.len(), 1);
        let (member_id, values) = &resolved[0];
        assert_eq!(member_id, &fx.member_id);
        assert_eq!(values["hp"], state::FieldValue::Number(100.0));
    }
}
