use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use crate::llm_client::DialogueLine;
use crate::state::FieldType;

/// Validation/uniqueness failure the API layer maps to a client error
/// instead of a 500.
#[derive(Debug)]
pub struct ConflictError(pub String);

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConflictError {}

fn conflict(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(ConflictError(message.into()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    pub id: String,
    pub name: String,
    pub description: String,
    pub rules_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One typed field definition scoped to a world. Values are resolved by
/// `schema_key`, never by id, so keys stay stable and unique per world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSchemaField {
    pub id: String,
    pub world_id: String,
    pub schema_key: String,
    pub field_type: FieldType,
    pub label: String,
    pub default_value_json: Option<String>,
    pub enum_options: Vec<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoryMode {
    PlayerCharacter,
    Director,
}

impl StoryMode {
    pub fn as_db_str(self) -> &'static str {
        match self {
            StoryMode::PlayerCharacter => "PLAYER_CHARACTER",
            StoryMode::Director => "DIRECTOR",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DIRECTOR" => StoryMode::Director,
            _ => StoryMode::PlayerCharacter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub world_id: String,
    pub title: String,
    pub premise: String,
    pub ai_prompt: String,
    pub mode: StoryMode,
    pub model_override: Option<String>,
    pub params_override_json: Option<String>,
    pub context_turns_override: Option<u32>,
    pub summary_text: Option<String>,
    pub turn_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryCharacter {
    pub id: String,
    pub story_id: String,
    pub character_id: String,
    pub is_player: bool,
    pub display_name_override: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryTurn {
    pub id: String,
    pub story_id: String,
    pub turn_index: i64,
    pub user_input: String,
    pub narrative_text: String,
    pub dialogue: Vec<DialogueLine>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryStateValue {
    pub story_id: String,
    pub story_character_id: String,
    pub schema_key: String,
    pub value_json: String,
    pub updated_at: DateTime<Utc>,
}

/// A state write already validated against the world schema, ready to be
/// applied inside the turn transaction.
#[derive(Debug, Clone)]
pub struct ResolvedDelta {
    pub story_character_id: String,
    pub schema_key: String,
    pub value_json: String,
}

/// User-level generation defaults; per-story overrides fall back to these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub context_turns: u32,
    pub updated_at: DateTime<Utc>,
}

const PROVIDER_SETTINGS_ID: &str = "singleton";

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match raw {
        Some(raw) => parse_ts(idx, &raw).map(Some),
        None => Ok(None),
    }
}

fn schema_key_is_valid(key: &str) -> bool {
    regex_lite::Regex::new(r"^[a-z][a-z0-9_]*$")
        .map(|re| re.is_match(key))
        .unwrap_or(false)
}

pub struct StoryDatabase {
    conn: Mutex<Connection>,
}

impl StoryDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS worlds (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                rules_text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS world_schema (
                id TEXT PRIMARY KEY,
                world_id TEXT NOT NULL REFERENCES worlds(id) ON DELETE CASCADE,
                schema_key TEXT NOT NULL,
                field_type TEXT NOT NULL,
                label TEXT NOT NULL,
                default_value_json TEXT,
                enum_options_json TEXT NOT NULL DEFAULT '[]',
                min REAL,
                max REAL,
                step REAL,
                created_at TEXT NOT NULL,
                UNIQUE(world_id, schema_key)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS characters (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                tags_json TEXT NOT NULL DEFAULT '[]',
                image_url TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS stories (
                id TEXT PRIMARY KEY,
                world_id TEXT NOT NULL REFERENCES worlds(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                premise TEXT NOT NULL,
                ai_prompt TEXT NOT NULL,
                mode TEXT NOT NULL,
                model_override TEXT,
                params_override_json TEXT,
                context_turns_override INTEGER,
                summary_text TEXT,
                turn_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS story_characters (
                id TEXT PRIMARY KEY,
                story_id TEXT NOT NULL REFERENCES stories(id) ON DELETE CASCADE,
                character_id TEXT NOT NULL REFERENCES characters(id) ON DELETE CASCADE,
                is_player INTEGER NOT NULL DEFAULT 0,
                display_name_override TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(story_id, character_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS story_turns (
                id TEXT PRIMARY KEY,
                story_id TEXT NOT NULL REFERENCES stories(id) ON DELETE CASCADE,
                turn_index INTEGER NOT NULL,
                user_input TEXT NOT NULL,
                narrative_text TEXT NOT NULL,
                dialogue_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                UNIQUE(story_id, turn_index)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS story_state_values (
                story_id TEXT NOT NULL REFERENCES stories(id) ON DELETE CASCADE,
                story_character_id TEXT NOT NULL REFERENCES story_characters(id) ON DELETE CASCADE,
                schema_key TEXT NOT NULL,
                value_json TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY(story_id, story_character_id, schema_key)
            )"#,
            [],
        )?;

        // Undo log for turn-applied state writes; rollback replays it in
        // reverse so state lands exactly where it was before the target turn.
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS story_state_changes (
                id TEXT PRIMARY KEY,
                story_id TEXT NOT NULL REFERENCES stories(id) ON DELETE CASCADE,
                turn_index INTEGER NOT NULL,
                story_character_id TEXT NOT NULL,
                schema_key TEXT NOT NULL,
                prev_value_json TEXT,
                new_value_json TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS provider_settings (
                id TEXT PRIMARY KEY,
                api_key TEXT,
                model TEXT NOT NULL,
                temperature REAL NOT NULL,
                max_tokens INTEGER,
                context_turns INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_story_turns_story ON story_turns(story_id, turn_index)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_story_state_changes_story ON story_state_changes(story_id, turn_index)",
            [],
        )?;

        Ok(())
    }

    // ----- worlds -----

    pub fn create_world(&self, name: &str, description: &str, rules_text: &str) -> Result<World> {
        let name = name.trim();
        if name.is_empty() {
            return Err(conflict("world name cannot be empty"));
        }

        let conn = self.lock_conn()?;
        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM worlds WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(conflict(format!("a world named '{}' already exists", name)));
        }

        let now = Utc::now();
        let world = World {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            rules_text: rules_text.to_string(),
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO worlds (id, name, description, rules_text, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                world.id,
                world.name,
                world.description,
                world.rules_text,
                now.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;
        Ok(world)
    }

    pub fn list_worlds(&self) -> Result<Vec<World>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, rules_text, created_at, updated_at
             FROM worlds ORDER BY name",
        )?;
        let worlds = stmt
            .query_map([], row_to_world)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(worlds)
    }

    pub fn get_world(&self, world_id: &str) -> Result<Option<World>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, name, description, rules_text, created_at, updated_at
             FROM worlds WHERE id = ?1",
            [world_id],
            row_to_world,
        )
        .optional()
        .context("Failed to load world")
    }

    pub fn update_world(
        &self,
        world_id: &str,
        name: &str,
        description: &str,
        rules_text: &str,
    ) -> Result<Option<World>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(conflict("world name cannot be empty"));
        }

        {
            let conn = self.lock_conn()?;
            let taken: i64 = conn.query_row(
                "SELECT COUNT(*) FROM worlds WHERE name = ?1 AND id != ?2",
                params![name, world_id],
                |row| row.get(0),
            )?;
            if taken > 0 {
                return Err(conflict(format!("a world named '{}' already exists", name)));
            }

            let updated = conn.execute(
                "UPDATE worlds SET name = ?1, description = ?2, rules_text = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    name,
                    description,
                    rules_text,
                    Utc::now().to_rfc3339(),
                    world_id
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_world(world_id)
    }

    /// Delete a world; schemas, stories, turns and state cascade.
    pub fn delete_world(&self, world_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute("DELETE FROM worlds WHERE id = ?1", [world_id])?;
        Ok(deleted > 0)
    }

    // ----- world schema -----

    #[allow(clippy::too_many_arguments)]
    pub fn create_schema_field(
        &self,
        world_id: &str,
        schema_key: &str,
        field_type: FieldType,
        label: &str,
        default_value_json: Option<&str>,
        enum_options: &[String],
        min: Option<f64>,
        max: Option<f64>,
        step: Option<f64>,
    ) -> Result<WorldSchemaField> {
        let schema_key = schema_key.trim();
        if !schema_key_is_valid(schema_key) {
            return Err(conflict(format!(
                "invalid schema key '{}': expected lowercase snake_case starting with a letter",
                schema_key
            )));
        }
        if field_type == FieldType::Enum && enum_options.is_empty() {
            return Err(conflict("enum fields need at least one option"));
        }

        let conn = self.lock_conn()?;
        let world_exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM worlds WHERE id = ?1",
            [world_id],
            |row| row.get(0),
        )?;
        if world_exists == 0 {
            anyhow::bail!("world {} not found", world_id);
        }
        let duplicate: i64 = conn.query_row(
            "SELECT COUNT(*) FROM world_schema WHERE world_id = ?1 AND schema_key = ?2",
            params![world_id, schema_key],
            |row| row.get(0),
        )?;
        if duplicate > 0 {
            return Err(conflict(format!(
                "schema key '{}' already exists in this world",
                schema_key
            )));
        }

        let now = Utc::now();
        let field = WorldSchemaField {
            id: uuid::Uuid::new_v4().to_string(),
            world_id: world_id.to_string(),
            schema_key: schema_key.to_string(),
            field_type,
            label: label.to_string(),
            default_value_json: default_value_json.map(str::to_string),
            enum_options: enum_options.to_vec(),
            min,
            max,
            step,
            created_at: now,
        };
        let options_json =
            serde_json::to_string(&field.enum_options).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "INSERT INTO world_schema (
                id, world_id, schema_key, field_type, label, default_value_json,
                enum_options_json, min, max, step, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                field.id,
                field.world_id,
                field.schema_key,
                field.field_type.as_db_str(),
                field.label,
                field.default_value_json,
                options_json,
                field.min,
                field.max,
                field.step,
                now.to_rfc3339()
            ],
        )?;
        Ok(field)
    }

    pub fn list_schema_for_world(&self, world_id: &str) -> Result<Vec<WorldSchemaField>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, world_id, schema_key, field_type, label, default_value_json,
                    enum_options_json, min, max, step, created_at
             FROM world_schema WHERE world_id = ?1 ORDER BY schema_key",
        )?;
        let fields = stmt
            .query_map([world_id], row_to_schema_field)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(fields)
    }

    pub fn get_schema_field(&self, field_id: &str) -> Result<Option<WorldSchemaField>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, world_id, schema_key, field_type, label, default_value_json,
                    enum_options_json, min, max, step, created_at
             FROM world_schema WHERE id = ?1",
            [field_id],
            row_to_schema_field,
        )
        .optional()
        .context("Failed to load schema field")
    }

    /// Update the editable parts of a field. The key and type are fixed once
    /// created; stored values are resolved by key.
    pub fn update_schema_field(
        &self,
        field_id: &str,
        label: &str,
        default_value_json: Option<&str>,
        enum_options: &[String],
        min: Option<f64>,
        max: Option<f64>,
        step: Option<f64>,
    ) -> Result<Option<WorldSchemaField>> {
        {
            let conn = self.lock_conn()?;
            let options_json =
                serde_json::to_string(enum_options).unwrap_or_else(|_| "[]".to_string());
            let updated = conn.execute(
                "UPDATE world_schema
                 SET label = ?1, default_value_json = ?2, enum_options_json = ?3,
                     min = ?4, max = ?5, step = ?6
                 WHERE id = ?7",
                params![
                    label,
                    default_value_json,
                    options_json,
                    min,
                    max,
                    step,
                    field_id
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_schema_field(field_id)
    }

    /// Stored values under the deleted key become unknown keys, which the
    /// resolver ignores.
    pub fn delete_schema_field(&self, field_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute("DELETE FROM world_schema WHERE id = ?1", [field_id])?;
        Ok(deleted > 0)
    }

    // ----- characters -----

    pub fn create_character(
        &self,
        name: &str,
        description: &str,
        tags: &[String],
        image_url: Option<&str>,
    ) -> Result<Character> {
        let name = name.trim();
        if name.is_empty() {
            return Err(conflict("character name cannot be empty"));
        }

        let now = Utc::now();
        let character = Character {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            tags: tags.to_vec(),
            image_url: image_url.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        let tags_json = serde_json::to_string(&character.tags).unwrap_or_else(|_| "[]".to_string());

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO characters (id, name, description, tags_json, image_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                character.id,
                character.name,
                character.description,
                tags_json,
                character.image_url,
                now.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;
        Ok(character)
    }

    pub fn list_characters(&self) -> Result<Vec<Character>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, tags_json, image_url, created_at, updated_at
             FROM characters ORDER BY name",
        )?;
        let characters = stmt
            .query_map([], row_to_character)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(characters)
    }

    pub fn get_character(&self, character_id: &str) -> Result<Option<Character>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, name, description, tags_json, image_url, created_at, updated_at
             FROM characters WHERE id = ?1",
            [character_id],
            row_to_character,
        )
        .optional()
        .context("Failed to load character")
    }

    pub fn update_character(
        &self,
        character_id: &str,
        name: &str,
        description: &str,
        tags: &[String],
        image_url: Option<&str>,
    ) -> Result<Option<Character>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(conflict("character name cannot be empty"));
        }
        {
            let conn = self.lock_conn()?;
            let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
            let updated = conn.execute(
                "UPDATE characters
                 SET name = ?1, description = ?2, tags_json = ?3, image_url = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    name,
                    description,
                    tags_json,
                    image_url,
                    Utc::now().to_rfc3339(),
                    character_id
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_character(character_id)
    }

    pub fn delete_character(&self, character_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute("DELETE FROM characters WHERE id = ?1", [character_id])?;
        Ok(deleted > 0)
    }

    // ----- stories -----

    #[allow(clippy::too_many_arguments)]
    pub fn create_story(
        &self,
        world_id: &str,
        title: &str,
        premise: &str,
        ai_prompt: &str,
        mode: StoryMode,
        model_override: Option<&str>,
        params_override_json: Option<&str>,
        context_turns_override: Option<u32>,
    ) -> Result<Story> {
        let title = title.trim();
        if title.is_empty() {
            return Err(conflict("story title cannot be empty"));
        }

        let conn = self.lock_conn()?;
        let world_exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM worlds WHERE id = ?1",
            [world_id],
            |row| row.get(0),
        )?;
        if world_exists == 0 {
            anyhow::bail!("world {} not found", world_id);
        }

        let now = Utc::now();
        let story = Story {
            id: uuid::Uuid::new_v4().to_string(),
            world_id: world_id.to_string(),
            title: title.to_string(),
            premise: premise.to_string(),
            ai_prompt: ai_prompt.to_string(),
            mode,
            model_override: model_override.map(str::to_string),
            params_override_json: params_override_json.map(str::to_string),
            context_turns_override,
            summary_text: None,
            turn_count: 0,
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO stories (
                id, world_id, title, premise, ai_prompt, mode, model_override,
                params_override_json, context_turns_override, summary_text, turn_count,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, 0, ?10, ?11)",
            params![
                story.id,
                story.world_id,
                story.title,
                story.premise,
                story.ai_prompt,
                story.mode.as_db_str(),
                story.model_override,
                story.params_override_json,
                story.context_turns_override,
                now.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;
        Ok(story)
    }

    pub fn list_stories(&self) -> Result<Vec<Story>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, world_id, title, premise, ai_prompt, mode, model_override,
                    params_override_json, context_turns_override, summary_text, turn_count,
                    created_at, updated_at
             FROM stories ORDER BY updated_at DESC",
        )?;
        let stories = stmt
            .query_map([], row_to_story)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stories)
    }

    pub fn get_story(&self, story_id: &str) -> Result<Option<Story>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, world_id, title, premise, ai_prompt, mode, model_override,
                    params_override_json, context_turns_override, summary_text, turn_count,
                    created_at, updated_at
             FROM stories WHERE id = ?1",
            [story_id],
            row_to_story,
        )
        .optional()
        .context("Failed to load story")
    }

    /// Update story metadata and overrides. `turn_count` and `summary_text`
    /// belong to the turn/rollback paths and are not touched here.
    #[allow(clippy::too_many_arguments)]
    pub fn update_story(
        &self,
        story_id: &str,
        title: &str,
        premise: &str,
        ai_prompt: &str,
        mode: StoryMode,
        model_override: Option<&str>,
        params_override_json: Option<&str>,
        context_turns_override: Option<u32>,
    ) -> Result<Option<Story>> {
        let title = title.trim();
        if title.is_empty() {
            return Err(conflict("story title cannot be empty"));
        }
        {
            let conn = self.lock_conn()?;
            let updated = conn.execute(
                "UPDATE stories
                 SET title = ?1, premise = ?2, ai_prompt = ?3, mode = ?4, model_override = ?5,
                     params_override_json = ?6, context_turns_override = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    title,
                    premise,
                    ai_prompt,
                    mode.as_db_str(),
                    model_override,
                    params_override_json,
                    context_turns_override,
                    Utc::now().to_rfc3339(),
                    story_id
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_story(story_id)
    }

    pub fn delete_story(&self, story_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute("DELETE FROM stories WHERE id = ?1", [story_id])?;
        Ok(deleted > 0)
    }

    // ----- story characters -----

    /// Add a character to a story. Setting `is_player` demotes any previous
    /// player so a PLAYER_CHARACTER story never holds two.
    pub fn add_story_character(
        &self,
        story_id: &str,
        character_id: &str,
        is_player: bool,
        display_name_override: Option<&str>,
    ) -> Result<StoryCharacter> {
        let conn = self.lock_conn()?;
        let story_exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stories WHERE id = ?1",
            [story_id],
            |row| row.get(0),
        )?;
        if story_exists == 0 {
            anyhow::bail!("story {} not found", story_id);
        }
        let duplicate: i64 = conn.query_row(
            "SELECT COUNT(*) FROM story_characters WHERE story_id = ?1 AND character_id = ?2",
            params![story_id, character_id],
            |row| row.get(0),
        )?;
        if duplicate > 0 {
            return Err(conflict("character is already in this story"));
        }

        if is_player {
            conn.execute(
                "UPDATE story_characters SET is_player = 0 WHERE story_id = ?1",
                [story_id],
            )?;
        }

        let now = Utc::now();
        let member = StoryCharacter {
            id: uuid::Uuid::new_v4().to_string(),
            story_id: story_id.to_string(),
            character_id: character_id.to_string(),
            is_player,
            display_name_override: display_name_override.map(str::to_string),
            created_at: now,
        };
        conn.execute(
            "INSERT INTO story_characters (id, story_id, character_id, is_player, display_name_override, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                member.id,
                member.story_id,
                member.character_id,
                member.is_player as i64,
                member.display_name_override,
                now.to_rfc3339()
            ],
        )?;
        Ok(member)
    }

    pub fn list_story_characters(&self, story_id: &str) -> Result<Vec<StoryCharacter>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, story_id, character_id, is_player, display_name_override, created_at
             FROM story_characters WHERE story_id = ?1 ORDER BY created_at",
        )?;
        let members = stmt
            .query_map([story_id], row_to_story_character)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    pub fn get_story_character(&self, member_id: &str) -> Result<Option<StoryCharacter>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT id, story_id, character_id, is_player, display_name_override, created_at
             FROM story_characters WHERE id = ?1",
            [member_id],
            row_to_story_character,
        )
        .optional()
        .context("Failed to load story character")
    }

    pub fn update_story_character(
        &self,
        member_id: &str,
        is_player: bool,
        display_name_override: Option<&str>,
    ) -> Result<Option<StoryCharacter>> {
        {
            let conn = self.lock_conn()?;
            if is_player {
                conn.execute(
                    "UPDATE story_characters SET is_player = 0
                     WHERE story_id = (SELECT story_id FROM story_characters WHERE id = ?1)",
                    [member_id],
                )?;
            }
            let updated = conn.execute(
                "UPDATE story_characters SET is_player = ?1, display_name_override = ?2 WHERE id = ?3",
                params![is_player as i64, display_name_override, member_id],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_story_character(member_id)
    }

    pub fn remove_story_character(&self, member_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute("DELETE FROM story_characters WHERE id = ?1", [member_id])?;
        Ok(deleted > 0)
    }

    // ----- turns -----

    pub fn list_turns(&self, story_id: &str) -> Result<Vec<StoryTurn>> {
        let conn = self.lock_conn()?;
        Self::list_turns_on(&conn, story_id)
    }

    fn list_turns_on(conn: &Connection, story_id: &str) -> Result<Vec<StoryTurn>> {
        let mut stmt = conn.prepare(
            "SELECT id, story_id, turn_index, user_input, narrative_text, dialogue_json, created_at
             FROM story_turns WHERE story_id = ?1 ORDER BY turn_index",
        )?;
        let turns = stmt
            .query_map([story_id], row_to_turn)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(turns)
    }

    /// Persist one generated turn and its state writes in a single
    /// transaction. The new turn lands at `turn_count + 1`; each delta
    /// records the previous value in the undo log before the upsert. Returns
    /// the turn and the new turn count.
    pub fn append_turn(
        &self,
        story_id: &str,
        user_input: &str,
        narrative_text: &str,
        dialogue: &[DialogueLine],
        deltas: &[ResolvedDelta],
        summary: Option<&str>,
    ) -> Result<(StoryTurn, i64)> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let turn_count: i64 = tx
            .query_row(
                "SELECT turn_count FROM stories WHERE id = ?1",
                [story_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow::anyhow!("story {} not found", story_id))?;
        let turn_index = turn_count + 1;

        let now = Utc::now();
        let dialogue_json = serde_json::to_string(dialogue).unwrap_or_else(|_| "[]".to_string());
        let turn = StoryTurn {
            id: uuid::Uuid::new_v4().to_string(),
            story_id: story_id.to_string(),
            turn_index,
            user_input: user_input.to_string(),
            narrative_text: narrative_text.to_string(),
            dialogue: dialogue.to_vec(),
            created_at: now,
        };
        tx.execute(
            "INSERT INTO story_turns (id, story_id, turn_index, user_input, narrative_text, dialogue_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                turn.id,
                turn.story_id,
                turn.turn_index,
                turn.user_input,
                turn.narrative_text,
                dialogue_json,
                now.to_rfc3339()
            ],
        )?;

        for delta in deltas {
            let prev: Option<String> = tx
                .query_row(
                    "SELECT value_json FROM story_state_values
                     WHERE story_id = ?1 AND story_character_id = ?2 AND schema_key = ?3",
                    params![story_id, delta.story_character_id, delta.schema_key],
                    |row| row.get(0),
                )
                .optional()?;

            tx.execute(
                "INSERT INTO story_state_changes (id, story_id, turn_index, story_character_id, schema_key, prev_value_json, new_value_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    story_id,
                    turn_index,
                    delta.story_character_id,
                    delta.schema_key,
                    prev,
                    delta.value_json
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO story_state_values (story_id, story_character_id, schema_key, value_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    story_id,
                    delta.story_character_id,
                    delta.schema_key,
                    delta.value_json,
                    now.to_rfc3339()
                ],
            )?;
        }

        match summary {
            Some(summary) => tx.execute(
                "UPDATE stories SET turn_count = ?1, summary_text = ?2, updated_at = ?3 WHERE id = ?4",
                params![turn_index, summary, now.to_rfc3339(), story_id],
            )?,
            None => tx.execute(
                "UPDATE stories SET turn_count = ?1, updated_at = ?2 WHERE id = ?3",
                params![turn_index, now.to_rfc3339(), story_id],
            )?,
        };

        tx.commit()?;
        Ok((turn, turn_index))
    }

    /// Delete every turn with `turn_index >= target` and revert the state
    /// writes they made, in a single transaction. `turn_count` becomes the
    /// max surviving index (0 when none). Returns the surviving turns.
    pub fn rollback_story(&self, story_id: &str, target_index: i64) -> Result<Vec<StoryTurn>> {
        if target_index < 1 {
            return Err(conflict("rollback target must be at least 1"));
        }

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM stories WHERE id = ?1",
            [story_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            anyhow::bail!("story {} not found", story_id);
        }

        // Replay the undo log newest-first so overlapping writes to the same
        // key land on the value from just before the target turn.
        let reverts: Vec<(String, String, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT story_character_id, schema_key, prev_value_json
                 FROM story_state_changes
                 WHERE story_id = ?1 AND turn_index >= ?2
                 ORDER BY turn_index DESC, rowid DESC",
            )?;
            let rows = stmt
                .query_map(params![story_id, target_index], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let now = Utc::now().to_rfc3339();
        for (story_character_id, schema_key, prev_value_json) in reverts {
            match prev_value_json {
                Some(prev) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO story_state_values (story_id, story_character_id, schema_key, value_json, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![story_id, story_character_id, schema_key, prev, now],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM story_state_values
                         WHERE story_id = ?1 AND story_character_id = ?2 AND schema_key = ?3",
                        params![story_id, story_character_id, schema_key],
                    )?;
                }
            }
        }

        tx.execute(
            "DELETE FROM story_state_changes WHERE story_id = ?1 AND turn_index >= ?2",
            params![story_id, target_index],
        )?;
        tx.execute(
            "DELETE FROM story_turns WHERE story_id = ?1 AND turn_index >= ?2",
            params![story_id, target_index],
        )?;

        let new_count: i64 = tx.query_row(
            "SELECT COALESCE(MAX(turn_index), 0) FROM story_turns WHERE story_id = ?1",
            [story_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE stories SET turn_count = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_count, now, story_id],
        )?;

        tx.commit()?;
        Self::list_turns_on(&conn, story_id)
    }

    // ----- state values -----

    pub fn list_state_values(&self, story_id: &str) -> Result<Vec<StoryStateValue>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT story_id, story_character_id, schema_key, value_json, updated_at
             FROM story_state_values WHERE story_id = ?1 ORDER BY story_character_id, schema_key",
        )?;
        let values = stmt
            .query_map([story_id], row_to_state_value)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values)
    }

    /// Stored values for one story character, keyed by schema key. Input to
    /// `state::resolve`.
    pub fn state_map_for_character(
        &self,
        story_id: &str,
        story_character_id: &str,
    ) -> Result<HashMap<String, String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT schema_key, value_json FROM story_state_values
             WHERE story_id = ?1 AND story_character_id = ?2",
        )?;
        let map = stmt
            .query_map(params![story_id, story_character_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(map)
    }

    /// Direct state write from the editor. Outside the turn undo log; the
    /// caller has already validated against the world schema.
    pub fn set_state_value(
        &self,
        story_id: &str,
        story_character_id: &str,
        schema_key: &str,
        value_json: &str,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO story_state_values (story_id, story_character_id, schema_key, value_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                story_id,
                story_character_id,
                schema_key,
                value_json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    // ----- provider settings -----

    pub fn get_provider_settings(&self) -> Result<Option<ProviderSettings>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT api_key, model, temperature, max_tokens, context_turns, updated_at
             FROM provider_settings WHERE id = ?1",
            [PROVIDER_SETTINGS_ID],
            |row| {
                let updated_at_str: String = row.get(5)?;
                Ok(ProviderSettings {
                    api_key: row.get(0)?,
                    model: row.get(1)?,
                    temperature: row.get::<_, f64>(2)? as f32,
                    max_tokens: row.get::<_, Option<i64>>(3)?.map(|v| v as u32),
                    context_turns: row.get::<_, i64>(4)? as u32,
                    updated_at: parse_ts(5, &updated_at_str)?,
                })
            },
        )
        .optional()
        .context("Failed to load provider settings")
    }

    pub fn put_provider_settings(&self, settings: &ProviderSettings) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO provider_settings (id, api_key, model, temperature, max_tokens, context_turns, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                PROVIDER_SETTINGS_ID,
                settings.api_key,
                settings.model,
                settings.temperature as f64,
                settings.max_tokens.map(|v| v as i64),
                settings.context_turns as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

fn row_to_world(row: &rusqlite::Row<'_>) -> rusqlite::Result<World> {
    let created_at_str: String = row.get(4)?;
    let updated_at_str: String = row.get(5)?;
    Ok(World {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        rules_text: row.get(3)?,
        created_at: parse_ts(4, &created_at_str)?,
        updated_at: parse_ts(5, &updated_at_str)?,
    })
}

fn row_to_schema_field(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorldSchemaField> {
    let field_type_raw: String = row.get(3)?;
    let options_json: String = row.get(6)?;
    let created_at_str: String = row.get(10)?;
    Ok(WorldSchemaField {
        id: row.get(0)?,
        world_id: row.get(1)?,
        schema_key: row.get(2)?,
        field_type: FieldType::from_db(&field_type_raw),
        label: row.get(4)?,
        default_value_json: row.get(5)?,
        enum_options: serde_json::from_str(&options_json).unwrap_or_default(),
        min: row.get(7)?,
        max: row.get(8)?,
        step: row.get(9)?,
        created_at: parse_ts(10, &created_at_str)?,
    })
}

fn row_to_character(row: &rusqlite::Row<'_>) -> rusqlite::Result<Character> {
    let tags_json: String = row.get(3)?;
    let created_at_str: String = row.get(5)?;
    let updated_at_str: String = row.get(6)?;
    Ok(Character {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        image_url: row.get(4)?,
        created_at: parse_ts(5, &created_at_str)?,
        updated_at: parse_ts(6, &updated_at_str)?,
    })
}

fn row_to_story(row: &rusqlite::Row<'_>) -> rusqlite::Result<Story> {
    let mode_raw: String = row.get(5)?;
    let created_at_str: String = row.get(11)?;
    let updated_at_str: String = row.get(12)?;
    Ok(Story {
        id: row.get(0)?,
        world_id: row.get(1)?,
        title: row.get(2)?,
        premise: row.get(3)?,
        ai_prompt: row.get(4)?,
        mode: StoryMode::from_db(&mode_raw),
        model_override: row.get(6)?,
        params_override_json: row.get(7)?,
        context_turns_override: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
        summary_text: row.get(9)?,
        turn_count: row.get(10)?,
        created_at: parse_ts(11, &created_at_str)?,
        updated_at: parse_ts(12, &updated_at_str)?,
    })
}

fn row_to_story_character(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoryCharacter> {
    let created_at_str: String = row.get(5)?;
    Ok(StoryCharacter {
        id: row.get(0)?,
        story_id: row.get(1)?,
        character_id: row.get(2)?,
        is_player: row.get::<_, i64>(3)? != 0,
        display_name_override: row.get(4)?,
        created_at: parse_ts(5, &created_at_str)?,
    })
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoryTurn> {
    let dialogue_json: String = row.get(5)?;
    let created_at_str: String = row.get(6)?;
    Ok(StoryTurn {
        id: row.get(0)?,
        story_id: row.get(1)?,
        turn_index: row.get(2)?,
        user_input: row.get(3)?,
        narrative_text: row.get(4)?,
        dialogue: serde_json::from_str(&dialogue_json).unwrap_or_default(),
        created_at: parse_ts(6, &created_at_str)?,
    })
}

fn row_to_state_value(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoryStateValue> {
    let updated_at_str: String = row.get(4)?;
    Ok(StoryStateValue {
        story_id: row.get(0)?,
        story_character_id: row.get(1)?,
        schema_key: row.get(2)?,
        value_json: row.get(3)?,
        updated_at: parse_ts(4, &updated_at_str)?,
    })
}
