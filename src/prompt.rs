//! Turn context assembly: everything the generation model sees for one turn.

use std::collections::BTreeMap;

use crate::database::{Character, Story, StoryCharacter, StoryMode, StoryTurn, World};
use crate::llm_client::Message;
use crate::state::FieldValue;

/// One story member with its profile and resolved state, ready to render.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub member: StoryCharacter,
    pub character: Character,
    pub state: BTreeMap<String, FieldValue>,
}

impl RosterEntry {
    pub fn display_name(&self) -> &str {
        self.member
            .display_name_override
            .as_deref()
            .unwrap_or(&self.character.name)
    }
}

const OUTPUT_CONTRACT: &str = r#"Respond with a single JSON object and nothing else:
{
  "narrative_text": "the next scene, in prose",
  "dialogue": [{"speaker_story_character_id": "<id>" OR "speaker": "<name>", "text": "..."}],
  "state_deltas": [{"story_character_id": "<id>" OR "character": "<name>", "schema_key": "<key>", "value": <json value>}],
  "summary": "optional updated running summary of the whole story"
}
"dialogue", "state_deltas" and "summary" may be omitted. Only change state through "state_deltas", and only for keys listed in the character sheets."#;

/// Build the bounded message list for one generation call. `recent_turns`
/// is already windowed by the caller (most recent N, oldest first).
pub fn build_messages(
    world: &World,
    story: &Story,
    roster: &[RosterEntry],
    recent_turns: &[StoryTurn],
    user_input: &str,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(recent_turns.len() * 2 + 2);
    messages.push(Message::system(build_system_prompt(world, story, roster)));

    for turn in recent_turns {
        messages.push(Message::user(turn.user_input.clone()));
        messages.push(Message::assistant(render_turn(turn, roster)));
    }

    messages.push(Message::user(user_input.to_string()));
    messages
}

fn build_system_prompt(world: &World, story: &Story, roster: &[RosterEntry]) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "You are the narrator of an interactive story set in the world \"{}\".",
        world.name
    ));

    match story.mode {
        StoryMode::PlayerCharacter => {
            let player = roster
                .iter()
                .find(|entry| entry.member.is_player)
                .map(RosterEntry::display_name)
                .unwrap_or("the player");
            sections.push(format!(
                "The user plays {}. Their input is what {} says and does; never decide {}'s actions or words for them.",
                player, player, player
            ));
        }
        StoryMode::Director => {
            sections.push(
                "The user directs the story from outside the scene. Their input is stage direction; realize it through the characters."
                    .to_string(),
            );
        }
    }

    if !world.rules_text.trim().is_empty() {
        sections.push(format!("World rules:\n{}", world.rules_text.trim()));
    }
    if !story.premise.trim().is_empty() {
        sections.push(format!("Premise:\n{}", story.premise.trim()));
    }
    if !story.ai_prompt.trim().is_empty() {
        sections.push(format!("Instructions:\n{}", story.ai_prompt.trim()));
    }

    if !roster.is_empty() {
        let mut sheet = String::from("Characters:\n");
        for entry in roster {
            sheet.push_str(&format!(
                "- {} (story_character_id: {}{})",
                entry.display_name(),
                entry.member.id,
                if entry.member.is_player {
                    ", player"
                } else {
                    ""
                }
            ));
            if !entry.character.description.trim().is_empty() {
                sheet.push_str(&format!(": {}", entry.character.description.trim()));
            }
            sheet.push('\n');
            for (key, value) in &entry.state {
                sheet.push_str(&format!("    {} = {}\n", key, value.to_json()));
            }
        }
        sections.push(sheet.trim_end().to_string());
    }

    if let Some(summary) = story.summary_text.as_deref() {
        if !summary.trim().is_empty() {
            sections.push(format!("Story so far:\n{}", summary.trim()));
        }
    }

    sections.push(OUTPUT_CONTRACT.to_string());
    sections.join("\n\n")
}

/// Render a stored turn the way the model should have produced it: prose
/// plus attributed dialogue lines.
fn render_turn(turn: &StoryTurn, roster: &[RosterEntry]) -> String {
    let mut text = turn.narrative_text.clone();
    for line in &turn.dialogue {
        let speaker = line
            .speaker_story_character_id
            .as_deref()
            .and_then(|id| {
                roster
                    .iter()
                    .find(|entry| entry.member.id == id)
                    .map(RosterEntry::display_name)
            })
            .or(line.speaker.as_deref())
            .unwrap_or("Someone");
        text.push_str(&format!("\n{}: {}", speaker, line.text));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::StoryMode;
    use crate::llm_client::DialogueLine;
    use chrono::Utc;

    fn world() -> World {
        World {
            id: "world-1".to_string(),
            name: "Eldoria".to_string(),
            description: "High fantasy".to_string(),
            rules_text: "Magic is scarce and feared.".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn story(mode: StoryMode) -> Story {
        Story {
            id: "story-1".to_string(),
            world_id: "world-1".to_string(),
            title: "The Ashen Road".to_string(),
            premise: "A caravan has gone missing.".to_string(),
            ai_prompt: "Keep scenes short.".to_string(),
            mode,
            model_override: None,
            params_override_json: None,
            context_turns_override: None,
            summary_text: Some("Mira left the village at dawn.".to_string()),
            turn_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn roster_entry(member_id: &str, name: &str, is_player: bool) -> RosterEntry {
        RosterEntry {
            member: StoryCharacter {
                id: member_id.to_string(),
                story_id: "story-1".to_string(),
                character_id: format!("char-{}", member_id),
                is_player,
                display_name_override: None,
                created_at: Utc::now(),
            },
            character: Character {
                id: format!("char-{}", member_id),
                name: name.to_string(),
                description: "A wary scout".to_string(),
                tags: Vec::new(),
                image_url: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            state: BTreeMap::from([("hp".to_string(), FieldValue::Number(80.0))]),
        }
    }

    fn turn(index: i64, input: &str, narrative: &str) -> StoryTurn {
        StoryTurn {
            id: format!("turn-{}", index),
            story_id: "story-1".to_string(),
            turn_index: index,
            user_input: input.to_string(),
            narrative_text: narrative.to_string(),
            dialogue: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn system_prompt_carries_rules_roster_state_and_contract() {
        let roster = vec![roster_entry("m1", "Mira", true)];
        let messages = build_messages(&world(), &story(StoryMode::PlayerCharacter), &roster, &[], "Hello");

        assert_eq!(messages.len(), 2);
        let system = &messages[0].content;
        assert!(system.contains("Magic is scarce and feared."));
        assert!(system.contains("The user plays Mira."));
        assert!(system.contains("hp = 80"));
        assert!(system.contains("story_character_id: m1"));
        assert!(system.contains("narrative_text"));
        assert!(system.contains("Story so far:\nMira left the village at dawn."));
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "Hello");
    }

    #[test]
    fn director_mode_swaps_player_instructions() {
        let roster = vec![roster_entry("m1", "Mira", false)];
        let messages = build_messages(&world(), &story(StoryMode::Director), &roster, &[], "Cut to the hills");
        assert!(messages[0].content.contains("directs the story from outside"));
        assert!(!messages[0].content.contains("The user plays"));
    }

    #[test]
    fn recent_turns_become_alternating_history() {
        let roster = vec![roster_entry("m1", "Mira", true)];
        let turns = vec![turn(1, "look around", "Ash drifts."), turn(2, "go north", "The hills loom.")];
        let messages = build_messages(&world(), &story(StoryMode::PlayerCharacter), &roster, &turns, "camp here");

        assert_eq!(messages.len(), 6);
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "look around");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[2].content, "Ash drifts.");
        assert_eq!(messages[5].content, "camp here");
    }

    #[test]
    fn stored_dialogue_is_rendered_with_resolved_speaker_names() {
        let roster = vec![roster_entry("m1", "Mira", true)];
        let mut with_dialogue = turn(1, "listen", "The wind dies.");
        with_dialogue.dialogue = vec![
            DialogueLine {
                speaker_story_character_id: Some("m1".to_string()),
                speaker: None,
                text: "Quiet now.".to_string(),
            },
            DialogueLine {
                speaker_story_character_id: None,
                speaker: Some("Stranger".to_string()),
                text: "Who goes there?".to_string(),
            },
        ];

        let messages = build_messages(
            &world(),
            &story(StoryMode::PlayerCharacter),
            &roster,
            &[with_dialogue],
            "answer",
        );
        let assistant = &messages[2].content;
        assert!(assistant.contains("Mira: Quiet now."));
        assert!(assistant.contains("Stranger: Who goes there?"));
    }
}
