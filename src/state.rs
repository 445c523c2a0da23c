//! Schema-driven character state.
//!
//! A world defines typed fields (`world_schema`); stories store per-character
//! values as JSON text. Everything goes through the single codec here instead
//! of ad-hoc JSON parsing at each call site.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::database::WorldSchemaField;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Bool,
    Enum,
    ListText,
}

impl FieldType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
            FieldType::Enum => "enum",
            FieldType::ListText => "list_text",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        Self::parse(raw).unwrap_or(FieldType::Text)
    }

    /// Strict parse for API input.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(FieldType::Text),
            "number" => Some(FieldType::Number),
            "bool" => Some(FieldType::Bool),
            "enum" => Some(FieldType::Enum),
            "list_text" => Some(FieldType::ListText),
            _ => None,
        }
    }
}

/// Tagged union over the five schema field types.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Enum(String),
    ListText(Vec<String>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::Number(_) => FieldType::Number,
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Enum(_) => FieldType::Enum,
            FieldValue::ListText(_) => FieldType::ListText,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Text(s) | FieldValue::Enum(s) => serde_json::Value::from(s.clone()),
            FieldValue::Number(n) => serde_json::json!(n),
            FieldValue::Bool(b) => serde_json::Value::from(*b),
            FieldValue::ListText(items) => serde_json::Value::from(items.clone()),
        }
    }

    /// Serialize for the `value_json` column.
    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }

    /// Interpret a JSON value as `field_type`. Number accepts a numeric
    /// string; bool is strict true/false.
    pub fn from_json(field_type: FieldType, value: &serde_json::Value) -> Result<Self> {
        match field_type {
            FieldType::Text => match value.as_str() {
                Some(s) => Ok(FieldValue::Text(s.to_string())),
                None => bail!("expected a string, got {}", value),
            },
            FieldType::Enum => match value.as_str() {
                Some(s) => Ok(FieldValue::Enum(s.to_string())),
                None => bail!("expected a string, got {}", value),
            },
            FieldType::Number => {
                let parsed = match value {
                    serde_json::Value::Number(n) => n.as_f64(),
                    serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                match parsed {
                    Some(n) if n.is_finite() => Ok(FieldValue::Number(n)),
                    _ => bail!("expected a finite number, got {}", value),
                }
            }
            FieldType::Bool => match value.as_bool() {
                Some(b) => Ok(FieldValue::Bool(b)),
                None => bail!("expected true or false, got {}", value),
            },
            FieldType::ListText => match value.as_array() {
                Some(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        match item.as_str() {
                            Some(s) => out.push(s.to_string()),
                            None => bail!("expected a list of strings, got {}", value),
                        }
                    }
                    Ok(FieldValue::ListText(out))
                }
                None => bail!("expected a list of strings, got {}", value),
            },
        }
    }

    /// Deserialize a `value_json` column as `field_type`.
    pub fn decode(field_type: FieldType, raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_json(field_type, &value)
    }
}

/// Computed default for a schema field: the stored default if it decodes,
/// otherwise the type fallback (number 0, bool false, list_text [],
/// text/enum "").
pub fn default_for(field: &WorldSchemaField) -> FieldValue {
    if let Some(raw) = field.default_value_json.as_deref() {
        if let Ok(value) = FieldValue::decode(field.field_type, raw) {
            return value;
        }
    }
    type_fallback(field.field_type)
}

pub fn type_fallback(field_type: FieldType) -> FieldValue {
    match field_type {
        FieldType::Text => FieldValue::Text(String::new()),
        FieldType::Number => FieldValue::Number(0.0),
        FieldType::Bool => FieldValue::Bool(false),
        FieldType::Enum => FieldValue::Enum(String::new()),
        FieldType::ListText => FieldValue::ListText(Vec::new()),
    }
}

/// Validate a write against its schema field and normalize it: numbers are
/// clamped to [min, max] when declared, enum values must be a declared
/// option, list items are trimmed with empties dropped.
pub fn validate(field: &WorldSchemaField, value: &serde_json::Value) -> Result<FieldValue> {
    let parsed = FieldValue::from_json(field.field_type, value)?;
    match parsed {
        FieldValue::Number(mut n) => {
            if let Some(min) = field.min {
                n = n.max(min);
            }
            if let Some(max) = field.max {
                n = n.min(max);
            }
            Ok(FieldValue::Number(n))
        }
        FieldValue::Enum(s) => {
            if field.enum_options.iter().any(|option| option == &s) {
                Ok(FieldValue::Enum(s))
            } else {
                bail!(
                    "'{}' is not an option for {} (options: {})",
                    s,
                    field.schema_key,
                    field.enum_options.join(", ")
                );
            }
        }
        FieldValue::ListText(items) => Ok(FieldValue::ListText(
            items
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        )),
        other => Ok(other),
    }
}

/// Produce a complete value map covering every schema key: stored value when
/// it decodes, computed default otherwise. Stored keys without a schema row
/// are ignored (forward-compatible with schema deletions).
pub fn resolve(
    fields: &[WorldSchemaField],
    stored: &HashMap<String, String>,
) -> BTreeMap<String, FieldValue> {
    let mut resolved = BTreeMap::new();
    for field in fields {
        let value = stored
            .get(&field.schema_key)
            .and_then(|raw| FieldValue::decode(field.field_type, raw).ok())
            .unwrap_or_else(|| default_for(field));
        resolved.insert(field.schema_key.clone(), value);
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn field(key: &str, field_type: FieldType) -> WorldSchemaField {
        WorldSchemaField {
            id: format!("field-{}", key),
            world_id: "world-1".to_string(),
            schema_key: key.to_string(),
            field_type,
            label: key.to_string(),
            default_value_json: None,
            enum_options: Vec::new(),
            min: None,
            max: None,
            step: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_store_resolves_type_fallbacks_for_every_key() {
        let fields = vec![
            field("hp", FieldType::Number),
            field("alive", FieldType::Bool),
            field("inventory", FieldType::ListText),
            field("mood", FieldType::Text),
            field("stance", FieldType::Enum),
        ];
        let resolved = resolve(&fields, &HashMap::new());

        assert_eq!(resolved.len(), 5);
        assert_eq!(resolved["hp"], FieldValue::Number(0.0));
        assert_eq!(resolved["alive"], FieldValue::Bool(false));
        assert_eq!(resolved["inventory"], FieldValue::ListText(Vec::new()));
        assert_eq!(resolved["mood"], FieldValue::Text(String::new()));
        assert_eq!(resolved["stance"], FieldValue::Enum(String::new()));
    }

    #[test]
    fn declared_default_beats_type_fallback() {
        let mut hp = field("hp", FieldType::Number);
        hp.default_value_json = Some("100".to_string());

        let resolved = resolve(&[hp], &HashMap::new());
        assert_eq!(resolved["hp"], FieldValue::Number(100.0));
    }

    #[test]
    fn unparseable_default_falls_back_by_type() {
        let mut hp = field("hp", FieldType::Number);
        hp.default_value_json = Some("\"full health\"".to_string());
        assert_eq!(default_for(&hp), FieldValue::Number(0.0));
    }

    #[test]
    fn stored_value_wins_and_unknown_keys_are_ignored() {
        let fields = vec![field("hp", FieldType::Number)];
        let mut stored = HashMap::new();
        stored.insert("hp".to_string(), "42".to_string());
        stored.insert("deleted_key".to_string(), "\"stale\"".to_string());

        let resolved = resolve(&fields, &stored);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["hp"], FieldValue::Number(42.0));
    }

    #[test]
    fn malformed_stored_value_resolves_to_default() {
        let mut hp = field("hp", FieldType::Number);
        hp.default_value_json = Some("10".to_string());
        let mut stored = HashMap::new();
        stored.insert("hp".to_string(), "not json".to_string());

        let resolved = resolve(&[hp], &stored);
        assert_eq!(resolved["hp"], FieldValue::Number(10.0));
    }

    #[test]
    fn number_validation_clamps_and_rejects_non_finite() {
        let mut hp = field("hp", FieldType::Number);
        hp.min = Some(0.0);
        hp.max = Some(100.0);

        assert_eq!(
            validate(&hp, &serde_json::json!(250)).expect("clamps high"),
            FieldValue::Number(100.0)
        );
        assert_eq!(
            validate(&hp, &serde_json::json!(-3)).expect("clamps low"),
            FieldValue::Number(0.0)
        );
        assert_eq!(
            validate(&hp, &serde_json::json!("55")).expect("numeric string"),
            FieldValue::Number(55.0)
        );
        assert!(validate(&hp, &serde_json::json!("plenty")).is_err());
    }

    #[test]
    fn enum_validation_requires_declared_option() {
        let mut stance = field("stance", FieldType::Enum);
        stance.enum_options = vec!["aggressive".to_string(), "defensive".to_string()];

        assert_eq!(
            validate(&stance, &serde_json::json!("defensive")).expect("valid option"),
            FieldValue::Enum("defensive".to_string())
        );
        assert!(validate(&stance, &serde_json::json!("sneaky")).is_err());
    }

    #[test]
    fn list_text_validation_trims_and_drops_empties() {
        let inventory = field("inventory", FieldType::ListText);
        let validated = validate(
            &inventory,
            &serde_json::json!(["  sword  ", "", "rope", "   "]),
        )
        .expect("list validates");
        assert_eq!(
            validated,
            FieldValue::ListText(vec!["sword".to_string(), "rope".to_string()])
        );
    }

    #[test]
    fn bool_validation_is_strict() {
        let alive = field("alive", FieldType::Bool);
        assert!(validate(&alive, &serde_json::json!("true")).is_err());
        assert_eq!(
            validate(&alive, &serde_json::json!(true)).expect("strict bool"),
            FieldValue::Bool(true)
        );
    }

    #[test]
    fn codec_round_trips_through_value_json() {
        let value = FieldValue::ListText(vec!["torch".to_string()]);
        let encoded = value.encode();
        assert_eq!(
            FieldValue::decode(FieldType::ListText, &encoded).expect("decodes"),
            value
        );
    }
}
