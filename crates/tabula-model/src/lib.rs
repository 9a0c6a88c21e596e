//! Shared data model for the dashboard engine.
//!
//! Everything here is persisted as JSON. Field names keep the camelCase
//! wire format the stored data has always used, so snapshots written by
//! older builds keep loading; unknown fields ride along through
//! `#[serde(flatten)]` maps instead of being dropped on rewrite.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type SpaceId = String;
pub type WidgetId = String;

/// Size assigned to a widget record when its factory does not specify one.
pub const DEFAULT_WIDGET_SIZE: &str = "medium";

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn default_true() -> bool {
    true
}

fn default_size() -> String {
    DEFAULT_WIDGET_SIZE.to_string()
}

/// Composite id: `<prefix>-<unix millis>-<8 hex chars>`.
///
/// The millisecond stamp keeps ids roughly sortable by creation time; the
/// random suffix keeps two creations in the same millisecond distinct.
fn composite_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, Utc::now().timestamp_millis(), &suffix[..8])
}

pub fn new_space_id() -> SpaceId {
    composite_id("space")
}

pub fn new_widget_id(kind: &str) -> WidgetId {
    composite_id(kind)
}

pub fn new_template_id() -> String {
    composite_id("template")
}

/// Trims a user-supplied space name; all-whitespace collapses to "Untitled".
pub fn normalize_space_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        "Untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A named, independent collection of widgets. Ids are immutable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub id: SpaceId,
    pub name: String,
    pub icon: String,
    pub created_at: DateTime<Utc>,
}

impl Space {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            id: new_space_id(),
            name: normalize_space_name(name.as_ref()),
            icon: "grid".to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }
}

/// Persisted description of one widget instance.
///
/// `payload` is whatever the widget chose to store; the engine never looks
/// inside it. Fields it does not know about are preserved across rewrites.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetRecord {
    pub id: WidgetId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WidgetRecord {
    /// Minimal record written when a widget is first added.
    pub fn new(kind: impl Into<String>, size: impl Into<String>) -> Self {
        let kind = kind.into();
        let created = Utc::now();
        Self {
            id: new_widget_id(&kind),
            kind,
            enabled: true,
            created_at: created,
            custom_name: None,
            size: size.into(),
            last_updated: created,
            payload: Value::Null,
            extra: Map::new(),
        }
    }

    /// Lenient view over a stored record object. Returns `None` when the
    /// value is not an object or lacks the required `id`/`type` fields.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Global (un-namespaced) dashboard settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub theme: Theme,
    #[serde(default = "Settings::default_grid_columns")]
    pub grid_columns: u32,
    #[serde(default = "Settings::default_widget_gap")]
    pub widget_gap: u32,
    #[serde(default = "Settings::default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub first_run: bool,
}

impl Settings {
    fn default_grid_columns() -> u32 {
        4
    }
    fn default_widget_gap() -> u32 {
        16
    }
    fn default_language() -> String {
        "en".to_string()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: Theme::System,
            grid_columns: Self::default_grid_columns(),
            widget_gap: Self::default_widget_gap(),
            language: Self::default_language(),
            first_run: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    #[serde(other)]
    System,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
            Theme::System => "system",
        }
    }
}

/// A reusable snapshot of one dashboard configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: Value,
}

impl Template {
    pub fn new(name: impl Into<String>, description: impl Into<String>, data: Value) -> Self {
        let created = Utc::now();
        Self {
            id: new_template_id(),
            name: name.into(),
            description: description.into(),
            created_at: created,
            updated_at: created,
            data,
        }
    }
}

/// Freeform-canvas layout for one space, persisted as a single blob since
/// tiles are usually moved together.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanvasState {
    #[serde(default)]
    pub tiles: BTreeMap<String, CanvasTile>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanvasTile {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Ids of records that are present and not explicitly disabled.
pub fn enabled_widget_ids(records: &Map<String, Value>) -> BTreeSet<WidgetId> {
    records
        .iter()
        .filter(|(_, record)| record.get("enabled").and_then(Value::as_bool) != Some(false))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Deterministic instantiation order for a space.
///
/// The explicit order comes first, deduplicated and filtered to ids that
/// still have an enabled record; enabled records missing from the order are
/// appended in lexicographic id order so the tail stays stable across loads.
pub fn reconcile_order(order: &[WidgetId], enabled: &BTreeSet<WidgetId>) -> Vec<WidgetId> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut out = Vec::with_capacity(enabled.len());
    for id in order {
        if enabled.contains(id) && seen.insert(id.as_str()) {
            out.push(id.clone());
        }
    }
    for id in enabled {
        if seen.insert(id.as_str()) {
            out.push(id.clone());
        }
    }
    out
}

/// Top-level merge of `patch` into `target`; patch keys win wholesale.
pub fn merge_shallow(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn composite_ids_carry_prefix_and_are_unique() {
        let a = new_widget_id("todo");
        let b = new_widget_id("todo");
        assert!(a.starts_with("todo-"));
        assert_ne!(a, b);
        assert_eq!(a.split('-').count(), 3);
        let suffix = a.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(new_space_id().starts_with("space-"));
    }

    #[test]
    fn space_names_are_normalized() {
        assert_eq!(normalize_space_name("  Work  "), "Work");
        assert_eq!(normalize_space_name("   "), "Untitled");
        let space = Space::new("   ");
        assert_eq!(space.name, "Untitled");
    }

    #[test]
    fn widget_record_round_trips_with_unknown_fields() {
        let stored = json!({
            "id": "todo-1700000000000-abcd1234",
            "type": "todo",
            "createdAt": "2024-05-20T12:00:00Z",
            "lastUpdated": "2024-05-21T09:30:00Z",
            "size": "large",
            "payload": {"items": ["milk"]},
            "pinned": true
        });
        let record = WidgetRecord::from_value(&stored).expect("record parses");
        assert_eq!(record.kind, "todo");
        assert!(record.enabled, "missing enabled defaults to true");
        assert_eq!(record.extra.get("pinned"), Some(&Value::Bool(true)));

        let back = record.to_value();
        assert_eq!(back["type"], "todo");
        assert_eq!(back["pinned"], Value::Bool(true));
        assert_eq!(back["payload"]["items"][0], "milk");
        assert!(back.get("customName").is_none(), "absent option stays absent");
    }

    #[test]
    fn widget_record_rejects_non_objects() {
        assert!(WidgetRecord::from_value(&json!("nope")).is_none());
        assert!(WidgetRecord::from_value(&json!({"type": "todo"})).is_none());
    }

    #[test]
    fn settings_defaults_and_unknown_theme() {
        let settings = Settings::default();
        assert_eq!(settings.theme, Theme::System);
        assert_eq!(settings.grid_columns, 4);
        assert!(settings.first_run);

        let parsed: Settings =
            serde_json::from_value(json!({"theme": "solarized", "gridColumns": 6}))
                .expect("unknown theme degrades to system");
        assert_eq!(parsed.theme, Theme::System);
        assert_eq!(parsed.grid_columns, 6);
        assert_eq!(parsed.language, "en");
    }

    #[test]
    fn enabled_ids_exclude_explicitly_disabled_records() {
        let mut records = Map::new();
        records.insert("todo-1".into(), json!({"id": "todo-1", "type": "todo"}));
        records.insert(
            "notes-1".into(),
            json!({"id": "notes-1", "type": "notes", "enabled": false}),
        );
        let enabled = enabled_widget_ids(&records);
        assert!(enabled.contains("todo-1"));
        assert!(!enabled.contains("notes-1"));
    }

    #[test]
    fn reconcile_keeps_explicit_order_then_appends_remainder() {
        let enabled: BTreeSet<String> =
            ["todo-1", "notes-1", "links-1"].iter().map(|s| s.to_string()).collect();
        let order = vec!["todo-1".to_string()];
        assert_eq!(
            reconcile_order(&order, &enabled),
            vec!["todo-1", "links-1", "notes-1"]
        );
    }

    #[test]
    fn reconcile_drops_stale_ids_and_duplicates() {
        let enabled: BTreeSet<String> = ["a-1", "b-1"].iter().map(|s| s.to_string()).collect();
        let order = vec![
            "gone-1".to_string(),
            "b-1".to_string(),
            "b-1".to_string(),
            "a-1".to_string(),
        ];
        assert_eq!(reconcile_order(&order, &enabled), vec!["b-1", "a-1"]);
    }

    #[test]
    fn merge_shallow_replaces_top_level_keys_only() {
        let mut target = json!({
            "id": "todo-1",
            "payload": {"items": ["a"], "done": 1},
            "size": "small"
        });
        let patch = json!({"payload": {"items": ["b"]}, "customName": "Chores"});
        let target_map = target.as_object_mut().unwrap();
        merge_shallow(target_map, patch.as_object().unwrap());

        assert_eq!(target_map["id"], "todo-1");
        assert_eq!(target_map["size"], "small");
        assert_eq!(target_map["customName"], "Chores");
        // Shallow: the whole payload object was replaced, not deep-merged.
        assert_eq!(target_map["payload"], json!({"items": ["b"]}));
    }

    #[test]
    fn canvas_state_serializes_tiles_by_id() {
        let mut state = CanvasState::default();
        state.tiles.insert(
            "tile-1".into(),
            CanvasTile {
                x: 10.0,
                y: 20.0,
                w: 2.0,
                h: 1.0,
                color: Some("#aabbcc".into()),
            },
        );
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["tiles"]["tile-1"]["x"], 10.0);
        let back: CanvasState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }
}
