//! Space (namespace) management over the cached store.
//!
//! A space is an independent widget collection with its own records, order
//! and canvas layout, all living under `spaces.<id>.*` keys. [`SpaceManager`]
//! owns the space list and the active pointer in memory and treats storage
//! as a sink: mutations update memory synchronously, then persist whatever
//! snapshot memory holds. Global `settings` and `templates` keys get their
//! own small stores at the bottom of this file.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use tabula_events::Bus;
use tabula_model::{
    merge_shallow, normalize_space_name, CanvasState, Settings, Space, SpaceId, Template,
};
use tabula_store::{CachedStore, ExportBundle, ImportError};
use tabula_topics as topics;

/// Space list (array of space objects).
pub const KEY_SPACES: &str = "spaces";
/// Active-space pointer (string id).
pub const KEY_ACTIVE_SPACE: &str = "spaces.active";
/// Global dashboard settings.
pub const KEY_SETTINGS: &str = "settings";
/// Template collection (map keyed by template id).
pub const KEY_TEMPLATES: &str = "templates";
/// Pre-spaces widget records, migrated once at load.
pub const LEGACY_KEY_WIDGETS: &str = "widgets";
/// Pre-spaces widget order, migrated once at load.
pub const LEGACY_KEY_WIDGET_ORDER: &str = "widgetOrder";

pub fn widgets_key(space: &str) -> String {
    format!("spaces.{space}.widgets")
}

pub fn widget_order_key(space: &str) -> String {
    format!("spaces.{space}.widgetOrder")
}

pub fn canvas_key(space: &str) -> String {
    format!("spaces.{space}.canvas")
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SpaceError {
    #[error("the last remaining space cannot be deleted")]
    LastSpace,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn order_from_value(raw: &Value) -> Vec<String> {
    raw.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

struct SpacesState {
    spaces: Vec<Space>,
    active: SpaceId,
}

/// Cheap-clone handle onto the space list, the active pointer and the
/// per-space storage paths. All clones share state.
#[derive(Clone)]
pub struct SpaceManager {
    store: CachedStore,
    bus: Bus,
    state: Arc<RwLock<SpacesState>>,
    /// Serializes read-modify-write of per-space record maps so concurrent
    /// widget saves cannot lose each other's entries.
    record_gate: Arc<Mutex<()>>,
}

impl SpaceManager {
    /// Builds the manager from stored state. First run creates the default
    /// `"Home"` space; a dangling active pointer falls back to the first
    /// space; legacy un-namespaced widget data is migrated once.
    pub async fn load(store: CachedStore, bus: Bus) -> Self {
        let manager = Self {
            store,
            bus,
            state: Arc::new(RwLock::new(SpacesState {
                spaces: Vec::new(),
                active: SpaceId::new(),
            })),
            record_gate: Arc::new(Mutex::new(())),
        };
        manager.reload().await;
        manager
    }

    /// Rebuilds in-memory state from the store. Called at load and after
    /// import/clear, when everything held in memory is stale.
    pub async fn reload(&self) {
        let raw = self.store.get(KEY_SPACES, Value::Array(Vec::new())).await;
        let mut spaces: Vec<Space> = Vec::new();
        if let Some(items) = raw.as_array() {
            for item in items {
                match serde_json::from_value::<Space>(item.clone()) {
                    Ok(space) => spaces.push(space),
                    Err(err) => warn!(
                        target: "tabula::spaces",
                        error = %err,
                        "skipping unreadable space entry"
                    ),
                }
            }
        }

        if spaces.is_empty() {
            let home = Space::new("Home").with_icon("home");
            info!(target: "tabula::spaces", space = %home.id, "creating default space");
            spaces.push(home);
            self.persist_spaces(&spaces).await;
        }

        let stored_active = self
            .store
            .get(KEY_ACTIVE_SPACE, Value::Null)
            .await
            .as_str()
            .map(str::to_string);
        let first_id = spaces[0].id.clone();
        let active = match stored_active {
            Some(id) if spaces.iter().any(|s| s.id == id) => id,
            other => {
                if let Some(id) = other {
                    debug!(
                        target: "tabula::spaces",
                        stale = %id,
                        "active pointer names an unknown space; falling back"
                    );
                }
                self.store
                    .set(KEY_ACTIVE_SPACE, Value::String(first_id.clone()), true)
                    .await;
                first_id.clone()
            }
        };

        self.migrate_legacy(&first_id).await;

        let mut state = self.state.write().await;
        state.spaces = spaces;
        state.active = active;
    }

    /// One-time migration of pre-spaces data: legacy records and order are
    /// merged into the first space (existing per-space entries win on id
    /// collision), then the legacy keys are deleted.
    async fn migrate_legacy(&self, target_space: &str) {
        let legacy_records = self.store.get(LEGACY_KEY_WIDGETS, Value::Null).await;
        let legacy_order = self.store.get(LEGACY_KEY_WIDGET_ORDER, Value::Null).await;
        if legacy_records.is_null() && legacy_order.is_null() {
            return;
        }

        if let Some(legacy) = legacy_records.as_object() {
            if !legacy.is_empty() {
                let key = widgets_key(target_space);
                let mut records = self.store.get_map(&key).await;
                let mut migrated = 0usize;
                for (id, record) in legacy {
                    if !records.contains_key(id) {
                        records.insert(id.clone(), record.clone());
                        migrated += 1;
                    }
                }
                if migrated > 0 {
                    self.store.set(&key, Value::Object(records), true).await;
                }
                info!(
                    target: "tabula::spaces",
                    space = %target_space,
                    migrated,
                    "migrated legacy widget records"
                );
            }
        }

        let legacy_ids = order_from_value(&legacy_order);
        if !legacy_ids.is_empty() {
            let key = widget_order_key(target_space);
            let mut order = order_from_value(&self.store.get(&key, Value::Array(Vec::new())).await);
            for id in legacy_ids {
                if !order.contains(&id) {
                    order.push(id);
                }
            }
            self.store
                .set(
                    &key,
                    Value::Array(order.into_iter().map(Value::String).collect()),
                    true,
                )
                .await;
        }

        self.store.remove(LEGACY_KEY_WIDGETS).await;
        self.store.remove(LEGACY_KEY_WIDGET_ORDER).await;
    }

    async fn persist_spaces(&self, spaces: &[Space]) {
        match serde_json::to_value(spaces) {
            Ok(value) => self.store.set(KEY_SPACES, value, true).await,
            Err(err) => warn!(
                target: "tabula::spaces",
                error = %err,
                "space list serialization failed; not persisted"
            ),
        }
    }

    pub async fn spaces(&self) -> Vec<Space> {
        self.state.read().await.spaces.clone()
    }

    pub async fn active_space_id(&self) -> SpaceId {
        self.state.read().await.active.clone()
    }

    pub async fn active_space(&self) -> Option<Space> {
        let state = self.state.read().await;
        state.spaces.iter().find(|s| s.id == state.active).cloned()
    }

    pub async fn create_space(&self, name: &str) -> Space {
        let space = Space::new(name);
        let snapshot = {
            let mut state = self.state.write().await;
            state.spaces.push(space.clone());
            state.spaces.clone()
        };
        self.persist_spaces(&snapshot).await;
        info!(target: "tabula::spaces", space = %space.id, name = %space.name, "space created");
        self.bus.publish(topics::TOPIC_SPACE_CREATED, &space);
        space
    }

    /// Renames a space and/or changes its icon. Returns false for an
    /// unknown id.
    pub async fn update_space(&self, id: &str, name: Option<&str>, icon: Option<&str>) -> bool {
        let (snapshot, updated) = {
            let mut state = self.state.write().await;
            let Some(space) = state.spaces.iter_mut().find(|s| s.id == id) else {
                debug!(target: "tabula::spaces", space = %id, "update of unknown space ignored");
                return false;
            };
            if let Some(name) = name {
                space.name = normalize_space_name(name);
            }
            if let Some(icon) = icon {
                space.icon = icon.to_string();
            }
            let updated = space.clone();
            (state.spaces.clone(), updated)
        };
        self.persist_spaces(&snapshot).await;
        self.bus.publish(topics::TOPIC_SPACE_UPDATED, &updated);
        true
    }

    /// Deletes a space and garbage-collects its storage in the background.
    ///
    /// The last remaining space can never be deleted, whatever id is passed;
    /// deleting an unknown id is a quiet no-op; deleting the active space
    /// switches to the first remaining one before the delete is announced.
    pub async fn delete_space(&self, id: &str) -> Result<(), SpaceError> {
        let (snapshot, switched_to) = {
            let mut state = self.state.write().await;
            if state.spaces.len() <= 1 {
                return Err(SpaceError::LastSpace);
            }
            let Some(pos) = state.spaces.iter().position(|s| s.id == id) else {
                debug!(target: "tabula::spaces", space = %id, "delete of unknown space ignored");
                return Ok(());
            };
            state.spaces.remove(pos);
            let switched_to = if state.active == id {
                state.active = state.spaces[0].id.clone();
                Some(state.active.clone())
            } else {
                None
            };
            (state.spaces.clone(), switched_to)
        };

        self.persist_spaces(&snapshot).await;
        if let Some(to) = &switched_to {
            self.store
                .set(KEY_ACTIVE_SPACE, Value::String(to.clone()), true)
                .await;
            self.bus
                .publish(topics::TOPIC_SPACE_SWITCHED, &json!({"from": id, "to": to}));
        }
        info!(target: "tabula::spaces", space = %id, "space deleted");
        self.bus
            .publish(topics::TOPIC_SPACE_DELETED, &json!({"id": id}));

        // Reclaim the dead space's keys off the critical path; the store
        // logs (and swallows) any backend failure.
        let store = self.store.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            store.remove(&widgets_key(&id)).await;
            store.remove(&widget_order_key(&id)).await;
            store.remove(&canvas_key(&id)).await;
            debug!(target: "tabula::spaces", space = %id, "space storage reclaimed");
        });
        Ok(())
    }

    /// Makes `id` the active space. Unknown ids and the already-active
    /// space are quiet no-ops.
    pub async fn switch_space(&self, id: &str) {
        let from = {
            let mut state = self.state.write().await;
            if !state.spaces.iter().any(|s| s.id == id) {
                debug!(target: "tabula::spaces", space = %id, "switch to unknown space ignored");
                return;
            }
            if state.active == id {
                return;
            }
            let from = state.active.clone();
            state.active = id.to_string();
            from
        };
        self.store
            .set(KEY_ACTIVE_SPACE, Value::String(id.to_string()), true)
            .await;
        info!(target: "tabula::spaces", from = %from, to = %id, "active space switched");
        self.bus
            .publish(topics::TOPIC_SPACE_SWITCHED, &json!({"from": from, "to": id}));
    }

    /// Widget records for a space, keyed by widget id.
    pub async fn widgets_for_space(&self, space: &str) -> Map<String, Value> {
        self.store.get_map(&widgets_key(space)).await
    }

    /// Shallow-merges `partial` into the stored record (or a fresh `{id}`
    /// object), stamps `lastUpdated`, and persists on the debounce. This is
    /// the high-frequency path widgets hit on every payload change.
    pub async fn save_widget_in_space(
        &self,
        space: &str,
        widget_id: &str,
        partial: &Map<String, Value>,
    ) {
        let _guard = self.record_gate.lock().await;
        let key = widgets_key(space);
        let mut records = self.store.get_map(&key).await;
        let mut record = records
            .get(widget_id)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(|| {
                let mut fresh = Map::new();
                fresh.insert("id".to_string(), Value::String(widget_id.to_string()));
                fresh
            });
        merge_shallow(&mut record, partial);
        record.insert("lastUpdated".to_string(), Value::String(now_rfc3339()));
        records.insert(widget_id.to_string(), Value::Object(record));
        self.store.set(&key, Value::Object(records), false).await;
    }

    /// Drops a record and persists immediately.
    pub async fn remove_widget_from_space(&self, space: &str, widget_id: &str) {
        let _guard = self.record_gate.lock().await;
        let key = widgets_key(space);
        let mut records = self.store.get_map(&key).await;
        if records.remove(widget_id).is_some() {
            self.store.set(&key, Value::Object(records), true).await;
        }
    }

    pub async fn widget_order_for_space(&self, space: &str) -> Vec<String> {
        order_from_value(
            &self
                .store
                .get(&widget_order_key(space), Value::Array(Vec::new()))
                .await,
        )
    }

    /// Order persists immediately: a lost reorder is user-visible in a way
    /// a lost payload keystroke is not.
    pub async fn save_widget_order_for_space(&self, space: &str, order: &[String]) {
        let value = Value::Array(order.iter().map(|id| Value::String(id.clone())).collect());
        self.store.set(&widget_order_key(space), value, true).await;
    }

    pub async fn canvas_for_space(&self, space: &str) -> CanvasState {
        let raw = self.store.get(&canvas_key(space), Value::Null).await;
        serde_json::from_value(raw).unwrap_or_default()
    }

    /// Canvas writes ride the debounce; tiles move in bursts.
    pub async fn save_canvas_for_space(&self, space: &str, state: &CanvasState) {
        match serde_json::to_value(state) {
            Ok(value) => self.store.set(&canvas_key(space), value, false).await,
            Err(err) => warn!(
                target: "tabula::spaces",
                space = %space,
                error = %err,
                "canvas serialization failed; not persisted"
            ),
        }
    }

    /// Flushes pending writes and snapshots the whole store.
    pub async fn export_all(&self) -> ExportBundle {
        self.store.export_all().await
    }

    /// Replaces the entire store with the bundle's contents, then rebuilds
    /// in-memory state from it. The bundle must carry a `data` object.
    pub async fn import_all(&self, raw: &Value) -> Result<(), ImportError> {
        self.store.import_all(raw).await?;
        self.reload().await;
        let spaces = self.state.read().await.spaces.len();
        info!(target: "tabula::spaces", spaces, "store imported");
        self.bus
            .publish(topics::TOPIC_STORAGE_IMPORTED, &json!({"spaces": spaces}));
        Ok(())
    }

    /// Wipes the store and starts over with the default space.
    pub async fn clear_all(&self) {
        self.store.clear().await;
        self.reload().await;
        let spaces = self.state.read().await.spaces.len();
        info!(target: "tabula::spaces", spaces, "store cleared");
        self.bus
            .publish(topics::TOPIC_STORAGE_CLEARED, &json!({"spaces": spaces}));
    }
}

/// Global settings, one un-namespaced `settings` key.
#[derive(Clone)]
pub struct SettingsStore {
    store: CachedStore,
    bus: Bus,
}

impl SettingsStore {
    pub fn new(store: CachedStore, bus: Bus) -> Self {
        Self { store, bus }
    }

    /// Stored settings; absent or unreadable state yields the defaults.
    pub async fn settings(&self) -> Settings {
        let raw = self.store.get(KEY_SETTINGS, Value::Null).await;
        serde_json::from_value(raw).unwrap_or_default()
    }

    pub async fn save(&self, settings: &Settings, immediate: bool) {
        match serde_json::to_value(settings) {
            Ok(value) => {
                self.store.set(KEY_SETTINGS, value.clone(), immediate).await;
                self.bus.publish(topics::TOPIC_SETTINGS_UPDATED, &value);
            }
            Err(err) => warn!(
                target: "tabula::spaces",
                error = %err,
                "settings serialization failed; not persisted"
            ),
        }
    }
}

/// Dashboard templates, one `templates` map keyed by template id.
#[derive(Clone)]
pub struct TemplateStore {
    store: CachedStore,
    bus: Bus,
}

impl TemplateStore {
    pub fn new(store: CachedStore, bus: Bus) -> Self {
        Self { store, bus }
    }

    /// All templates, sorted by name (id as tiebreak) for stable listings.
    pub async fn templates(&self) -> Vec<Template> {
        let mut templates: Vec<Template> = self
            .store
            .get_map(KEY_TEMPLATES)
            .await
            .values()
            .filter_map(|value| serde_json::from_value(value.clone()).ok())
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        templates
    }

    pub async fn template(&self, id: &str) -> Option<Template> {
        self.store
            .get_map(KEY_TEMPLATES)
            .await
            .get(id)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub async fn create(&self, name: &str, description: &str, data: Value) -> Template {
        self.save(Template::new(name, description, data)).await
    }

    /// Upserts with a fresh `updated_at` stamp; persists immediately.
    pub async fn save(&self, mut template: Template) -> Template {
        template.updated_at = Utc::now();
        let mut templates = self.store.get_map(KEY_TEMPLATES).await;
        match serde_json::to_value(&template) {
            Ok(value) => {
                templates.insert(template.id.clone(), value);
                self.store
                    .set(KEY_TEMPLATES, Value::Object(templates), true)
                    .await;
                self.bus.publish(
                    topics::TOPIC_TEMPLATE_SAVED,
                    &json!({"id": template.id, "name": template.name}),
                );
            }
            Err(err) => warn!(
                target: "tabula::spaces",
                template = %template.id,
                error = %err,
                "template serialization failed; not persisted"
            ),
        }
        template
    }

    /// Returns false when the id was not present.
    pub async fn delete(&self, id: &str) -> bool {
        let mut templates = self.store.get_map(KEY_TEMPLATES).await;
        if templates.remove(id).is_none() {
            return false;
        }
        self.store
            .set(KEY_TEMPLATES, Value::Object(templates), true)
            .await;
        self.bus
            .publish(topics::TOPIC_TEMPLATE_DELETED, &json!({"id": id}));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tabula_events::Envelope;
    use tabula_model::Theme;
    use tabula_store::{MemoryBackend, StorageBackend, DEFAULT_QUOTA_BYTES};
    use tokio::sync::broadcast;
    use tokio::time::{sleep, timeout};

    const QUIET: Duration = Duration::from_millis(25);

    async fn fresh() -> (SpaceManager, CachedStore, Arc<MemoryBackend>, Bus) {
        let backend = Arc::new(MemoryBackend::with_quota(DEFAULT_QUOTA_BYTES));
        let store = CachedStore::with_debounce(backend.clone(), QUIET);
        let bus = Bus::new(64);
        let manager = SpaceManager::load(store.clone(), bus.clone()).await;
        (manager, store, backend, bus)
    }

    async fn next_event(rx: &mut broadcast::Receiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within 1s")
            .expect("bus open")
    }

    async fn backend_keys(backend: &MemoryBackend) -> Vec<String> {
        backend
            .get(None)
            .await
            .expect("backend read")
            .keys()
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn first_run_bootstraps_home_space() {
        let (manager, _store, backend, _bus) = fresh().await;
        let spaces = manager.spaces().await;
        assert_eq!(spaces.len(), 1);
        assert_eq!(spaces[0].name, "Home");
        assert_eq!(spaces[0].icon, "home");
        assert_eq!(manager.active_space_id().await, spaces[0].id);

        // Bootstrap persisted immediately: a second manager over the same
        // backend sees the same space, not a second "Home".
        let other = SpaceManager::load(
            CachedStore::with_debounce(backend.clone(), QUIET),
            Bus::new(8),
        )
        .await;
        let other_spaces = other.spaces().await;
        assert_eq!(other_spaces.len(), 1);
        assert_eq!(other_spaces[0].id, spaces[0].id);
    }

    #[tokio::test]
    async fn create_update_and_switch_publish_events() {
        let (manager, _store, _backend, bus) = fresh().await;
        let mut rx = bus.subscribe();

        let work = manager.create_space("  Work  ").await;
        assert_eq!(work.name, "Work");
        assert_eq!(manager.spaces().await.len(), 2);
        let created = next_event(&mut rx).await;
        assert_eq!(created.kind, topics::TOPIC_SPACE_CREATED);
        assert_eq!(created.payload["id"], work.id.as_str());

        assert!(manager.update_space(&work.id, Some("   "), Some("book")).await);
        let updated = next_event(&mut rx).await;
        assert_eq!(updated.kind, topics::TOPIC_SPACE_UPDATED);
        assert_eq!(updated.payload["name"], "Untitled");
        assert_eq!(updated.payload["icon"], "book");
        assert!(!manager.update_space("missing", Some("x"), None).await);

        manager.switch_space(&work.id).await;
        assert_eq!(manager.active_space_id().await, work.id);
        let switched = next_event(&mut rx).await;
        assert_eq!(switched.kind, topics::TOPIC_SPACE_SWITCHED);
        assert_eq!(switched.payload["to"], work.id.as_str());

        // Switching to the current space or an unknown one stays silent.
        manager.switch_space(&work.id).await;
        manager.switch_space("missing").await;
        assert!(
            timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
            "no-op switches publish nothing"
        );
    }

    #[tokio::test]
    async fn last_space_cannot_be_deleted_with_any_id() {
        let (manager, _store, _backend, _bus) = fresh().await;
        let home = manager.active_space_id().await;
        assert_eq!(manager.delete_space(&home).await, Err(SpaceError::LastSpace));
        assert_eq!(
            manager.delete_space("missing").await,
            Err(SpaceError::LastSpace),
            "guard applies before membership is considered"
        );
        assert_eq!(manager.spaces().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_unknown_space_is_a_noop() {
        let (manager, _store, _backend, _bus) = fresh().await;
        manager.create_space("Work").await;
        assert_eq!(manager.delete_space("missing").await, Ok(()));
        assert_eq!(manager.spaces().await.len(), 2);
    }

    #[tokio::test]
    async fn deleting_active_space_switches_and_reclaims_storage() {
        let (manager, _store, backend, bus) = fresh().await;
        let home = manager.active_space_id().await;
        let work = manager.create_space("Work").await;
        manager.switch_space(&work.id).await;
        manager
            .save_widget_order_for_space(&work.id, &["todo-1".to_string()])
            .await;
        assert!(backend_keys(&backend).await.contains(&widget_order_key(&work.id)));

        let mut rx = bus.subscribe();
        manager.delete_space(&work.id).await.expect("two spaces, deletable");
        assert_eq!(manager.active_space_id().await, home);

        let switched = next_event(&mut rx).await;
        assert_eq!(switched.kind, topics::TOPIC_SPACE_SWITCHED);
        assert_eq!(switched.payload["from"], work.id.as_str());
        let deleted = next_event(&mut rx).await;
        assert_eq!(deleted.kind, topics::TOPIC_SPACE_DELETED);

        // GC runs off the critical path.
        sleep(Duration::from_millis(100)).await;
        let keys = backend_keys(&backend).await;
        assert!(!keys.contains(&widget_order_key(&work.id)));
        assert!(!keys.contains(&widgets_key(&work.id)));
    }

    #[tokio::test]
    async fn dangling_active_pointer_falls_back_to_first_space() {
        let backend = Arc::new(MemoryBackend::with_quota(DEFAULT_QUOTA_BYTES));
        let store = CachedStore::with_debounce(backend.clone(), QUIET);
        let manager = SpaceManager::load(store.clone(), Bus::new(8)).await;
        let home = manager.active_space_id().await;

        // Corrupt the pointer behind the manager's back, then reload.
        store
            .set(KEY_ACTIVE_SPACE, Value::String("space-gone".into()), true)
            .await;
        manager.reload().await;
        assert_eq!(manager.active_space_id().await, home);
    }

    #[tokio::test]
    async fn legacy_widget_data_migrates_into_first_space_once() {
        let backend = Arc::new(MemoryBackend::with_quota(DEFAULT_QUOTA_BYTES));
        let seed = CachedStore::with_debounce(backend.clone(), QUIET);
        let space = json!({
            "id": "space-1",
            "name": "Main",
            "icon": "grid",
            "createdAt": "2024-05-20T12:00:00Z"
        });
        seed.set(KEY_SPACES, json!([space]), true).await;
        seed.set(KEY_ACTIVE_SPACE, json!("space-1"), true).await;
        seed.set(
            &widgets_key("space-1"),
            json!({"todo-1": {"id": "todo-1", "type": "todo", "size": "large"}}),
            true,
        )
        .await;
        seed.set(
            LEGACY_KEY_WIDGETS,
            json!({
                "todo-1": {"id": "todo-1", "type": "todo", "size": "small"},
                "notes-1": {"id": "notes-1", "type": "notes"}
            }),
            true,
        )
        .await;
        seed.set(LEGACY_KEY_WIDGET_ORDER, json!(["notes-1", "todo-1"]), true)
            .await;

        let manager = SpaceManager::load(
            CachedStore::with_debounce(backend.clone(), QUIET),
            Bus::new(8),
        )
        .await;

        let records = manager.widgets_for_space("space-1").await;
        assert_eq!(records.len(), 2);
        // Per-space data wins the id collision.
        assert_eq!(records["todo-1"]["size"], "large");
        assert_eq!(records["notes-1"]["type"], "notes");
        let order = manager.widget_order_for_space("space-1").await;
        assert_eq!(order, vec!["notes-1".to_string(), "todo-1".to_string()]);

        let keys = backend_keys(&backend).await;
        assert!(!keys.contains(&LEGACY_KEY_WIDGETS.to_string()));
        assert!(!keys.contains(&LEGACY_KEY_WIDGET_ORDER.to_string()));
    }

    #[tokio::test]
    async fn widget_save_merges_shallowly_and_stamps_last_updated() {
        let (manager, _store, _backend, _bus) = fresh().await;
        let space = manager.active_space_id().await;

        let mut first = Map::new();
        first.insert("type".to_string(), json!("todo"));
        first.insert("payload".to_string(), json!({"items": ["milk"]}));
        manager.save_widget_in_space(&space, "todo-1", &first).await;

        let mut second = Map::new();
        second.insert("size".to_string(), json!("large"));
        manager.save_widget_in_space(&space, "todo-1", &second).await;

        let records = manager.widgets_for_space(&space).await;
        let record = records["todo-1"].as_object().expect("record object");
        assert_eq!(record["id"], "todo-1");
        assert_eq!(record["size"], "large");
        assert_eq!(record["payload"]["items"][0], "milk", "untouched keys survive");
        assert!(record["lastUpdated"].as_str().is_some());
    }

    #[tokio::test]
    async fn widget_order_round_trips_immediately() {
        let (manager, _store, backend, _bus) = fresh().await;
        let space = manager.active_space_id().await;
        let order = vec!["a-1".to_string(), "b-1".to_string()];
        manager.save_widget_order_for_space(&space, &order).await;

        assert_eq!(manager.widget_order_for_space(&space).await, order);
        // Immediate path: already in the backend, no quiet period needed.
        let persisted = backend
            .get(Some(&[widget_order_key(&space).as_str()]))
            .await
            .expect("backend read");
        assert_eq!(persisted[&widget_order_key(&space)], json!(["a-1", "b-1"]));
    }

    #[tokio::test]
    async fn canvas_round_trips_through_debounce() {
        let (manager, store, backend, _bus) = fresh().await;
        let space = manager.active_space_id().await;
        let mut state = CanvasState::default();
        state.tiles.insert(
            "tile-1".to_string(),
            tabula_model::CanvasTile {
                x: 1.0,
                y: 2.0,
                w: 3.0,
                h: 4.0,
                color: None,
            },
        );
        manager.save_canvas_for_space(&space, &state).await;
        assert_eq!(manager.canvas_for_space(&space).await, state);

        store.flush_all().await;
        let other = SpaceManager::load(
            CachedStore::with_debounce(backend.clone(), QUIET),
            Bus::new(8),
        )
        .await;
        assert_eq!(other.canvas_for_space(&space).await, state);
    }

    #[tokio::test]
    async fn import_reloads_state_and_clear_starts_over() {
        let (manager, _store, _backend, bus) = fresh().await;
        manager.create_space("Work").await;
        let bundle = manager.export_all().await;
        assert_eq!(manager.spaces().await.len(), 2);

        let mut rx = bus.subscribe();
        manager.clear_all().await;
        let spaces = manager.spaces().await;
        assert_eq!(spaces.len(), 1, "clear re-bootstraps the default space");
        assert_eq!(spaces[0].name, "Home");
        let cleared = next_event(&mut rx).await;
        assert_eq!(cleared.kind, topics::TOPIC_STORAGE_CLEARED);

        let raw = serde_json::to_value(&bundle).expect("bundle serializes");
        manager.import_all(&raw).await.expect("bundle round-trips");
        assert_eq!(manager.spaces().await.len(), 2);
        let imported = next_event(&mut rx).await;
        assert_eq!(imported.kind, topics::TOPIC_STORAGE_IMPORTED);
        assert_eq!(imported.payload["spaces"], 2);

        assert!(matches!(
            manager.import_all(&json!({"version": 1})).await,
            Err(ImportError::MissingData)
        ));
    }

    #[tokio::test]
    async fn settings_store_defaults_saves_and_publishes() {
        let (_manager, store, backend, bus) = fresh().await;
        let settings_store = SettingsStore::new(store, bus.clone());
        assert_eq!(settings_store.settings().await, Settings::default());

        let mut rx = bus.subscribe();
        let mut settings = Settings::default();
        settings.theme = Theme::Dark;
        settings.first_run = false;
        settings_store.save(&settings, true).await;

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, topics::TOPIC_SETTINGS_UPDATED);
        assert_eq!(event.payload["theme"], "dark");

        let other = SettingsStore::new(
            CachedStore::with_debounce(backend.clone(), QUIET),
            Bus::new(8),
        );
        assert_eq!(other.settings().await, settings);
    }

    #[tokio::test]
    async fn template_store_crud_and_sorting() {
        let (_manager, store, _backend, bus) = fresh().await;
        let templates = TemplateStore::new(store, bus.clone());
        let mut rx = bus.subscribe();

        let beta = templates
            .create("Beta", "second", json!({"widgets": {}}))
            .await;
        let alpha = templates.create("Alpha", "first", json!({"widgets": {}})).await;
        assert_eq!(next_event(&mut rx).await.kind, topics::TOPIC_TEMPLATE_SAVED);
        assert_eq!(next_event(&mut rx).await.kind, topics::TOPIC_TEMPLATE_SAVED);

        let listed = templates.templates().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "Alpha");
        assert_eq!(listed[1].name, "Beta");

        let fetched = templates.template(&alpha.id).await.expect("alpha exists");
        assert_eq!(fetched.description, "first");

        let resaved = templates.save(fetched).await;
        assert!(resaved.updated_at >= resaved.created_at);

        assert!(templates.delete(&beta.id).await);
        assert!(!templates.delete(&beta.id).await, "second delete reports absence");
        let deleted_events: Vec<Envelope> = vec![
            next_event(&mut rx).await,
            next_event(&mut rx).await,
        ];
        assert_eq!(deleted_events[1].kind, topics::TOPIC_TEMPLATE_DELETED);
        assert_eq!(templates.templates().await.len(), 1);
    }
}
