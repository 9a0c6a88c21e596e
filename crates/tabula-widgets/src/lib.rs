//! Widget type registry and instance lifecycle host.
//!
//! [`WidgetHost`] owns two things: a typed map of [`WidgetFactory`]
//! implementations keyed by kind, and the live instances mounted for the
//! active space. Load order is deterministic: the persisted order first,
//! then enabled-but-unordered records in id order. A record whose kind has
//! no registered factory stays in storage and is skipped at load, so old
//! data keeps working when widget types come and go.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use tabula_events::Bus;
use tabula_model::{enabled_widget_ids, reconcile_order, WidgetId, WidgetRecord};
use tabula_spaces::SpaceManager;
use tabula_store::CachedStore;
use tabula_topics as topics;

#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    #[error("widget init failed: {0}")]
    Init(String),
}

/// A live widget instance. Implementations hold their own view state; the
/// host only drives the lifecycle below.
#[async_trait]
pub trait Widget: Send + Sync {
    /// Brings the instance up. On failure the host drops the instance and
    /// keeps the stored record, so the next load can retry.
    async fn init(&mut self) -> Result<(), WidgetError>;

    /// Called on removal and before a full reload.
    async fn destroy(&mut self) {}

    /// Hook for a settings affordance.
    fn open_settings(&mut self) {}
}

/// Static metadata a factory declares for its kind.
#[derive(Clone, Debug)]
pub struct WidgetTypeConfig {
    pub display_name: String,
    pub default_size: String,
}

impl WidgetTypeConfig {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            default_size: tabula_model::DEFAULT_WIDGET_SIZE.to_string(),
        }
    }

    pub fn with_default_size(mut self, size: impl Into<String>) -> Self {
        self.default_size = size.into();
        self
    }
}

/// One registered widget type.
pub trait WidgetFactory: Send + Sync {
    /// Stable key matched against the `type` field of stored records.
    fn kind(&self) -> &'static str;

    fn config(&self) -> WidgetTypeConfig;

    fn create(&self, ctx: WidgetContext) -> Box<dyn Widget>;
}

/// Storage handed to widget instances: record access is pinned to the
/// owning space, while `get`/`set`/`remove` pass through to the global
/// cache for data that was never namespaced (preferences, templates).
#[derive(Clone)]
pub struct WidgetStorage {
    spaces: SpaceManager,
    store: CachedStore,
    space: String,
}

impl WidgetStorage {
    pub fn new(spaces: SpaceManager, store: CachedStore, space: impl Into<String>) -> Self {
        Self {
            spaces,
            store,
            space: space.into(),
        }
    }

    /// The space this adapter writes into, fixed at creation. A widget that
    /// keeps saving after a space switch still lands in its own space.
    pub fn space(&self) -> &str {
        &self.space
    }

    /// Shallow-merges `partial` into the widget's record (debounced).
    pub async fn save_widget(&self, widget_id: &str, partial: &serde_json::Map<String, Value>) {
        self.spaces
            .save_widget_in_space(&self.space, widget_id, partial)
            .await;
    }

    pub async fn get_widget(&self, widget_id: &str) -> Option<Value> {
        self.spaces
            .widgets_for_space(&self.space)
            .await
            .get(widget_id)
            .cloned()
    }

    pub async fn get(&self, key: &str, default: Value) -> Value {
        self.store.get(key, default).await
    }

    pub async fn set(&self, key: &str, value: Value, immediate: bool) {
        self.store.set(key, value, immediate).await
    }

    pub async fn remove(&self, key: &str) {
        self.store.remove(key).await
    }
}

/// Construction context injected into [`WidgetFactory::create`].
pub struct WidgetContext {
    pub id: WidgetId,
    pub storage: WidgetStorage,
    pub bus: Bus,
    /// The widget's stored record at creation time.
    pub saved: Value,
}

/// Lifecycle of one instance. A kind without a registered factory never
/// enters this machine; registration is where it starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetPhase {
    Registered,
    Instantiated,
    Mounted,
    Destroyed,
}

impl WidgetPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetPhase::Registered => "registered",
            WidgetPhase::Instantiated => "instantiated",
            WidgetPhase::Mounted => "mounted",
            WidgetPhase::Destroyed => "destroyed",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WidgetInfo {
    pub id: WidgetId,
    pub kind: String,
    pub phase: WidgetPhase,
}

struct MountedWidget {
    kind: String,
    phase: WidgetPhase,
    instance: Box<dyn Widget>,
}

struct HostState {
    instances: HashMap<WidgetId, MountedWidget>,
    /// Widget order for the active space, including enabled records whose
    /// kind is currently unregistered (they keep their slot in storage).
    order: Vec<WidgetId>,
}

/// Cheap-clone handle onto the registry and the mounted instance set.
///
/// All lifecycle operations serialize on one internal lock and mutate the
/// in-memory order first, then persist that snapshot — storage is never
/// re-read in the middle of a mutation.
#[derive(Clone)]
pub struct WidgetHost {
    spaces: SpaceManager,
    store: CachedStore,
    bus: Bus,
    factories: Arc<RwLock<HashMap<String, Arc<dyn WidgetFactory>>>>,
    state: Arc<Mutex<HostState>>,
}

impl WidgetHost {
    pub fn new(spaces: SpaceManager, store: CachedStore, bus: Bus) -> Self {
        Self {
            spaces,
            store,
            bus,
            factories: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(Mutex::new(HostState {
                instances: HashMap::new(),
                order: Vec::new(),
            })),
        }
    }

    /// Registers a factory for its kind. Re-registration replaces.
    pub async fn register_widget(&self, factory: Arc<dyn WidgetFactory>) {
        let kind = factory.kind().to_string();
        let replaced = self
            .factories
            .write()
            .await
            .insert(kind.clone(), factory)
            .is_some();
        debug!(
            target: "tabula::widgets",
            kind = %kind,
            replaced,
            "widget factory registered"
        );
    }

    pub async fn registered_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.read().await.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    async fn factory(&self, kind: &str) -> Option<Arc<dyn WidgetFactory>> {
        self.factories.read().await.get(kind).cloned()
    }

    /// Destroys the current instance set and rebuilds it from the active
    /// space's records and order. Returns the mounted ids in mount order.
    ///
    /// The instantiation order is the stored order filtered to enabled
    /// records, then any enabled-but-unordered remainder in id order; when
    /// that differs from what storage held, the reconciled order is written
    /// back so the next load starts clean.
    pub async fn load_widgets(&self) -> Vec<WidgetId> {
        let mut state = self.state.lock().await;

        let previous: Vec<WidgetId> = state.order.iter().rev().cloned().collect();
        for id in previous {
            if let Some(mut mounted) = state.instances.remove(&id) {
                mounted.phase = WidgetPhase::Destroyed;
                mounted.instance.destroy().await;
            }
        }
        state.order.clear();

        let space = self.spaces.active_space_id().await;
        let records = self.spaces.widgets_for_space(&space).await;
        let stored_order = self.spaces.widget_order_for_space(&space).await;
        let enabled = enabled_widget_ids(&records);
        let order = reconcile_order(&stored_order, &enabled);
        if order != stored_order {
            debug!(
                target: "tabula::widgets",
                space = %space,
                "stored widget order was stale; persisting the reconciled one"
            );
            self.spaces.save_widget_order_for_space(&space, &order).await;
        }

        let mut mounted_ids: Vec<WidgetId> = Vec::new();
        for id in &order {
            let Some(record) = records.get(id) else {
                continue;
            };
            let kind = record
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let Some(factory) = self.factory(&kind).await else {
                debug!(
                    target: "tabula::widgets",
                    widget = %id,
                    kind = %kind,
                    "no factory for stored record; skipping"
                );
                continue;
            };
            if let Some(mounted) = self.instantiate(&factory, id, record.clone(), &space).await {
                state.instances.insert(id.clone(), mounted);
                mounted_ids.push(id.clone());
            }
        }
        state.order = order;

        info!(
            target: "tabula::widgets",
            space = %space,
            mounted = mounted_ids.len(),
            "widgets loaded"
        );
        self.bus.publish(
            topics::TOPIC_WIDGETS_RELOADED,
            &json!({"space": space, "mounted": mounted_ids.len()}),
        );
        mounted_ids
    }

    /// Adds a widget of `kind` to the active space and mounts it. Returns
    /// the new widget id, or `None` when the kind is not registered.
    ///
    /// The record and the updated order are persisted before the instance
    /// exists: a crash mid-instantiation leaves a record the next load
    /// picks up, never a mounted widget without state.
    pub async fn add_widget(&self, kind: &str) -> Option<WidgetId> {
        let Some(factory) = self.factory(kind).await else {
            warn!(
                target: "tabula::widgets",
                kind = %kind,
                "cannot add widget: kind not registered"
            );
            return None;
        };
        let mut state = self.state.lock().await;
        let space = self.spaces.active_space_id().await;

        let record = WidgetRecord::new(kind, factory.config().default_size);
        let id = record.id.clone();
        let partial = record
            .to_value()
            .as_object()
            .cloned()
            .unwrap_or_default();
        self.spaces.save_widget_in_space(&space, &id, &partial).await;
        state.order.push(id.clone());
        let order_snapshot = state.order.clone();
        self.spaces
            .save_widget_order_for_space(&space, &order_snapshot)
            .await;

        if let Some(mounted) = self.instantiate(&factory, &id, record.to_value(), &space).await {
            state.instances.insert(id.clone(), mounted);
        }

        info!(target: "tabula::widgets", widget = %id, kind = %kind, "widget added");
        self.bus.publish(
            topics::TOPIC_WIDGET_ADDED,
            &json!({"id": id, "type": kind, "space": space}),
        );
        Some(id)
    }

    /// Destroys the instance (if mounted), then scrubs the record, then the
    /// order — so an interruption part-way leaves at worst a record the
    /// next load reconciles, never an orphaned order entry with no record
    /// behind it resurrecting as a ghost.
    pub async fn remove_widget(&self, id: &str) {
        let mut state = self.state.lock().await;
        let space = self.spaces.active_space_id().await;

        if let Some(mut mounted) = state.instances.remove(id) {
            mounted.phase = WidgetPhase::Destroyed;
            mounted.instance.destroy().await;
        }
        self.spaces.remove_widget_from_space(&space, id).await;
        state.order.retain(|existing| existing != id);
        let order_snapshot = state.order.clone();
        self.spaces
            .save_widget_order_for_space(&space, &order_snapshot)
            .await;

        info!(target: "tabula::widgets", widget = %id, "widget removed");
        self.bus.publish(
            topics::TOPIC_WIDGET_REMOVED,
            &json!({"id": id, "space": space}),
        );
    }

    /// Wholesale order replacement from a drag/keyboard reorder. The caller
    /// supplies the full permutation; stale ids are only reconciled away at
    /// the next load.
    pub async fn update_widget_order(&self, new_order: Vec<WidgetId>) {
        let mut state = self.state.lock().await;
        let space = self.spaces.active_space_id().await;
        state.order = new_order;
        let order_snapshot = state.order.clone();
        self.spaces
            .save_widget_order_for_space(&space, &order_snapshot)
            .await;
        debug!(target: "tabula::widgets", space = %space, "widget order updated");
        self.bus.publish(
            topics::TOPIC_WIDGET_ORDER_CHANGED,
            &json!({"space": space, "order": order_snapshot}),
        );
    }

    /// Forwards to the mounted instance's settings hook. False when the id
    /// is not mounted.
    pub async fn open_settings(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.instances.get_mut(id) {
            Some(mounted) => {
                mounted.instance.open_settings();
                true
            }
            None => false,
        }
    }

    /// Mounted widgets in mount order.
    pub async fn snapshot(&self) -> Vec<WidgetInfo> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| {
                state.instances.get(id).map(|mounted| WidgetInfo {
                    id: id.clone(),
                    kind: mounted.kind.clone(),
                    phase: mounted.phase,
                })
            })
            .collect()
    }

    async fn instantiate(
        &self,
        factory: &Arc<dyn WidgetFactory>,
        id: &str,
        saved: Value,
        space: &str,
    ) -> Option<MountedWidget> {
        let ctx = WidgetContext {
            id: id.to_string(),
            storage: WidgetStorage::new(self.spaces.clone(), self.store.clone(), space),
            bus: self.bus.clone(),
            saved,
        };
        let mut mounted = MountedWidget {
            kind: factory.kind().to_string(),
            phase: WidgetPhase::Instantiated,
            instance: factory.create(ctx),
        };
        if let Err(err) = mounted.instance.init().await {
            warn!(
                target: "tabula::widgets",
                widget = %id,
                error = %err,
                "widget init failed; record kept for the next load"
            );
            return None;
        }
        mounted.phase = WidgetPhase::Mounted;
        Some(mounted)
    }

    /// Spawns a listener that reloads the widget set whenever the active
    /// space changes. The handle can be aborted on shutdown.
    pub fn run_space_switch_listener(&self) -> tokio::task::JoinHandle<()> {
        let host = self.clone();
        let mut rx = host.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(env) => {
                        if env.kind == topics::TOPIC_SPACE_SWITCHED {
                            host.load_widgets().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // A switch may be among the dropped events; resync.
                        warn!(
                            target: "tabula::widgets",
                            skipped,
                            "space listener lagged; reloading"
                        );
                        host.load_widgets().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
