//! Smoke run: wires the whole engine over a file-backed store, mounts a
//! couple of mock widgets and prints the resulting state. State persists
//! across runs under `TABULA_STATE_DIR` (default `./tabula-state`).

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tabula_events::Bus;
use tabula_mock_widget::MockWidgetFactory;
use tabula_spaces::{SettingsStore, SpaceManager};
use tabula_store::{CachedStore, FileBackend};
use tabula_widgets::WidgetHost;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let dir = std::env::var("TABULA_STATE_DIR").unwrap_or_else(|_| "./tabula-state".to_string());
    let backend = Arc::new(FileBackend::open(&dir).await?);
    let store = CachedStore::new(backend);
    let bus = Bus::new_default();

    let spaces = SpaceManager::load(store.clone(), bus.clone()).await;
    let host = WidgetHost::new(spaces.clone(), store.clone(), bus.clone());
    host.register_widget(Arc::new(MockWidgetFactory::new("todo")))
        .await;
    host.register_widget(Arc::new(
        MockWidgetFactory::new("notes").with_default_size("large"),
    ))
    .await;
    let listener = host.run_space_switch_listener();

    host.load_widgets().await;
    if host.snapshot().await.is_empty() {
        for kind in ["todo", "notes"] {
            if let Some(id) = host.add_widget(kind).await {
                info!(widget = %id, "seeded widget");
            }
        }
    }

    let settings = SettingsStore::new(store.clone(), bus.clone())
        .settings()
        .await;
    let active = spaces.active_space_id().await;
    let usage = store.usage().await;
    info!(
        spaces = spaces.spaces().await.len(),
        active = %active,
        theme = settings.theme.as_str(),
        used_bytes = usage.used_bytes,
        "engine up"
    );

    let snapshot = host.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    store.flush_all().await;
    listener.abort();
    Ok(())
}
