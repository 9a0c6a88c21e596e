//! Mock widget type for engine tests and smoke runs.
//!
//! [`MockWidget`] behaves like a real widget as far as the host can tell:
//! it persists a payload through its injected storage on `init` and reports
//! every lifecycle call through shared counters, so tests can observe what
//! the host did without reaching into host internals.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map};

use tabula_widgets::{Widget, WidgetContext, WidgetError, WidgetFactory, WidgetTypeConfig};

/// Lifecycle call counts shared by every widget a factory creates.
#[derive(Default)]
pub struct MockCounters {
    pub inits: AtomicUsize,
    pub destroys: AtomicUsize,
    pub settings_opens: AtomicUsize,
}

pub struct MockWidgetFactory {
    kind: &'static str,
    default_size: Option<String>,
    fail_init: AtomicBool,
    counters: Arc<MockCounters>,
}

impl MockWidgetFactory {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            default_size: None,
            fail_init: AtomicBool::new(false),
            counters: Arc::new(MockCounters::default()),
        }
    }

    pub fn with_default_size(mut self, size: impl Into<String>) -> Self {
        self.default_size = Some(size.into());
        self
    }

    /// Widgets created while this is set fail their `init`. The flag is
    /// sampled at creation time, so flipping it back lets the next load
    /// succeed.
    pub fn fail_inits(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        self.counters.clone()
    }
}

impl WidgetFactory for MockWidgetFactory {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn config(&self) -> WidgetTypeConfig {
        let config = WidgetTypeConfig::new(format!("Mock {}", self.kind));
        match &self.default_size {
            Some(size) => config.with_default_size(size.clone()),
            None => config,
        }
    }

    fn create(&self, ctx: WidgetContext) -> Box<dyn Widget> {
        Box::new(MockWidget {
            ctx,
            fail_init: self.fail_init.load(Ordering::SeqCst),
            counters: self.counters.clone(),
        })
    }
}

pub struct MockWidget {
    ctx: WidgetContext,
    fail_init: bool,
    counters: Arc<MockCounters>,
}

#[async_trait]
impl Widget for MockWidget {
    async fn init(&mut self) -> Result<(), WidgetError> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(WidgetError::Init("mock widget configured to fail".into()));
        }
        let mut marker = Map::new();
        marker.insert("payload".to_string(), json!({"initialized": true}));
        self.ctx.storage.save_widget(&self.ctx.id, &marker).await;
        Ok(())
    }

    async fn destroy(&mut self) {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
    }

    fn open_settings(&mut self) {
        self.counters.settings_opens.fetch_add(1, Ordering::SeqCst);
    }
}
