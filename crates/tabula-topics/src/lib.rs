//! Canonical event topic constants shared across the engine.
//!
//! This crate centralizes the string constants used when publishing events
//! so that the state managers and any embedding UI stay in sync. Keep this
//! list alphabetized within sections and favor dot.case names.

// Spaces
pub const TOPIC_SPACE_CREATED: &str = "space.created";
pub const TOPIC_SPACE_DELETED: &str = "space.deleted";
pub const TOPIC_SPACE_SWITCHED: &str = "space.switched";
pub const TOPIC_SPACE_UPDATED: &str = "space.updated";

// Widgets
pub const TOPIC_WIDGET_ADDED: &str = "widget.added";
pub const TOPIC_WIDGET_ORDER_CHANGED: &str = "widget.order.changed";
pub const TOPIC_WIDGET_REMOVED: &str = "widget.removed";
pub const TOPIC_WIDGETS_RELOADED: &str = "widgets.reloaded";

// Settings & templates
pub const TOPIC_SETTINGS_UPDATED: &str = "settings.updated";
pub const TOPIC_TEMPLATE_DELETED: &str = "template.deleted";
pub const TOPIC_TEMPLATE_SAVED: &str = "template.saved";

// Storage maintenance
pub const TOPIC_STORAGE_CLEARED: &str = "storage.cleared";
pub const TOPIC_STORAGE_IMPORTED: &str = "storage.imported";
