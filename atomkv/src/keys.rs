//! Well-known key prefixes of the application's stored state

use crate::backend::Key;
use crate::error::StoreError;
use crate::namespace::{BoundNamespace, Namespace};

/// Widget list of a folder, keyed by folder identifier
pub const FOLDER_WIDGETS: &str = "FolderWidgets";
/// Per-widget-instance storage, keyed by instance identifier
pub const WIDGET_STORAGE: &str = "WidgetStorage";
/// Per-plugin storage, keyed by plugin identifier
pub const PLUGIN_STORAGE: &str = "PluginStorage";
/// Per-plugin configuration, keyed by plugin identifier
pub const PLUGIN_CONFIG: &str = "PluginConfig";

/// Name of the active theme (global)
pub const ACTIVE_THEME: &str = "ActiveTheme";
/// User-defined themes (global)
pub const CUSTOM_THEMES: &str = "CustomThemes";
/// Feature toggles (global)
pub const FEATURE_TOGGLES: &str = "FeatureToggles";

/// Key of a folder's widget list
///
/// # Errors
///
/// `NamespaceMissingIdentifier` while the folder id is unknown.
pub fn folder_widgets(folder_id: Option<&str>) -> Result<Key, StoreError> {
    Ok(Namespace::new(FOLDER_WIDGETS).bind(folder_id)?.key())
}

/// Namespace of one widget instance's fields
///
/// # Errors
///
/// `NamespaceMissingIdentifier` while the instance id is unknown.
pub fn widget_storage(instance_id: Option<&str>) -> Result<BoundNamespace, StoreError> {
    Namespace::new(WIDGET_STORAGE).bind(instance_id)
}

/// Namespace of one plugin's fields
///
/// # Errors
///
/// `NamespaceMissingIdentifier` while the plugin id is unknown.
pub fn plugin_storage(plugin_id: Option<&str>) -> Result<BoundNamespace, StoreError> {
    Namespace::new(PLUGIN_STORAGE).bind(plugin_id)
}

/// Key of one plugin's configuration document
///
/// # Errors
///
/// `NamespaceMissingIdentifier` while the plugin id is unknown.
pub fn plugin_config(plugin_id: Option<&str>) -> Result<Key, StoreError> {
    Ok(Namespace::new(PLUGIN_CONFIG).bind(plugin_id)?.key())
}
