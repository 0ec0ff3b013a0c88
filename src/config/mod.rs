//! Layered configuration
//!
//! Settings are merged from three layers, later layers winning:
//! 1. Built-in defaults
//! 2. Settings file (~/.config/vmlane/settings.toml or `--settings`)
//! 3. CLI overrides (`--set section.key=value`)

mod defaults;
mod merge;
mod settings;

pub use defaults::{builtin_layer, CONTAINER_IMAGE, WEBUI_LOCATION};
pub use merge::{deep_merge, merge_layers, overrides_layer};
pub use settings::{
    default_settings_path, ConfigError, ConfigOrigin, ConfigSource, KickstartSettings,
    LaneSettings, LoadedSettings, VmSettings, WebUiSettings, CMDLINE_ALL,
};
