//! Built-in defaults (layer 1)

use serde_json::Value;

use super::settings::LaneSettings;

/// Image name of the test execution container
pub const CONTAINER_IMAGE: &str = "anaconda-webui";

/// Path of the installer web UI on the VM
pub const WEBUI_LOCATION: &str = "/cockpit/@localhost/anaconda-webui/index.html";

pub const ANACONDA_REPO: &str = "https://github.com/rhinstaller/anaconda.git";
pub const COCKPIT_REPO: &str = "https://github.com/cockpit-project/cockpit.git";
pub const BOTS_REPO: &str = "https://github.com/cockpit-project/bots.git";
pub const KSTEST_REPO: &str = "https://github.com/rhinstaller/kickstart-tests.git";

/// Batch runner invocation, test names are appended
pub const KSTEST_RUNNER: &str = "containers/runner/launch --retry";

/// Default settings file relative to `$HOME`
pub const SETTINGS_RELATIVE_PATH: &str = ".config/vmlane/settings.toml";

/// Built-in defaults as a merge layer
pub fn builtin_layer() -> Value {
    serde_json::to_value(LaneSettings::default()).unwrap_or(Value::Null)
}
