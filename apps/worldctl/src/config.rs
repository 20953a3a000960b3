use std::{collections::HashMap, env, fs};

#[derive(Debug)]
pub struct Settings {
    pub endpoint: String,
    pub timestep_ms: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9120/connection/websocket".into(),
            timestep_ms: sync_core::DEFAULT_DT_MS,
        }
    }
}

/// Defaults, overridden by `worldctl.toml`, overridden by environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("worldctl.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            if let Some(v) = file_cfg.get("endpoint").and_then(|v| v.as_str()) {
                settings.endpoint = v.to_string();
            }
            if let Some(v) = file_cfg.get("timestep_ms").and_then(|v| v.as_integer()) {
                settings.timestep_ms = v;
            }
        }
    }

    if let Ok(v) = env::var("WORLDCTL_ENDPOINT") {
        settings.endpoint = v;
    }
    if let Ok(v) = env::var("WORLDCTL_TIMESTEP_MS") {
        if let Ok(v) = v.parse() {
            settings.timestep_ms = v;
        }
    }

    settings
}
