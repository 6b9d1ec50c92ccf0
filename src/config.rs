//! Bridge configuration.
//!
//! Parsing a configuration *file* is the host's concern; the bridge only
//! takes the already-resolved values it needs to boot the script engine.
//! The struct derives `Deserialize` so hosts can feed it straight from
//! whatever format they parse (JSON, TOML, ...).

use std::path::PathBuf;

use serde::Deserialize;

/// Configuration for [`Bridge::init`](crate::Bridge::init).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the Lua script implementing the policy logic. Required.
    pub script: PathBuf,
    /// Optional folder added to the Lua `package.path`, so the script can
    /// `require()` companion modules.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Opaque configuration string handed to the script's `init()` function.
    /// The bridge does not interpret it.
    #[serde(default)]
    pub config: Option<String>,
}

impl Config {
    /// Configuration pointing at a script, with no extra module path and no
    /// script-level config.
    pub fn for_script(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            path: None,
            config: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_optional_fields_missing() {
        let config: Config = serde_json::from_str(r#"{"script": "/tmp/relay.lua"}"#)
            .expect("minimal config should parse");
        assert_eq!(config.script, PathBuf::from("/tmp/relay.lua"));
        assert!(config.path.is_none());
        assert!(config.config.is_none());
    }

    #[test]
    fn rejects_missing_script() {
        let result: Result<Config, _> = serde_json::from_str(r#"{"path": "/tmp"}"#);
        assert!(result.is_err());
    }
}
