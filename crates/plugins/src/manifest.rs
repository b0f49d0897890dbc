use std::path::Path;

use {serde::Deserialize, serde_json::Value};

use crate::error::PluginError;

/// File extensions recognised as plugin manifests.
pub const MANIFEST_EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json"];

/// A plugin file: which catalog factory to run, and what to pass it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginManifest {
    pub handler: Option<String>,
    pub params: Value,
}

impl PluginManifest {
    /// Parse manifest text in the format implied by `path`'s extension.
    pub fn parse(raw: &str, path: &Path) -> Result<Self, PluginError> {
        let parse_err = |message: String| PluginError::Parse {
            path: path.to_path_buf(),
            message,
        };
        match extension(path) {
            Some("toml") => toml::from_str(raw).map_err(|e| parse_err(e.to_string())),
            // An empty YAML document is `null`, which has no handler.
            Some("yaml" | "yml") if raw.trim().is_empty() => Ok(Self::default()),
            Some("yaml" | "yml") => {
                let manifest: Option<Self> =
                    serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
                Ok(manifest.unwrap_or_default())
            },
            Some("json") => serde_json::from_str(raw).map_err(|e| parse_err(e.to_string())),
            other => Err(parse_err(format!(
                "unsupported manifest format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// The catalog name, if the manifest declares a non-blank one.
    pub fn handler_name(&self) -> Option<&str> {
        self.handler
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// Whether `path` has a manifest extension.
pub fn is_manifest(path: &Path) -> bool {
    extension(path).is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext))
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}
