// Process configuration: a TOML file on disk plus environment
// overrides, turning "where is SYSTEM_RESERVED" and "is this a NEO
// title" into a concrete value before the runtime starts.
//
// Austin Shafer - 2024
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_system_reserved() -> u64 {
    loader::linker::SYSTEM_RESERVED
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base address the loader's address plan reserves the guest
    /// address space from. Overridable for debugging ASLR-adjacent
    /// issues against a known layout.
    #[serde(default = "default_system_reserved")]
    pub system_reserved: u64,

    /// Whether to emulate the wider PS4 Pro ("neo") tiling/register
    /// layout in the GPU crate's tiler.
    pub neo_mode: bool,

    /// Enables Vulkan validation layers in the render engine. Off by
    /// default; on in the test/debug config most developers load.
    pub validation_layers: bool,

    /// Directory guest self-wrapped images are resolved relative to
    /// when a path given on the CLI isn't absolute.
    pub image_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_reserved: default_system_reserved(),
            neo_mode: false,
            validation_layers: false,
            image_dir: None,
        }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults if it doesn't exist, then
    /// applies `TRITON_*` environment overrides. A present-but-invalid
    /// file is a hard error: silently falling back there would hide a
    /// typo in the user's config.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p).with_context(|| format!("reading config file {}", p.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing config file {}", p.display()))?
            }
            Some(p) => {
                anyhow::bail!("config file {} does not exist", p.display());
            }
            None => Config::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRITON_SYSTEM_RESERVED") {
            if let Ok(parsed) = u64::from_str_radix(v.trim_start_matches("0x"), 16) {
                self.system_reserved = parsed;
            }
        }
        if let Ok(v) = std::env::var("TRITON_NEO_MODE") {
            self.neo_mode = matches!(v.as_str(), "1" | "true");
        }
        if let Ok(v) = std::env::var("TRITON_VALIDATION_LAYERS") {
            self.validation_layers = matches!(v.as_str(), "1" | "true");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_loader_address_plan() {
        let config = Config::default();
        assert_eq!(config.system_reserved, loader::linker::SYSTEM_RESERVED);
        assert!(!config.neo_mode);
    }

    #[test]
    fn missing_path_falls_back_to_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.system_reserved, loader::linker::SYSTEM_RESERVED);
    }

    #[test]
    fn loads_overrides_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triton.toml");
        std::fs::write(&path, "neo_mode = true\nvalidation_layers = true\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(config.neo_mode);
        assert!(config.validation_layers);
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let path = Path::new("/nonexistent/triton.toml");
        assert!(Config::load(Some(path)).is_err());
    }
}
