//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::schema::{MultiProfileConfig, Profile, ProfileConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {}", format_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load, merge and validate the configuration for one profile.
///
/// With no explicit path, `config.json` is looked up in the working
/// directory and next to the executable. A missing file is not an error:
/// the profile defaults apply unchanged.
pub fn load_profile(path: Option<&Path>, profile: Profile) -> Result<ProfileConfig, ConfigError> {
    let resolved = match path {
        Some(p) => p.exists().then(|| p.to_path_buf()),
        None => discover_config_file(),
    };

    let cfg = match resolved {
        None => ProfileConfig::defaults_for(profile),
        Some(path) => {
            let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            parse_profile(&content, profile).map_err(|source| ConfigError::Parse { path, source })?
        }
    };

    validate_config(&cfg).map_err(ConfigError::Validation)?;
    Ok(cfg)
}

/// Parse `content` as either a sectioned `{"login": …, "game": …}` file
/// or a flat single-profile file, and merge with profile defaults.
///
/// Sectioned files are recognised by the presence of a `login` or `game`
/// key; a flat file would otherwise also decode as a sectioned one with
/// both sections empty.
fn parse_profile(content: &str, profile: Profile) -> Result<ProfileConfig, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    let sectioned = value
        .as_object()
        .is_some_and(|o| o.contains_key("login") || o.contains_key("game"));

    let cfg = if sectioned {
        let multi: MultiProfileConfig = serde_json::from_value(value)?;
        match profile {
            Profile::Login => multi.login,
            Profile::Game => multi.game,
        }
    } else {
        serde_json::from_value(value)?
    };

    Ok(cfg.merged_with(ProfileConfig::defaults_for(profile)))
}

fn discover_config_file() -> Option<PathBuf> {
    let mut candidates = vec![PathBuf::from("config.json")];
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("config.json"));
        }
    }
    candidates.into_iter().find(|p| p.exists())
}
