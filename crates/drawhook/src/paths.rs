use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "DRAWHOOK_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "DRAWHOOK_DATA_DIR";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "drawhook";
const APPLICATION: &str = "drawhook";

const CONFIG_FILE: &str = "drawhook.toml";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover() -> Result<Self> {
        let overrides = (env_override(ENV_CONFIG_DIR), env_override(ENV_DATA_DIR));
        if let (Some(config_dir), Some(data_dir)) = overrides {
            return Ok(Self {
                config_dir,
                data_dir,
            });
        }

        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)
            .ok_or_else(|| anyhow!("failed to determine user directories"))?;
        let (config_dir, data_dir) = overrides;
        Ok(Self {
            config_dir: config_dir.unwrap_or_else(|| project_dirs.config_dir().to_path_buf()),
            data_dir: data_dir.unwrap_or_else(|| project_dirs.data_dir().to_path_buf()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.data_dir.join("traces")
    }

    /// Resolves a trace argument: existing paths win, bare relative names
    /// fall back to the trace directory.
    pub fn locate_trace(&self, trace: &Path) -> PathBuf {
        if trace.is_absolute() || trace.exists() {
            return trace.to_path_buf();
        }
        let candidate = self.trace_dir().join(trace);
        if candidate.exists() {
            candidate
        } else {
            trace.to_path_buf()
        }
    }
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}
