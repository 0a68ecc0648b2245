//! External storage plugins
//!
//! A plugin receives copies of the coordinator's backup artifacts after the
//! local backup finished. Only the initial reachability check is fatal; uploads
//! are best effort.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::PluginConfig;
use crate::errors::{BackupError, Result};

pub trait StoragePlugin: Send + Sync {
    fn check_reachable(&self, config: &PluginConfig, config_path: &Path) -> Result<()>;
    fn upload(&self, config: &PluginConfig, config_path: &Path, file: &Path) -> Result<()>;
}

/// Runs the configured executable: `<exe> --version` to probe it and
/// `<exe> backup_file <config> <file>` for each upload.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutablePlugin;

impl ExecutablePlugin {
    fn run(&self, config: &PluginConfig, args: &[&std::ffi::OsStr]) -> Result<()> {
        let output = Command::new(&config.executablepath)
            .args(args)
            .output()
            .map_err(|e| {
                BackupError::Plugin(format!(
                    "cannot run {}: {}",
                    config.executablepath.display(),
                    e
                ))
            })?;
        if !output.status.success() {
            return Err(BackupError::Plugin(format!(
                "{} exited with {}: {}",
                config.executablepath.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl StoragePlugin for ExecutablePlugin {
    fn check_reachable(&self, config: &PluginConfig, _config_path: &Path) -> Result<()> {
        self.run(config, &["--version".as_ref()])
    }

    fn upload(&self, config: &PluginConfig, config_path: &Path, file: &Path) -> Result<()> {
        self.run(
            config,
            &["backup_file".as_ref(), config_path.as_os_str(), file.as_os_str()],
        )
    }
}

/// A plugin with its parsed configuration, verified reachable.
#[derive(Clone)]
pub struct ConfiguredPlugin {
    plugin: Arc<dyn StoragePlugin>,
    config: PluginConfig,
    config_path: PathBuf,
}

impl ConfiguredPlugin {
    /// Loads the plugin config and probes the plugin. Both failures are fatal.
    #[instrument(skip(plugin))]
    pub fn setup(plugin: Arc<dyn StoragePlugin>, config_path: &Path) -> Result<Self> {
        let config = PluginConfig::load_from_file(config_path)?;
        plugin.check_reachable(&config, config_path).map_err(|e| {
            BackupError::Plugin(format!(
                "plugin {} is not usable: {}",
                config.executablepath.display(),
                e
            ))
        })?;
        info!("Using storage plugin {}", config.executablepath.display());
        Ok(Self {
            plugin,
            config,
            config_path: config_path.to_path_buf(),
        })
    }

    pub fn executable(&self) -> &Path {
        &self.config.executablepath
    }

    /// Uploads each existing file and returns one warning per failed upload.
    pub fn upload_artifacts(&self, files: &[PathBuf]) -> Vec<String> {
        let mut warnings = Vec::new();
        for file in files {
            if !file.exists() {
                continue;
            }
            match self.plugin.upload(&self.config, &self.config_path, file) {
                Ok(()) => info!("Uploaded {} through plugin", file.display()),
                Err(e) => {
                    let warning = format!("Upload of {} failed: {}", file.display(), e);
                    warn!("{}", warning);
                    warnings.push(warning);
                }
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FlakyPlugin {
        reachable: bool,
        uploaded: Mutex<Vec<PathBuf>>,
    }

    impl StoragePlugin for FlakyPlugin {
        fn check_reachable(&self, _: &PluginConfig, _: &Path) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(BackupError::Plugin("connection refused".into()))
            }
        }

        fn upload(&self, _: &PluginConfig, _: &Path, file: &Path) -> Result<()> {
            if file.extension().is_some_and(|e| e == "sql") {
                return Err(BackupError::Plugin("bucket full".into()));
            }
            self.uploaded.lock().push(file.to_path_buf());
            Ok(())
        }
    }

    fn write_config(dir: &Path) -> PathBuf {
        let path = dir.join("plugin.yaml");
        fs::write(&path, "executablepath: /opt/plugins/store\n").unwrap();
        path
    }

    #[test]
    fn test_unreachable_plugin_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let config = write_config(temp_dir.path());
        let result = ConfiguredPlugin::setup(Arc::new(FlakyPlugin::default()), &config);
        assert!(matches!(result, Err(BackupError::Plugin(_))));
    }

    #[test]
    fn test_upload_failures_become_warnings() {
        let temp_dir = TempDir::new().unwrap();
        let config = write_config(temp_dir.path());
        let plugin = Arc::new(FlakyPlugin {
            reachable: true,
            ..Default::default()
        });
        let configured = ConfiguredPlugin::setup(plugin.clone(), &config).unwrap();

        let toc = temp_dir.path().join("toc.yaml");
        let metadata = temp_dir.path().join("metadata.sql");
        fs::write(&toc, "{}").unwrap();
        fs::write(&metadata, "").unwrap();

        let warnings = configured.upload_artifacts(&[
            metadata.clone(),
            toc.clone(),
            temp_dir.path().join("never_written"),
        ]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("metadata.sql"));
        assert_eq!(*plugin.uploaded.lock(), vec![toc]);
    }
}
