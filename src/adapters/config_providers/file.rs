use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::ServerConfig},
    ports::config_provider::ConfigProvider,
};

/// Gateway configuration read from a local YAML / JSON / TOML file.
///
/// The parent directory is watched (editors often replace the file instead of writing it in
/// place) and every change to the file itself is reported on the channel handed out by
/// [`ConfigProvider::watch`]. Bursts of events collapse into a single pending signal.
pub struct FileConfigProvider {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    changes: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| eyre::eyre!("Config path {} has no file name", path.display()))?;

        let (tx, rx) = mpsc::channel(1);
        let watcher = watch_file(&path, file_name, tx)?;

        Ok(Self {
            path,
            _watcher: watcher,
            changes: Mutex::new(Some(rx)),
        })
    }
}

fn touches(event: &Event, file_name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

fn watch_file(
    path: &Path,
    file_name: OsString,
    tx: mpsc::Sender<()>,
) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if touches(&event, &file_name) => {
            tracing::debug!("Config file event: {:?}", event.kind);
            // Full channel: a reload is already pending
            let _ = tx.try_send(());
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Config file watch error: {}", e),
    })
    .wrap_err("Failed to create config file watcher")?;

    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .wrap_err_with(|| format!("Failed to watch {}", dir.display()))?;
    Ok(watcher)
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    fn source(&self) -> String {
        self.path.display().to_string()
    }

    async fn load_config(&self) -> Result<ServerConfig> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Config path {} is not UTF-8", self.path.display()))?;
        load_config(path).await
    }

    /// The change channel can be taken once; later calls get a channel that is already
    /// closed.
    fn watch(&self) -> mpsc::Receiver<()> {
        let mut slot = self
            .changes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.take() {
            Some(rx) => rx,
            None => {
                tracing::warn!("Config watch for {} was already taken", self.source());
                mpsc::channel(1).1
            }
        }
    }
}
