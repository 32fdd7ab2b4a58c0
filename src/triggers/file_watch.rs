//! File-watch trigger: fire when watched paths change, with debouncing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use super::{Trigger, TriggerCallback, TriggerError, TriggerEvent};

/// Fires a templated prompt when files under the watched paths change.
/// Bursts within the debounce window collapse into one firing per path.
pub struct FileWatchTrigger {
    paths: Vec<PathBuf>,
    extensions: Vec<String>,
    debounce: Duration,
    prompt_template: String,
    stop_tx: watch::Sender<bool>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatchTrigger {
    pub fn new(
        paths: Vec<String>,
        extensions: Vec<String>,
        debounce_seconds: u64,
        prompt_template: String,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            paths: paths.into_iter().map(PathBuf::from).collect(),
            extensions,
            debounce: Duration::from_secs(debounce_seconds),
            prompt_template,
            stop_tx,
            watcher: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn extension_matches(extensions: &[String], path: &std::path::Path) -> bool {
        if extensions.is_empty() {
            return true;
        }
        let name = path.to_string_lossy();
        extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }
}

#[async_trait]
impl Trigger for FileWatchTrigger {
    fn kind(&self) -> &'static str {
        "file-watch"
    }

    async fn start(&self, callback: TriggerCallback) -> Result<(), TriggerError> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PathBuf>();

        // The notify handler runs on the watcher's own thread; it only
        // forwards paths into the async side.
        let mut watcher = notify::recommended_watcher(move |result: Result<Event, notify::Error>| {
            match result {
                Ok(event) => {
                    for path in event.paths {
                        let _ = event_tx.send(path);
                    }
                }
                Err(e) => warn!("file watcher error: {e}"),
            }
        })
        .map_err(|e| TriggerError::Watch(e.to_string()))?;

        for path in &self.paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|e| TriggerError::Watch(format!("{}: {e}", path.display())))?;
        }
        *self.watcher.lock().await = Some(watcher);

        let extensions = self.extensions.clone();
        let debounce = self.debounce;
        let template = self.prompt_template.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut last_fired: HashMap<PathBuf, Instant> = HashMap::new();
            loop {
                let path = tokio::select! {
                    _ = stop_rx.changed() => return,
                    path = event_rx.recv() => match path {
                        Some(path) => path,
                        None => return,
                    },
                };
                if !FileWatchTrigger::extension_matches(&extensions, &path) {
                    continue;
                }
                let now = Instant::now();
                if let Some(last) = last_fired.get(&path) {
                    if now.duration_since(*last) < debounce {
                        continue;
                    }
                }
                last_fired.insert(path.clone(), now);

                let path_str = path.to_string_lossy().to_string();
                let prompt = template.replace("{path}", &path_str);
                let event = TriggerEvent::new("file-watch", prompt).with_metadata("path", path_str);
                callback(event).await;
            }
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        // Dropping the watcher stops its thread.
        self.watcher.lock().await.take();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}
