use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::error::AppError;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Debounced change notification for one tracked path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Changed(PathBuf),
    Removed(PathBuf),
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            Self::Changed(path) | Self::Removed(path) => path,
        }
    }
}

/// Watches roots and coalesces rapid changes to the same path within the
/// debounce window; a removal observed during the window wins over edits.
pub struct FileWatcher {
    // Dropping the watcher stops the OS subscription.
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    pub fn spawn(
        roots: &[PathBuf],
        debounce: Duration,
    ) -> Result<(Self, mpsc::Receiver<FileEvent>), AppError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<FileEvent>();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "file watcher error");
                    return;
                }
            };

            let removed = matches!(event.kind, EventKind::Remove(_));
            for path in event.paths {
                let file_event = if removed {
                    FileEvent::Removed(path)
                } else {
                    FileEvent::Changed(path)
                };
                let _ = raw_tx.send(file_event);
            }
        })
        .map_err(|e| AppError::FatalInit(format!("failed to start file watcher: {e}")))?;

        for root in roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| {
                    AppError::FatalInit(format!("failed to watch {}: {e}", root.display()))
                })?;
        }

        let (out_tx, out_rx) = mpsc::channel(256);
        tokio::spawn(debounce_loop(raw_rx, out_tx, debounce));

        Ok((Self { _watcher: watcher }, out_rx))
    }
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<FileEvent>,
    out_tx: mpsc::Sender<FileEvent>,
    debounce: Duration,
) {
    let mut pending: HashMap<PathBuf, (FileEvent, Instant)> = HashMap::new();
    let mut tick = tokio::time::interval(debounce.max(Duration::from_millis(10)) / 2);

    loop {
        tokio::select! {
            event = raw_rx.recv() => {
                let Some(event) = event else { break };
                let path = event.path().to_path_buf();
                let replace = match (pending.get(&path), &event) {
                    // A removal inside the window overrides queued edits; the
                    // reverse does not (delete-then-recreate still re-ingests
                    // via the next change event).
                    (Some((FileEvent::Removed(_), _)), FileEvent::Changed(_)) => false,
                    _ => true,
                };
                if replace {
                    pending.insert(path, (event, Instant::now()));
                } else if let Some(entry) = pending.get_mut(&path) {
                    entry.1 = Instant::now();
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, (_, seen))| now.duration_since(*seen) >= debounce)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    if let Some((event, _)) = pending.remove(&path) {
                        debug!(path = %path.display(), "debounced file event");
                        if out_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    // Channel closed: flush whatever is still pending.
    for (_, (event, _)) in pending.drain() {
        let _ = out_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_debounce(events: Vec<FileEvent>, debounce: Duration) -> Vec<FileEvent> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(64);
        tokio::spawn(debounce_loop(raw_rx, out_tx, debounce));

        for event in events {
            raw_tx.send(event).expect("send");
        }
        drop(raw_tx);

        let mut seen = Vec::new();
        while let Some(event) = out_rx.recv().await {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn rapid_changes_to_one_path_coalesce() {
        let path = PathBuf::from("/tmp/a.md");
        let events = vec![
            FileEvent::Changed(path.clone()),
            FileEvent::Changed(path.clone()),
            FileEvent::Changed(path.clone()),
        ];

        let seen = run_debounce(events, Duration::from_millis(30)).await;
        assert_eq!(seen, vec![FileEvent::Changed(path)]);
    }

    #[tokio::test]
    async fn removal_wins_over_queued_changes() {
        let path = PathBuf::from("/tmp/a.md");
        let events = vec![
            FileEvent::Changed(path.clone()),
            FileEvent::Removed(path.clone()),
            FileEvent::Changed(path.clone()),
        ];

        let seen = run_debounce(events, Duration::from_millis(30)).await;
        assert_eq!(seen, vec![FileEvent::Removed(path)]);
    }

    #[tokio::test]
    async fn distinct_paths_are_not_coalesced() {
        let a = PathBuf::from("/tmp/a.md");
        let b = PathBuf::from("/tmp/b.md");
        let events = vec![FileEvent::Changed(a.clone()), FileEvent::Changed(b.clone())];

        let mut seen = run_debounce(events, Duration::from_millis(30)).await;
        seen.sort_by_key(|event| event.path().to_path_buf());
        assert_eq!(seen, vec![FileEvent::Changed(a), FileEvent::Changed(b)]);
    }
}
