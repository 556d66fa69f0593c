//! Live event streams (SSE and WebSocket) and the session file watcher.

use std::collections::{BTreeSet, HashSet};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use ralph::events::{EventBus, RalphEvent};
use ralph::io::paths::RalphPaths;
use ralph::io::session_store::is_session_file_name;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::AppState;

fn event_json(event: &RalphEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(err) => {
            warn!(kind = event.kind(), %err, "cannot serialize event");
            None
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.bus.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(json) = event_json(&event) {
                        yield Ok(Event::default().event("message").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// WebSocket endpoint: one JSON text frame per event.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.bus.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, rx))
}

async fn forward_events(socket: WebSocket, mut rx: broadcast::Receiver<RalphEvent>) {
    let (mut sender, mut receiver) = socket.split();
    if sender
        .send(Message::Text(r#"{"type":"connected"}"#.into()))
        .await
        .is_err()
    {
        return;
    }
    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            event = rx.recv() => match event {
                Ok(event) => {
                    let Some(json) = event_json(&event) else { continue };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "websocket client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("websocket client disconnected");
}

/// Start the session watcher in a background task.
///
/// Roots sent on the returned channel are watched from then on; `initial`
/// roots are watched right away.
pub fn start_session_watcher(bus: EventBus, initial: Vec<PathBuf>) -> mpsc::UnboundedSender<PathBuf> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = run_session_watcher(bus, initial, rx).await {
            warn!(error = %e, "session watcher failed");
        }
    });
    tx
}

async fn run_session_watcher(
    bus: EventBus,
    initial: Vec<PathBuf>,
    mut roots_rx: mpsc::UnboundedReceiver<PathBuf>,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    let mut roots = WatchedRoots::default();
    for root in initial {
        roots.add(&mut watcher, root);
    }

    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(100));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            Some(root) = roots_rx.recv() => {
                roots.add(&mut watcher, root);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&bus, &roots, &pending_events);
                pending_events.clear();
            }
        }
    }
}

/// Project roots whose `.ralph/sessions/` directory is being watched.
#[derive(Debug, Default)]
struct WatchedRoots {
    roots: Vec<(PathBuf, PathBuf)>,
    seen: HashSet<PathBuf>,
}

impl WatchedRoots {
    fn add(&mut self, watcher: &mut impl Watcher, root: PathBuf) {
        if self.seen.contains(&root) {
            return;
        }
        let sessions_dir = RalphPaths::new(&root).sessions_dir;
        if !sessions_dir.is_dir() {
            debug!(path = %sessions_dir.display(), "no sessions directory yet");
            return;
        }
        match watcher.watch(&sessions_dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                info!(path = %sessions_dir.display(), "watching sessions");
                self.seen.insert(root.clone());
                self.roots.push((root, sessions_dir));
            }
            Err(err) => warn!(path = %sessions_dir.display(), %err, "cannot watch sessions"),
        }
    }

    fn root_for(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .find(|(_, dir)| path.parent() == Some(dir.as_path()))
            .map(|(root, _)| root.as_path())
    }
}

fn process_events(bus: &EventBus, roots: &WatchedRoots, events: &[NotifyEvent]) {
    let mut changed: BTreeSet<(String, PathBuf)> = BTreeSet::new();

    for event in events {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            continue;
        }
        for path in &event.paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_session_file_name(name) {
                continue;
            }
            let Some(root) = roots.root_for(path) else {
                continue;
            };
            let session_id = name.trim_end_matches(".json").to_string();
            changed.insert((session_id, root.to_path_buf()));
        }
    }

    for (session_id, root) in changed {
        debug!(session_id = %session_id, "broadcasting session change");
        bus.publish(RalphEvent::SessionChanged {
            session_id,
            project_root: Some(root),
        });
    }
}
