//! Hot reload of the configuration file.
//!
//! Write events re-run the full init sequence; a parse or probe failure
//! leaves the installed routing table untouched. There is no debounce, so
//! rapid repeated writes trigger repeated rebuilds, each bounded in cost by
//! node count times the probe timeout.

use std::path::PathBuf;
use std::sync::Arc;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Watch `path` for write events and reload the engine on each one.
///
/// Listen address, protocol and TLS material are fixed at startup; a reload
/// only replaces routing tables and limiters.
pub fn watch_config(path: PathBuf, engine: Arc<Engine>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Event>(16);

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        if let Ok(event) = result {
            let _ = tx.blocking_send(event);
        }
    })
    .map_err(|err| Error::Config(format!("config watcher: {err}")))?;

    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .map_err(|err| Error::Config(format!("config watcher: {err}")))?;

    tokio::spawn(async move {
        // The watcher must stay alive as long as reloads are wanted.
        let _watcher = watcher;
        while let Some(event) = rx.recv().await {
            if !matches!(event.kind, EventKind::Modify(_)) {
                continue;
            }
            match Config::load(&path) {
                Ok(config) => match engine.init_nodes(&config).await {
                    Ok(()) => info!("configuration reloaded"),
                    Err(err) => {
                        warn!(error = %err, "reload failed, previous routing table retained");
                    }
                },
                Err(err) => warn!(error = %err, "ignoring unparseable config update"),
            }
        }
    });

    Ok(())
}
