use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::adblock::RuleSet;

/// Rebuilds the rule database whenever one of its source files changes on
/// disk. A blocking thread holds the watcher; the swap is atomic so in-flight
/// lookups keep the database they started with.
pub fn spawn(paths: Vec<PathBuf>, rules: Arc<ArcSwap<RuleSet>>) {
    if paths.is_empty() {
        return;
    }
    thread::spawn(move || {
        if let Err(err) = run_watcher(paths, rules) {
            error!(target: "watcher", error = %err, "rule watcher exited with error");
        }
    });
}

fn run_watcher(paths: Vec<PathBuf>, rules: Arc<ArcSwap<RuleSet>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    for path in &paths {
        if let Err(err) = watcher.watch(path, RecursiveMode::NonRecursive) {
            warn!(target: "watcher", path = %path.display(), error = %err, "could not watch rule file");
        }
    }

    info!(target: "watcher", files = paths.len(), "rule watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // Editors truncate-then-write; retry over the race instead of
                // swapping in a half-written file.
                let mut retries = 3;
                while retries > 0 {
                    let reloaded = RuleSet::load_files(&paths);
                    if reloaded.rule_count() > 0 {
                        info!(target: "watcher", rules = reloaded.rule_count(), "rule database reloaded");
                        rules.store(Arc::new(reloaded));
                        break;
                    }
                    retries -= 1;
                    if retries == 0 {
                        warn!(target: "watcher", "rule reload produced no rules, keeping old database");
                    } else {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                }
            }
            Err(err) => {
                warn!(target: "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}
