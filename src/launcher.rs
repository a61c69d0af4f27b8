use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::default_env;
use crate::error::AppError;

/// External program run for every qualifying edge of one binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SideEffect {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// The complete environment of the child; nothing is inherited.
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
}

impl SideEffect {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            args: Vec::new(),
            env: default_env(),
        }
    }
}

/// Platform process-spawn service.
pub trait Spawner: Send + Sync {
    /// Starts the program and returns without waiting for it.
    fn spawn_detached(&self, effect: &SideEffect) -> Result<(), AppError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn_detached(&self, effect: &SideEffect) -> Result<(), AppError> {
        let child = tokio::process::Command::new(&effect.path)
            .args(&effect.args)
            .env_clear()
            .envs(&effect.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| AppError::SpawnFailure {
                path: effect.path.display().to_string(),
                reason: e.to_string(),
            })?;

        // dropping the child leaves reaping to the runtime
        debug!("spawned {} (pid {:?})", effect.path.display(), child.id());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Launch {
    pub binding: String,
    pub effect: Arc<SideEffect>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaunchStats {
    pub launched: u64,
    pub failed: u64,
}

/// Producer side of the launch queue. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct Launcher {
    tx: mpsc::Sender<Launch>,
}

impl Launcher {
    pub(crate) fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Launch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Starts the background worker on the current tokio runtime.
    pub fn spawn(spawner: Arc<dyn Spawner>, capacity: usize) -> (Self, LauncherWorker) {
        let (launcher, rx) = Self::bounded(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_worker(spawner, rx, shutdown_rx));

        (
            launcher,
            LauncherWorker {
                shutdown: Some(shutdown_tx),
                handle,
            },
        )
    }

    pub fn launch(&self, binding: &str, effect: &Arc<SideEffect>) -> Result<(), AppError> {
        self.tx
            .try_send(Launch {
                binding: binding.to_string(),
                effect: Arc::clone(effect),
            })
            .map_err(|e| {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "launch queue full",
                    mpsc::error::TrySendError::Closed(_) => "launcher stopped",
                };
                AppError::PartialHandling(format!(
                    "side effect {} for {binding} not queued: {reason}",
                    effect.path.display()
                ))
            })
    }
}

pub struct LauncherWorker {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<LaunchStats>,
}

impl LauncherWorker {
    /// Closes the queue, runs whatever was already queued, and waits for the
    /// worker to finish.
    pub async fn shutdown(mut self) -> LaunchStats {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("launcher worker ended abnormally: {e}");
                LaunchStats::default()
            }
        }
    }
}

async fn run_worker(
    spawner: Arc<dyn Spawner>,
    mut rx: mpsc::Receiver<Launch>,
    mut shutdown: oneshot::Receiver<()>,
) -> LaunchStats {
    let mut stats = LaunchStats::default();

    loop {
        tokio::select! {
            biased;
            launch = rx.recv() => match launch {
                Some(launch) => launch_one(spawner.as_ref(), &launch, &mut stats),
                None => return stats,
            },
            _ = &mut shutdown => break,
        }
    }

    rx.close();
    while let Some(launch) = rx.recv().await {
        launch_one(spawner.as_ref(), &launch, &mut stats);
    }
    stats
}

fn launch_one(spawner: &dyn Spawner, launch: &Launch, stats: &mut LaunchStats) {
    match spawner.spawn_detached(&launch.effect) {
        Ok(()) => stats.launched += 1,
        Err(e) => {
            stats.failed += 1;
            warn!("side effect for {} failed: {e}", launch.binding);
        }
    }
}
