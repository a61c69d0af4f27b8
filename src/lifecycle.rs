use std::fmt;
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::config::AppConfig;
use crate::debounce::Debounce;
use crate::dispatch::{BindingSnapshot, InputBinding};
use crate::error::AppError;
use crate::gpio::{Direction, GpioBackend, LineSnapshot, SharedLine};
use crate::launcher::{LaunchStats, Launcher, LauncherWorker, Spawner};
use crate::registry::LineRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Uninitialized, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One resource taken during start, undone in reverse on stop or rollback.
enum Acquisition {
    Claimed(SharedLine),
    Exported { line: SharedLine, shutdown_level: Option<bool> },
    Bound(Arc<InputBinding>),
}

/// What was observed just before teardown.
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub levels: Vec<LineSnapshot>,
    pub bindings: Vec<BindingSnapshot>,
    pub launches: LaunchStats,
}

impl StopReport {
    pub fn total_presses(&self) -> u64 {
        self.bindings.iter().map(|b| b.presses).sum()
    }

    pub fn presses(&self, name: &str) -> Option<u64> {
        self.bindings
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.presses)
    }
}

struct Inner {
    state: LifecycleState,
    ledger: Vec<Acquisition>,
    lines: Vec<SharedLine>,
    bindings: Vec<Arc<InputBinding>>,
    worker: Option<LauncherWorker>,
}

/// Owns every line and binding of one run. Single use: once stopped, build a
/// new controller to run again.
pub struct Controller<B: GpioBackend> {
    config: Arc<AppConfig>,
    registry: Arc<LineRegistry<B>>,
    spawner: Arc<dyn Spawner>,
    inner: Mutex<Inner>,
}

impl<B: GpioBackend + 'static> Controller<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            config,
            registry: Arc::new(LineRegistry::new(backend)),
            spawner,
            inner: Mutex::new(Inner {
                state: LifecycleState::Uninitialized,
                ledger: Vec::new(),
                lines: Vec::new(),
                bindings: Vec::new(),
                worker: None,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn registry(&self) -> &Arc<LineRegistry<B>> {
        &self.registry
    }

    /// Moves to `next` only if the controller is still in `from`.
    fn advance_from(&self, from: LifecycleState, next: LifecycleState) -> Result<(), AppError> {
        let mut inner = self.inner.lock();
        if inner.state != from || !inner.state.can_advance_to(next) {
            return Err(AppError::InvalidState(format!(
                "cannot go from {} to {next}",
                inner.state
            )));
        }
        info!("controller {} -> {next}", inner.state);
        inner.state = next;
        Ok(())
    }

    /// Claims outputs, then inputs, in declared order. On failure everything
    /// taken so far is released in reverse and the original error returned.
    pub async fn start(&self) -> Result<(), AppError> {
        self.advance_from(LifecycleState::Uninitialized, LifecycleState::Starting)?;

        let (launcher, worker) =
            Launcher::spawn(self.spawner.clone(), self.config.launch_queue_capacity);
        let mut ledger = Vec::new();
        let mut lines = Vec::new();
        let mut bindings = Vec::new();

        let acquired = self.acquire(&launcher, &mut ledger, &mut lines, &mut bindings);

        if acquired.is_ok() {
            // publish and go live in one step, so nothing observes a running
            // controller without its ledger
            let mut inner = self.inner.lock();
            if inner.state == LifecycleState::Starting {
                info!("controller {} -> {}", inner.state, LifecycleState::Running);
                inner.state = LifecycleState::Running;
                inner.ledger = ledger;
                inner.lines = lines;
                inner.bindings = bindings;
                inner.worker = Some(worker);
                return Ok(());
            }
        }

        let err = match acquired {
            Err(e) => e,
            Ok(()) => AppError::InvalidState(format!("start interrupted while {}", self.state())),
        };
        error!(
            "start failed: {err}; rolling back {} acquisitions",
            ledger.len()
        );
        if let Err(e) = self.advance_from(LifecycleState::Starting, LifecycleState::Stopping) {
            warn!("{e}");
        }
        self.unwind(&mut ledger, |_| {});
        drop(bindings);
        drop(launcher);
        worker.shutdown().await;
        if let Err(e) = self.advance_from(LifecycleState::Stopping, LifecycleState::Stopped) {
            warn!("{e}");
        }
        Err(err)
    }

    fn acquire(
        &self,
        launcher: &Launcher,
        ledger: &mut Vec<Acquisition>,
        lines: &mut Vec<SharedLine>,
        bindings: &mut Vec<Arc<InputBinding>>,
    ) -> Result<(), AppError> {
        self.config.validate()?;
        let registry = &self.registry;
        let backend = registry.backend();
        let mut outputs: FxHashMap<&str, SharedLine> = FxHashMap::default();

        for out in &self.config.outputs {
            let line = registry.claim(out.line, Direction::Output)?;
            ledger.push(Acquisition::Claimed(line.clone()));
            lines.push(line.clone());

            registry.set_level(&line, out.initial_level)?;
            registry.export(&line, out.lock_direction)?;
            ledger.push(Acquisition::Exported {
                line: line.clone(),
                shutdown_level: Some(out.shutdown_level),
            });

            info!(
                "output {} on line {} initial level {}",
                out.name,
                out.line,
                u8::from(out.initial_level)
            );
            outputs.insert(out.name.as_str(), line);
        }

        for input in &self.config.inputs {
            let line = registry.claim(input.line, Direction::Input)?;
            ledger.push(Acquisition::Claimed(line.clone()));
            lines.push(line.clone());

            registry.export(&line, input.lock_direction)?;
            ledger.push(Acquisition::Exported {
                line: line.clone(),
                shutdown_level: None,
            });

            let debounce = Debounce::from_millis(input.debounce_ms);
            let source = backend.interrupt_source(line.lock().token()?)?;
            let level = registry.level(&line)?;
            info!(
                "input {} on line {} mapped to irq {source}, level {}, debounce {}ms",
                input.name,
                input.line,
                u8::from(level),
                debounce.as_millis()
            );

            let output = outputs.get(input.output.as_str()).cloned().ok_or_else(|| {
                AppError::Config(format!("unknown output {}", input.output))
            })?;
            let binding = Arc::new(InputBinding::new(
                input.name.clone(),
                line,
                debounce,
                output,
                input.action,
                input.side_effect.clone(),
                launcher.clone(),
            ));

            let handle = backend
                .bind_rising_edge(source, binding.handler(registry.clone()), debounce)
                .map_err(|e| match e {
                    AppError::BindFailure { .. } => e,
                    other => AppError::BindFailure {
                        line: input.line,
                        reason: other.to_string(),
                    },
                })?;
            binding.attach(handle);
            ledger.push(Acquisition::Bound(binding.clone()));
            bindings.push(binding);
            info!("input {} bound as {handle}", input.name);
        }

        Ok(())
    }

    /// Undoes the ledger newest first. Step failures are logged and the walk
    /// continues so nothing further leaks, except that a line whose interrupt
    /// could not be unbound is left claimed. `observe` sees each line right
    /// before it is unexported.
    fn unwind(&self, ledger: &mut Vec<Acquisition>, mut observe: impl FnMut(&SharedLine)) {
        let backend = self.registry.backend();
        let mut held: FxHashSet<u32> = FxHashSet::default();

        while let Some(acquisition) = ledger.pop() {
            match acquisition {
                Acquisition::Bound(binding) => {
                    if let Some(handle) = binding.detach()
                        && let Err(e) = backend.unbind(handle)
                    {
                        let id = binding.input().lock().id();
                        error!(
                            "unbind {} failed: {e}; line {id} stays claimed",
                            binding.name()
                        );
                        held.insert(id);
                    }
                }
                Acquisition::Exported {
                    line,
                    shutdown_level,
                } => {
                    let id = line.lock().id();
                    if held.contains(&id) {
                        continue;
                    }
                    observe(&line);
                    if let Some(level) = shutdown_level
                        && let Err(e) = self.registry.set_level(&line, level)
                    {
                        warn!("shutdown level for line {id} failed: {e}");
                    }
                    if let Err(e) = self.registry.unexport(&line) {
                        warn!("unexport line {id} failed: {e}");
                    }
                }
                Acquisition::Claimed(line) => {
                    let id = line.lock().id();
                    if held.contains(&id) {
                        continue;
                    }
                    if let Err(e) = self.registry.release(&line) {
                        warn!("release line {id} failed: {e}");
                    }
                }
            }
        }
    }

    /// Final level of a line whose handlers are already unbound.
    fn final_level(&self, line: &SharedLine) -> LineSnapshot {
        if let Err(e) = self.registry.level(line) {
            warn!("final level of line {} unreadable: {e}", line.lock().id());
        }
        line.lock().snapshot()
    }

    /// Unbinds, unexports and releases in reverse acquisition order, then
    /// drains the launch queue. Only a running controller can be stopped; a
    /// failing start rolls itself back.
    pub async fn stop(&self) -> Result<StopReport, AppError> {
        self.advance_from(LifecycleState::Running, LifecycleState::Stopping)?;

        let (mut ledger, _lines, bindings, worker) = {
            let mut inner = self.inner.lock();
            (
                std::mem::take(&mut inner.ledger),
                std::mem::take(&mut inner.lines),
                std::mem::take(&mut inner.bindings),
                inner.worker.take(),
            )
        };

        // inputs sit above outputs in the ledger, so every handler that could
        // drive an output is gone before the output is observed
        let mut levels = Vec::new();
        self.unwind(&mut ledger, |line| levels.push(self.final_level(line)));
        levels.reverse();
        for snapshot in &levels {
            info!(
                "line {} ({:?}) final level {}",
                snapshot.line,
                snapshot.direction,
                u8::from(snapshot.level)
            );
        }

        // handlers are unbound, counters are final
        let bindings: Vec<BindingSnapshot> = bindings.iter().map(|b| b.snapshot()).collect();
        for binding in &bindings {
            info!(
                "{} (line {}) was pressed {} times",
                binding.name, binding.line, binding.presses
            );
        }

        let launches = match worker {
            Some(worker) => worker.shutdown().await,
            None => LaunchStats::default(),
        };
        info!(
            "side effects launched {}, failed {}",
            launches.launched, launches.failed
        );

        self.advance_from(LifecycleState::Stopping, LifecycleState::Stopped)?;

        Ok(StopReport {
            levels,
            bindings,
            launches,
        })
    }

    /// Exported lines, only while running.
    pub fn exported_lines(&self) -> Vec<LineSnapshot> {
        let inner = self.inner.lock();
        if inner.state != LifecycleState::Running {
            return Vec::new();
        }
        inner
            .lines
            .iter()
            .map(|line| line.lock().snapshot())
            .filter(|snapshot| snapshot.exported)
            .collect()
    }

    fn exported_line(&self, id: u32) -> Result<SharedLine, AppError> {
        let inner = self.inner.lock();
        if inner.state != LifecycleState::Running {
            return Err(AppError::NotFoundLine(id));
        }
        inner
            .lines
            .iter()
            .find(|line| {
                let line = line.lock();
                line.id() == id && line.is_exported()
            })
            .cloned()
            .ok_or(AppError::NotFoundLine(id))
    }

    pub fn line(&self, id: u32) -> Result<LineSnapshot, AppError> {
        let line = self.exported_line(id)?;
        let snapshot = line.lock().snapshot();
        Ok(snapshot)
    }

    /// Reads the level from the platform rather than the cache.
    pub fn read_level(&self, id: u32) -> Result<bool, AppError> {
        let line = self.exported_line(id)?;
        self.registry.level(&line)
    }

    pub fn bindings(&self) -> Vec<BindingSnapshot> {
        self.inner
            .lock()
            .bindings
            .iter()
            .map(|b| b.snapshot())
            .collect()
    }
}

impl<B: GpioBackend> Drop for Controller<B> {
    fn drop(&mut self) {
        let state = self.inner.get_mut().state;
        if matches!(state, LifecycleState::Running | LifecycleState::Starting) {
            warn!("controller dropped while {state}, lines were not released in order");
        }
    }
}
