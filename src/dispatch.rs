use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::debounce::Debounce;
use crate::error::AppError;
use crate::gpio::{EdgeHandler, GpioBackend, HandledResult, IrqHandle, SharedLine};
use crate::launcher::{Launcher, SideEffect};
use crate::registry::LineRegistry;

/// Level an edge drives its bound output to.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OutputAction {
    On,
    Off,
}

impl OutputAction {
    pub fn level(&self) -> bool {
        matches!(self, OutputAction::On)
    }
}

/// One input line together with everything its edge handler touches.
///
/// Shape is fixed once built; only the press counter and the output line's
/// level change afterwards.
pub struct InputBinding {
    name: String,
    input: SharedLine,
    debounce: Debounce,
    irq: Mutex<Option<IrqHandle>>,
    presses: AtomicU64,
    output: SharedLine,
    action: OutputAction,
    side_effect: Arc<SideEffect>,
    launcher: Launcher,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindingSnapshot {
    pub name: String,
    pub line: u32,
    pub output_line: u32,
    pub action: OutputAction,
    pub debounce_ms: u64,
    pub presses: u64,
}

impl InputBinding {
    pub fn new(
        name: impl Into<String>,
        input: SharedLine,
        debounce: Debounce,
        output: SharedLine,
        action: OutputAction,
        side_effect: SideEffect,
        launcher: Launcher,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            debounce,
            irq: Mutex::new(None),
            presses: AtomicU64::new(0),
            output,
            action,
            side_effect: Arc::new(side_effect),
            launcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &SharedLine {
        &self.input
    }

    pub fn debounce(&self) -> Debounce {
        self.debounce
    }

    pub fn presses(&self) -> u64 {
        self.presses.load(Ordering::Acquire)
    }

    pub fn irq(&self) -> Option<IrqHandle> {
        *self.irq.lock()
    }

    pub(crate) fn attach(&self, handle: IrqHandle) {
        *self.irq.lock() = Some(handle);
    }

    pub(crate) fn detach(&self) -> Option<IrqHandle> {
        self.irq.lock().take()
    }

    /// Builds the callback handed to the platform for this binding.
    pub fn handler<B: GpioBackend + 'static>(
        self: &Arc<Self>,
        registry: Arc<LineRegistry<B>>,
    ) -> EdgeHandler {
        let binding = Arc::clone(self);
        Arc::new(move || binding.on_rising_edge(&*registry))
    }

    /// Runs the three edge effects in order: output level, counter, side
    /// effect. A failing step is logged and the remaining steps still run.
    pub fn on_rising_edge<B: GpioBackend>(&self, registry: &LineRegistry<B>) -> HandledResult {
        let mut failures = Vec::new();

        if let Err(e) = registry.set_level(&self.output, self.action.level()) {
            failures.push(format!("output: {e}"));
        }

        let presses = self.presses.fetch_add(1, Ordering::AcqRel) + 1;

        if let Err(e) = self.launcher.launch(&self.name, &self.side_effect) {
            failures.push(e.to_string());
        }

        match registry.level(&self.input) {
            Ok(level) => info!(
                "edge on {} (line {}), input level {}, presses {presses}",
                self.name,
                self.input.lock().id(),
                u8::from(level)
            ),
            Err(e) => info!("edge on {}, input level unreadable: {e}", self.name),
        }

        if failures.is_empty() {
            HandledResult::Handled
        } else {
            let err = AppError::PartialHandling(format!("{}: {}", self.name, failures.join("; ")));
            warn!("{err}");
            HandledResult::Degraded(err)
        }
    }

    pub fn snapshot(&self) -> BindingSnapshot {
        BindingSnapshot {
            name: self.name.clone(),
            line: self.input.lock().id(),
            output_line: self.output.lock().id(),
            action: self.action,
            debounce_ms: self.debounce.as_millis(),
            presses: self.presses(),
        }
    }
}
