use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::debounce::Debounce;
use crate::error::AppError;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

/// Proof that a line was requested from the platform. Not `Clone`: exactly one
/// owner may free it. Only backends mint tokens.
#[derive(Debug, PartialEq, Eq)]
pub struct LineToken {
    line: u32,
    serial: u64,
}

impl LineToken {
    pub(crate) fn new(line: u32, serial: u64) -> Self {
        Self { line, serial }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

/// Platform interrupt number a line is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IrqSource(pub u32);

impl fmt::Display for IrqSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by a successful interrupt binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IrqHandle(pub u64);

impl fmt::Display for IrqHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of one handler invocation. There is no "unhandled" outcome: every
/// bound line is exclusively owned, so a delivered edge is always ours.
#[derive(Debug)]
pub enum HandledResult {
    Handled,
    Degraded(AppError),
}

impl HandledResult {
    pub fn is_handled(&self) -> bool {
        true
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HandledResult::Degraded(_))
    }
}

/// Callback bound to one input line. The platform never runs the same
/// handler concurrently with itself.
pub type EdgeHandler = Arc<dyn Fn() -> HandledResult + Send + Sync>;

#[derive(Debug)]
pub struct Line {
    id: u32,
    direction: Direction,
    level: bool,
    exported: bool,
    direction_locked: bool,
    token: Option<LineToken>,
}

/// Lines may be driven from several handler contexts; the mutex is the
/// single-writer region for the line's level.
pub type SharedLine = Arc<Mutex<Line>>;

impl Line {
    pub(crate) fn new(id: u32, direction: Direction, token: LineToken) -> Self {
        Self {
            id,
            direction,
            level: false,
            exported: false,
            direction_locked: false,
            token: Some(token),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Last level written to (outputs) or read from (inputs) the platform.
    pub fn level(&self) -> bool {
        self.level
    }

    pub fn is_exported(&self) -> bool {
        self.exported
    }

    pub fn is_claimed(&self) -> bool {
        self.token.is_some()
    }

    pub(crate) fn token(&self) -> Result<&LineToken, AppError> {
        self.token
            .as_ref()
            .ok_or_else(|| AppError::InvalidState(format!("line {} already released", self.id)))
    }

    pub(crate) fn take_token(&mut self) -> Option<LineToken> {
        self.token.take()
    }

    pub(crate) fn set_cached_level(&mut self, level: bool) {
        self.level = level;
    }

    pub(crate) fn set_exported(&mut self, exported: bool, direction_locked: bool) {
        self.exported = exported;
        self.direction_locked = direction_locked;
    }

    pub fn snapshot(&self) -> LineSnapshot {
        LineSnapshot {
            line: self.id,
            direction: self.direction,
            level: self.level,
            exported: self.exported,
            direction_locked: self.direction_locked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineSnapshot {
    pub line: u32,
    pub direction: Direction,
    pub level: bool,
    pub exported: bool,
    pub direction_locked: bool,
}

/// Platform line and interrupt services.
pub trait GpioBackend: Send + Sync {
    fn is_valid(&self, line: u32) -> bool;
    fn request_line(&self, line: u32) -> Result<LineToken, AppError>;
    fn set_direction(&self, token: &LineToken, direction: Direction) -> Result<(), AppError>;
    fn set_level(&self, token: &LineToken, level: bool) -> Result<(), AppError>;
    fn get_level(&self, token: &LineToken) -> Result<bool, AppError>;
    fn export(&self, token: &LineToken, lock_direction: bool) -> Result<(), AppError>;
    fn unexport(&self, token: &LineToken) -> Result<(), AppError>;
    /// On failure the line stays requested and the token stays valid.
    fn free_line(&self, token: &LineToken) -> Result<(), AppError>;
    fn interrupt_source(&self, token: &LineToken) -> Result<IrqSource, AppError>;
    fn bind_rising_edge(
        &self,
        source: IrqSource,
        handler: EdgeHandler,
        debounce: Debounce,
    ) -> Result<IrqHandle, AppError>;
    /// Returns once the handler can no longer be invoked.
    fn unbind(&self, handle: IrqHandle) -> Result<(), AppError>;
}
