mod backend;
mod config;
mod debounce;
mod dispatch;
mod error;
mod gpio;
mod launcher;
mod lifecycle;
mod registry;
mod routes;

pub use config::{AppConfig, HttpConfig, InputConfig, OutputConfig};
pub use debounce::{Debounce, DebounceFilter};
pub use dispatch::{BindingSnapshot, InputBinding, OutputAction};
pub use error::AppError;
pub use gpio::{
    Direction, EdgeHandler, GpioBackend, HandledResult, IrqHandle, IrqSource, Line, LineSnapshot,
    LineToken, SharedLine,
};
pub use launcher::{LaunchStats, Launcher, LauncherWorker, ProcessSpawner, SideEffect, Spawner};
pub use lifecycle::{Controller, LifecycleState, StopReport};
pub use registry::LineRegistry;
pub use routes::AppState;

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::{MockGpioBackend, MockOp};
