use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock};
use rustc_hash::FxHashMap;

use crate::debounce::Debounce;
use crate::error::AppError;
use crate::gpio::{Direction, EdgeHandler, GpioBackend, IrqHandle, IrqSource, LineToken};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

/// Linux GPIO character device platform.
///
/// Every claimed line owns its own kernel request. Bound inputs get a
/// listener thread, so one line's handler never overlaps itself while
/// different lines run in parallel. Debounce is applied by the kernel.
pub struct LibgpiodBackend {
    chip: String,
    num_lines: u32,
    lines: RwLock<FxHashMap<u32, LineHandle>>, // keyed by line offset
    next_serial: AtomicU64,
}

struct LineHandle {
    serial: u64,
    direction: Direction,
    exported: bool,
    direction_locked: bool,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    irq: Option<IrqHandle>,
    listener: Option<EdgeListener>,
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))
    }
}

fn open_chip(path: &str) -> Result<Chip, AppError> {
    let p = PathBuf::from(path);
    Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        line: u32,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        handler: EdgeHandler,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;

        let handle = std::thread::Builder::new()
            .name(format!("edge-{line}"))
            .spawn(move || {
                while !cancel_flag.load(Ordering::Relaxed) {
                    // the request lock must be released before the handler
                    // runs, it reads this very line
                    let rising = {
                        let hdl = gpiod_handle.lock();
                        let req = &hdl.request;

                        match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                            Ok(false) => continue,
                            Ok(true) => match req.read_edge_events(&mut buffer) {
                                Ok(events) => Ok(events
                                    .filter_map(Result::ok)
                                    .filter(|evt| {
                                        matches!(evt.event_type(), Ok(line::EdgeKind::Rising))
                                    })
                                    .count()),
                                Err(e) => Err(format!("read edge events error for line {line}: {e}")),
                            },
                            Err(e) => Err(format!("wait edge events error for line {line}: {e}")),
                        }
                    };

                    match rising {
                        Ok(count) => {
                            for _ in 0..count {
                                handler();
                            }
                        }
                        Err(msg) => {
                            warn!("{msg}");
                            yield_now();
                        }
                    }
                }
            })
            .map_err(|e| AppError::Gpio(format!("spawn listener for line {line}: {e}")))?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    pub fn new(chip: &str) -> Result<Self, AppError> {
        let info = open_chip(chip)?
            .info()
            .map_err(|e| AppError::Gpio(format!("chip info {chip}: {e}")))?;
        let num_lines = u32::try_from(info.num_lines())
            .map_err(|_| AppError::Gpio(format!("chip {chip} reports too many lines")))?;
        debug!("opened {chip} with {num_lines} lines");

        Ok(Self {
            chip: chip.to_string(),
            num_lines,
            lines: RwLock::new(FxHashMap::default()),
            next_serial: AtomicU64::new(1),
        })
    }

    fn make_line_settings(
        direction: Direction,
        debounce: Option<Debounce>,
    ) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;

        match direction {
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
                ls.set_output_value(line::Value::InActive)
                    .map_err(|e| AppError::Gpio(format!("set output value: {e}")))?;
            }
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
            }
        }

        if let Some(debounce) = debounce {
            ls.set_edge_detection(Some(line::Edge::Rising))
                .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
            ls.set_event_clock(EventClock::Monotonic)
                .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
            ls.set_debounce_period(debounce.interval());
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn reconfigure(
        gpiod_handle: &FairMutex<GpiodHandle>,
        offset: u32,
        direction: Direction,
        debounce: Option<Debounce>,
    ) -> Result<(), AppError> {
        let line_settings = Self::make_line_settings(direction, debounce)?;
        let line_cfg = Self::make_line_config(offset, line_settings)?;
        gpiod_handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| AppError::Gpio(format!("reconfigure lines: {e}")))
    }

    fn gpiod_handle(&self, token: &LineToken) -> Result<Arc<FairMutex<GpiodHandle>>, AppError> {
        let lines = self.lines.read();
        match lines.get(&token.line()) {
            Some(handle) if handle.serial == token.serial() => Ok(handle.gpiod_handle.clone()),
            _ => Err(stale(token)),
        }
    }
}

fn stale(token: &LineToken) -> AppError {
    AppError::InvalidState(format!("stale token for line {}", token.line()))
}

impl GpioBackend for LibgpiodBackend {
    fn is_valid(&self, line: u32) -> bool {
        line < self.num_lines
    }

    fn request_line(&self, line: u32) -> Result<LineToken, AppError> {
        if !self.is_valid(line) {
            return Err(AppError::InvalidId(line));
        }

        let mut lines = self.lines.write();
        if lines.contains_key(&line) {
            return Err(AppError::AlreadyClaimed(line));
        }

        let chip = open_chip(&self.chip)?;
        let info = chip
            .line_info(line)
            .map_err(|e| AppError::Gpio(format!("line info {line}: {e}")))?;
        if info.is_used() {
            return Err(AppError::AlreadyClaimed(line));
        }

        let line_settings = Self::make_line_settings(Direction::Input, None)?;
        let line_cfg = Self::make_line_config(line, line_settings)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&self.chip, &line_cfg)?));

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        lines.insert(
            line,
            LineHandle {
                serial,
                direction: Direction::Input,
                exported: false,
                direction_locked: false,
                gpiod_handle,
                irq: None,
                listener: None,
            },
        );

        Ok(LineToken::new(line, serial))
    }

    fn set_direction(&self, token: &LineToken, direction: Direction) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        let handle = lines
            .get_mut(&token.line())
            .filter(|h| h.serial == token.serial())
            .ok_or_else(|| stale(token))?;

        if handle.direction_locked && handle.direction != direction {
            return Err(AppError::InvalidState(format!(
                "direction of line {} is locked",
                token.line()
            )));
        }
        if handle.listener.is_some() {
            return Err(AppError::InvalidState(format!(
                "line {} has a bound interrupt",
                token.line()
            )));
        }

        Self::reconfigure(&handle.gpiod_handle, token.line(), direction, None)?;
        handle.direction = direction;
        Ok(())
    }

    fn set_level(&self, token: &LineToken, level: bool) -> Result<(), AppError> {
        let gpiod_handle = {
            let lines = self.lines.read();
            let handle = lines
                .get(&token.line())
                .filter(|h| h.serial == token.serial())
                .ok_or_else(|| stale(token))?;
            if handle.direction != Direction::Output {
                return Err(AppError::InvalidState(
                    "line must be in output mode to set level".into(),
                ));
            }
            handle.gpiod_handle.clone()
        };

        gpiod_handle
            .lock()
            .request
            .set_value(
                token.line(),
                if level {
                    line::Value::Active
                } else {
                    line::Value::InActive
                },
            )
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn get_level(&self, token: &LineToken) -> Result<bool, AppError> {
        let value = self
            .gpiod_handle(token)?
            .lock()
            .request
            .value(token.line())
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(matches!(value, line::Value::Active))
    }

    fn export(&self, token: &LineToken, lock_direction: bool) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        let handle = lines
            .get_mut(&token.line())
            .filter(|h| h.serial == token.serial())
            .ok_or_else(|| stale(token))?;
        handle.exported = true;
        handle.direction_locked = lock_direction;
        Ok(())
    }

    fn unexport(&self, token: &LineToken) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        let handle = lines
            .get_mut(&token.line())
            .filter(|h| h.serial == token.serial())
            .ok_or_else(|| stale(token))?;
        handle.exported = false;
        handle.direction_locked = false;
        Ok(())
    }

    fn free_line(&self, token: &LineToken) -> Result<(), AppError> {
        let mut lines = self.lines.write();
        match lines.get(&token.line()) {
            Some(handle) if handle.serial == token.serial() => {
                if handle.listener.is_some() {
                    return Err(AppError::InvalidState(format!(
                        "line {} still has a bound interrupt",
                        token.line()
                    )));
                }
            }
            _ => return Err(stale(token)),
        }
        // dropping the request hands the line back to the kernel
        lines.remove(&token.line());
        Ok(())
    }

    fn interrupt_source(&self, token: &LineToken) -> Result<IrqSource, AppError> {
        self.gpiod_handle(token)?;
        Ok(IrqSource(token.line()))
    }

    fn bind_rising_edge(
        &self,
        source: IrqSource,
        handler: EdgeHandler,
        debounce: Debounce,
    ) -> Result<IrqHandle, AppError> {
        let line = source.0;
        let bind_failure = |reason: String| AppError::BindFailure { line, reason };

        let mut lines = self.lines.write();
        let handle = lines
            .get_mut(&line)
            .ok_or_else(|| bind_failure("line not requested".into()))?;
        if handle.direction != Direction::Input {
            return Err(bind_failure("line is not an input".into()));
        }
        if handle.listener.is_some() {
            return Err(bind_failure("interrupt already bound".into()));
        }

        Self::reconfigure(&handle.gpiod_handle, line, Direction::Input, Some(debounce))
            .map_err(|e| bind_failure(e.to_string()))?;
        let listener = EdgeListener::new(line, handle.gpiod_handle.clone(), handler)
            .map_err(|e| bind_failure(e.to_string()))?;

        let irq = IrqHandle(self.next_serial.fetch_add(1, Ordering::Relaxed));
        handle.listener = Some(listener);
        handle.irq = Some(irq);
        Ok(irq)
    }

    fn unbind(&self, irq: IrqHandle) -> Result<(), AppError> {
        let (line, listener, gpiod_handle) = {
            let mut lines = self.lines.write();
            let (line, handle) = lines
                .iter_mut()
                .find(|(_, h)| h.irq == Some(irq))
                .ok_or_else(|| AppError::InvalidState(format!("unknown interrupt {irq}")))?;
            handle.irq = None;
            (*line, handle.listener.take(), handle.gpiod_handle.clone())
        };

        // joining outside the map lock: a running handler may still need it
        drop(listener);
        Self::reconfigure(&gpiod_handle, line, Direction::Input, None)
    }
}
