use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::debounce::{Debounce, DebounceFilter};
use crate::error::AppError;
use crate::gpio::{
    Direction, EdgeHandler, GpioBackend, HandledResult, IrqHandle, IrqSource, LineToken,
};

const MOCK_IRQ_BASE: u32 = 160;
const MOCK_DEFAULT_LINES: u32 = 64;

/// Platform calls as the mock saw them, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Request(u32),
    Export(u32),
    Bind(u32),
    Unbind(u32),
    Unexport(u32),
    Free(u32),
}

/// In-memory platform: lines, interrupts with debounce and masking, and a
/// manually advanced clock.
pub struct MockGpioBackend {
    num_lines: u32,
    lines: Mutex<HashMap<u32, MockLineState>>, // keyed by line id
    irqs: Mutex<HashMap<u32, MockIrq>>,       // keyed by line id
    failing_binds: Mutex<HashSet<u32>>,
    failing_unbinds: Mutex<HashSet<u32>>,
    clock: Mutex<Duration>,
    ops: Mutex<Vec<MockOp>>,
    released: Mutex<HashMap<u32, bool>>, // level each line had when freed
    next_serial: AtomicU64,
}

struct MockLineState {
    serial: u64,
    direction: Direction,
    level: bool,
    exported: bool,
    direction_locked: bool,
}

struct MockIrq {
    handle: IrqHandle,
    handler: EdgeHandler,
    filter: DebounceFilter,
    // held while the handler runs, like a masked interrupt line
    mask: Arc<Mutex<()>>,
}

impl Default for MockGpioBackend {
    fn default() -> Self {
        Self::new(MOCK_DEFAULT_LINES)
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> AppError {
    AppError::Gpio(format!("lock poisoned: {e}"))
}

impl MockGpioBackend {
    /// Lines `0..num_lines` are valid.
    pub fn new(num_lines: u32) -> Self {
        Self {
            num_lines,
            lines: Mutex::new(HashMap::new()),
            irqs: Mutex::new(HashMap::new()),
            failing_binds: Mutex::new(HashSet::new()),
            failing_unbinds: Mutex::new(HashSet::new()),
            clock: Mutex::new(Duration::ZERO),
            ops: Mutex::new(Vec::new()),
            released: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Makes the next interrupt binding on `line` fail.
    pub fn fail_bind_on(&self, line: u32) -> Result<(), AppError> {
        self.failing_binds.lock().map_err(poisoned)?.insert(line);
        Ok(())
    }

    /// Makes the next unbind of `line` fail and leave the handler bound.
    pub fn fail_unbind_on(&self, line: u32) -> Result<(), AppError> {
        self.failing_unbinds.lock().map_err(poisoned)?.insert(line);
        Ok(())
    }

    pub fn advance(&self, by: Duration) -> Result<(), AppError> {
        *self.clock.lock().map_err(poisoned)? += by;
        Ok(())
    }

    /// Drives an input line to `level`. Returns the handler result when a
    /// rising edge made it through debounce to a bound handler.
    pub fn drive_input(&self, line: u32, level: bool) -> Result<Option<HandledResult>, AppError> {
        let (handler, mask) = {
            let mut lines = self.lines.lock().map_err(poisoned)?;
            let state = lines
                .get_mut(&line)
                .ok_or_else(|| AppError::InvalidState(format!("line {line} not requested")))?;
            if state.direction != Direction::Input {
                return Err(AppError::InvalidState(format!(
                    "line {line} is not an input"
                )));
            }

            let rising = !state.level && level;
            state.level = level;
            if !rising {
                return Ok(None);
            }

            let now = *self.clock.lock().map_err(poisoned)?;
            let mut irqs = self.irqs.lock().map_err(poisoned)?;
            let Some(irq) = irqs.get_mut(&line) else {
                return Ok(None);
            };
            if !irq.filter.admit(now) {
                return Ok(None);
            }
            (irq.handler.clone(), irq.mask.clone())
        };

        let _masked = mask.lock().map_err(poisoned)?;
        Ok(Some(handler()))
    }

    /// Full press: rising then falling edge.
    pub fn press(&self, line: u32) -> Result<Option<HandledResult>, AppError> {
        let result = self.drive_input(line, true)?;
        self.drive_input(line, false)?;
        Ok(result)
    }

    pub fn level(&self, line: u32) -> Result<Option<bool>, AppError> {
        let lines = self.lines.lock().map_err(poisoned)?;
        Ok(lines.get(&line).map(|l| l.level))
    }

    pub fn released_level(&self, line: u32) -> Result<Option<bool>, AppError> {
        Ok(self.released.lock().map_err(poisoned)?.get(&line).copied())
    }

    pub fn is_exported(&self, line: u32) -> Result<bool, AppError> {
        let lines = self.lines.lock().map_err(poisoned)?;
        Ok(lines.get(&line).map(|l| l.exported).unwrap_or(false))
    }

    pub fn claimed_lines(&self) -> Result<Vec<u32>, AppError> {
        let lines = self.lines.lock().map_err(poisoned)?;
        let mut ids: Vec<u32> = lines.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn bound_lines(&self) -> Result<Vec<u32>, AppError> {
        let irqs = self.irqs.lock().map_err(poisoned)?;
        let mut ids: Vec<u32> = irqs.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn ops(&self) -> Result<Vec<MockOp>, AppError> {
        Ok(self.ops.lock().map_err(poisoned)?.clone())
    }

    fn record(&self, op: MockOp) -> Result<(), AppError> {
        self.ops.lock().map_err(poisoned)?.push(op);
        Ok(())
    }

    fn with_line<T>(
        &self,
        token: &LineToken,
        f: impl FnOnce(&mut MockLineState) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut lines = self.lines.lock().map_err(poisoned)?;
        match lines.get_mut(&token.line()) {
            Some(state) if state.serial == token.serial() => f(state),
            _ => Err(AppError::InvalidState(format!(
                "stale token for line {}",
                token.line()
            ))),
        }
    }
}

impl GpioBackend for MockGpioBackend {
    fn is_valid(&self, line: u32) -> bool {
        line < self.num_lines
    }

    fn request_line(&self, line: u32) -> Result<LineToken, AppError> {
        if !self.is_valid(line) {
            return Err(AppError::InvalidId(line));
        }
        let mut lines = self.lines.lock().map_err(poisoned)?;
        if lines.contains_key(&line) {
            return Err(AppError::AlreadyClaimed(line));
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        lines.insert(
            line,
            MockLineState {
                serial,
                direction: Direction::Input,
                level: false,
                exported: false,
                direction_locked: false,
            },
        );
        drop(lines);
        self.record(MockOp::Request(line))?;

        Ok(LineToken::new(line, serial))
    }

    fn set_direction(&self, token: &LineToken, direction: Direction) -> Result<(), AppError> {
        self.with_line(token, |state| {
            if state.direction_locked && state.direction != direction {
                return Err(AppError::InvalidState(format!(
                    "direction of line {} is locked",
                    token.line()
                )));
            }
            state.direction = direction;
            if direction == Direction::Output {
                state.level = false;
            }
            Ok(())
        })
    }

    fn set_level(&self, token: &LineToken, level: bool) -> Result<(), AppError> {
        self.with_line(token, |state| {
            if state.direction != Direction::Output {
                return Err(AppError::InvalidState(
                    "line must be in output mode to set level".into(),
                ));
            }
            state.level = level;
            Ok(())
        })
    }

    fn get_level(&self, token: &LineToken) -> Result<bool, AppError> {
        self.with_line(token, |state| Ok(state.level))
    }

    fn export(&self, token: &LineToken, lock_direction: bool) -> Result<(), AppError> {
        self.with_line(token, |state| {
            state.exported = true;
            state.direction_locked = lock_direction;
            Ok(())
        })?;
        self.record(MockOp::Export(token.line()))
    }

    fn unexport(&self, token: &LineToken) -> Result<(), AppError> {
        self.with_line(token, |state| {
            state.exported = false;
            state.direction_locked = false;
            Ok(())
        })?;
        self.record(MockOp::Unexport(token.line()))
    }

    fn free_line(&self, token: &LineToken) -> Result<(), AppError> {
        let line = token.line();
        if self.irqs.lock().map_err(poisoned)?.contains_key(&line) {
            return Err(AppError::InvalidState(format!(
                "line {line} still has a bound interrupt"
            )));
        }
        let level = self.with_line(token, |state| Ok(state.level))?;
        self.lines.lock().map_err(poisoned)?.remove(&line);
        self.released.lock().map_err(poisoned)?.insert(line, level);
        self.record(MockOp::Free(line))
    }

    fn interrupt_source(&self, token: &LineToken) -> Result<IrqSource, AppError> {
        self.with_line(token, |_| Ok(IrqSource(MOCK_IRQ_BASE + token.line())))
    }

    fn bind_rising_edge(
        &self,
        source: IrqSource,
        handler: EdgeHandler,
        debounce: Debounce,
    ) -> Result<IrqHandle, AppError> {
        let line = source.0.checked_sub(MOCK_IRQ_BASE).ok_or_else(|| {
            AppError::BindFailure {
                line: source.0,
                reason: "unknown interrupt source".into(),
            }
        })?;

        if self.failing_binds.lock().map_err(poisoned)?.remove(&line) {
            return Err(AppError::BindFailure {
                line,
                reason: "injected failure".into(),
            });
        }
        if !self.lines.lock().map_err(poisoned)?.contains_key(&line) {
            return Err(AppError::BindFailure {
                line,
                reason: "line not requested".into(),
            });
        }

        let mut irqs = self.irqs.lock().map_err(poisoned)?;
        if irqs.contains_key(&line) {
            return Err(AppError::BindFailure {
                line,
                reason: "interrupt already bound".into(),
            });
        }
        let handle = IrqHandle(self.next_serial.fetch_add(1, Ordering::Relaxed));
        irqs.insert(
            line,
            MockIrq {
                handle,
                handler,
                filter: DebounceFilter::new(debounce),
                mask: Arc::new(Mutex::new(())),
            },
        );
        drop(irqs);
        self.record(MockOp::Bind(line))?;

        Ok(handle)
    }

    fn unbind(&self, handle: IrqHandle) -> Result<(), AppError> {
        let removed = {
            let mut irqs = self.irqs.lock().map_err(poisoned)?;
            let line = irqs
                .iter()
                .find(|(_, irq)| irq.handle == handle)
                .map(|(line, _)| *line)
                .ok_or_else(|| AppError::InvalidState(format!("unknown interrupt {handle}")))?;
            if self.failing_unbinds.lock().map_err(poisoned)?.remove(&line) {
                return Err(AppError::Gpio(format!(
                    "injected unbind failure on line {line}"
                )));
            }
            irqs.remove(&line).map(|irq| (line, irq))
        };

        if let Some((line, irq)) = removed {
            // wait out a handler that is still running
            let _masked = irq.mask.lock().map_err(poisoned)?;
            self.record(MockOp::Unbind(line))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler() -> (Arc<AtomicUsize>, EdgeHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handler: EdgeHandler = Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            HandledResult::Handled
        });
        (count, handler)
    }

    #[test]
    fn only_rising_edges_outside_debounce_are_delivered() {
        let backend = MockGpioBackend::new(8);
        let token = backend.request_line(3).unwrap();
        let source = backend.interrupt_source(&token).unwrap();
        let (count, handler) = counting_handler();
        backend
            .bind_rising_edge(source, handler, Debounce::from_millis(50))
            .unwrap();

        assert!(backend.press(3).unwrap().is_some());
        backend.advance(Duration::from_millis(10)).unwrap();
        assert!(backend.press(3).unwrap().is_none());
        backend.advance(Duration::from_millis(40)).unwrap();
        assert!(backend.press(3).unwrap().is_some());
        // falling edge alone delivers nothing
        assert!(backend.drive_input(3, false).unwrap().is_none());

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn free_refuses_while_bound() {
        let backend = MockGpioBackend::new(8);
        let token = backend.request_line(1).unwrap();
        let source = backend.interrupt_source(&token).unwrap();
        let (_count, handler) = counting_handler();
        let handle = backend
            .bind_rising_edge(source, handler, Debounce::default())
            .unwrap();

        let err = backend.free_line(&token).unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(backend.claimed_lines().unwrap(), vec![1]);

        backend.unbind(handle).unwrap();
        backend.free_line(&token).unwrap();
        assert!(backend.claimed_lines().unwrap().is_empty());
        assert_eq!(
            backend.ops().unwrap(),
            vec![
                MockOp::Request(1),
                MockOp::Bind(1),
                MockOp::Unbind(1),
                MockOp::Free(1)
            ]
        );
    }

    #[test]
    fn injected_bind_failure_fires_once() {
        let backend = MockGpioBackend::new(8);
        let token = backend.request_line(2).unwrap();
        let source = backend.interrupt_source(&token).unwrap();
        backend.fail_bind_on(2).unwrap();

        let (_count, handler) = counting_handler();
        assert!(matches!(
            backend.bind_rising_edge(source, handler.clone(), Debounce::default()),
            Err(AppError::BindFailure { line: 2, .. })
        ));
        assert!(backend
            .bind_rising_edge(source, handler, Debounce::default())
            .is_ok());
    }

    #[test]
    fn out_of_range_line_is_invalid() {
        let backend = MockGpioBackend::new(8);
        assert!(!backend.is_valid(8));
        assert!(matches!(backend.request_line(8), Err(AppError::InvalidId(8))));
    }
}
