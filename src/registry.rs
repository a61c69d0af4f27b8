use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::error::AppError;
use crate::gpio::{Direction, GpioBackend, Line, SharedLine};

/// Tracks which lines this process owns and mediates every platform call
/// that touches them.
pub struct LineRegistry<B: GpioBackend> {
    backend: Arc<B>,
    claimed: Mutex<FxHashSet<u32>>,
}

impl<B: GpioBackend> LineRegistry<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            claimed: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn claim(&self, id: u32, direction: Direction) -> Result<SharedLine, AppError> {
        if !self.backend.is_valid(id) {
            return Err(AppError::InvalidId(id));
        }

        let mut claimed = self.claimed.lock();
        if claimed.contains(&id) {
            return Err(AppError::AlreadyClaimed(id));
        }

        let token = self.backend.request_line(id)?;
        if let Err(e) = self.backend.set_direction(&token, direction) {
            // the line was never handed out, give it straight back
            if let Err(free_err) = self.backend.free_line(&token) {
                warn!("free line {id} after failed direction change: {free_err}");
            }
            return Err(e);
        }

        claimed.insert(id);
        debug!("claimed line {id} as {direction:?}");

        Ok(Arc::new(Mutex::new(Line::new(id, direction, token))))
    }

    pub fn set_level(&self, line: &SharedLine, level: bool) -> Result<(), AppError> {
        let mut line = line.lock();
        if line.direction() != Direction::Output {
            return Err(AppError::InvalidState(format!(
                "line {} is not an output",
                line.id()
            )));
        }
        self.backend.set_level(line.token()?, level)?;
        line.set_cached_level(level);
        Ok(())
    }

    /// Reads the live level from the platform and refreshes the cached one.
    pub fn level(&self, line: &SharedLine) -> Result<bool, AppError> {
        let mut line = line.lock();
        let level = self.backend.get_level(line.token()?)?;
        line.set_cached_level(level);
        Ok(level)
    }

    pub fn export(&self, line: &SharedLine, lock_direction: bool) -> Result<(), AppError> {
        let mut line = line.lock();
        if line.is_exported() {
            return Err(AppError::InvalidState(format!(
                "line {} already exported",
                line.id()
            )));
        }
        self.backend.export(line.token()?, lock_direction)?;
        line.set_exported(true, lock_direction);
        Ok(())
    }

    pub fn unexport(&self, line: &SharedLine) -> Result<(), AppError> {
        let mut line = line.lock();
        if !line.is_exported() {
            return Ok(());
        }
        self.backend.unexport(line.token()?)?;
        line.set_exported(false, false);
        Ok(())
    }

    /// Hands the line back to the platform. If the platform refuses, the
    /// line stays claimed and release can be retried.
    pub fn release(&self, line: &SharedLine) -> Result<(), AppError> {
        let mut line = line.lock();
        if line.is_exported() {
            return Err(AppError::InvalidState(format!(
                "line {} must be unexported before release",
                line.id()
            )));
        }
        let id = line.id();
        self.backend.free_line(line.token()?)?;
        line.take_token();
        self.claimed.lock().remove(&id);
        debug!("released line {id}");
        Ok(())
    }

    pub fn is_claimed(&self, id: u32) -> bool {
        self.claimed.lock().contains(&id)
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockGpioBackend;
    use crate::debounce::Debounce;
    use crate::gpio::HandledResult;

    fn registry() -> (Arc<MockGpioBackend>, LineRegistry<MockGpioBackend>) {
        let backend = Arc::new(MockGpioBackend::new(32));
        (backend.clone(), LineRegistry::new(backend))
    }

    #[test]
    fn invalid_id_claims_nothing() {
        let (backend, registry) = registry();
        let err = registry.claim(99, Direction::Input).unwrap_err();
        assert!(matches!(err, AppError::InvalidId(99)));
        assert_eq!(registry.claimed_count(), 0);
        assert!(backend.claimed_lines().unwrap().is_empty());
    }

    #[test]
    fn second_claim_of_same_id_fails() {
        let (_backend, registry) = registry();
        let _line = registry.claim(4, Direction::Output).unwrap();
        let err = registry.claim(4, Direction::Input).unwrap_err();
        assert!(matches!(err, AppError::AlreadyClaimed(4)));
        assert_eq!(registry.claimed_count(), 1);
    }

    #[test]
    fn set_level_requires_output() {
        let (backend, registry) = registry();
        let input = registry.claim(3, Direction::Input).unwrap();
        assert!(matches!(
            registry.set_level(&input, true),
            Err(AppError::InvalidState(_))
        ));

        let output = registry.claim(5, Direction::Output).unwrap();
        registry.set_level(&output, true).unwrap();
        assert!(output.lock().level());
        assert_eq!(backend.level(5).unwrap(), Some(true));
    }

    #[test]
    fn release_requires_unexport_first() {
        let (backend, registry) = registry();
        let line = registry.claim(7, Direction::Output).unwrap();
        registry.export(&line, true).unwrap();
        assert!(backend.is_exported(7).unwrap());
        assert!(line.lock().snapshot().direction_locked);

        assert!(matches!(
            registry.release(&line),
            Err(AppError::InvalidState(_))
        ));

        registry.unexport(&line).unwrap();
        registry.release(&line).unwrap();
        assert!(!registry.is_claimed(7));
        assert!(!line.lock().is_claimed());
        assert!(backend.claimed_lines().unwrap().is_empty());

        // a released line cannot be released again
        assert!(matches!(
            registry.release(&line),
            Err(AppError::InvalidState(_))
        ));
    }

    #[test]
    fn released_id_can_be_claimed_again() {
        let (_backend, registry) = registry();
        let line = registry.claim(2, Direction::Input).unwrap();
        registry.release(&line).unwrap();
        assert!(registry.claim(2, Direction::Input).is_ok());
    }

    #[test]
    fn refused_release_keeps_the_line_claimed() {
        let (backend, registry) = registry();
        let line = registry.claim(5, Direction::Input).unwrap();
        let source = backend
            .interrupt_source(line.lock().token().unwrap())
            .unwrap();
        let handle = backend
            .bind_rising_edge(source, Arc::new(|| HandledResult::Handled), Debounce::default())
            .unwrap();

        assert!(matches!(
            registry.release(&line),
            Err(AppError::InvalidState(_))
        ));
        assert!(registry.is_claimed(5));
        assert!(line.lock().is_claimed());
        assert_eq!(backend.claimed_lines().unwrap(), vec![5]);

        backend.unbind(handle).unwrap();
        registry.release(&line).unwrap();
        assert!(!registry.is_claimed(5));
        assert!(backend.claimed_lines().unwrap().is_empty());
    }
}
