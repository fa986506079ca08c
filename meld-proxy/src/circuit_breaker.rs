use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-upstream failure gate.
///
/// Closed passes everything through and counts consecutive failures.
/// Open fails fast until `reset_timeout` has elapsed since the last
/// failure, then grants a single half-open trial. The trial's outcome
/// decides between Closed and another Open window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    failures: u32,
    last_failure_at: Option<Instant>,
    half_open_trial: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: 0,
                last_failure_at: None,
                half_open_trial: false,
            }),
        }
    }

    /// Whether an attempt may proceed right now.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock");

        match inner.state {
            State::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);

                if elapsed >= self.reset_timeout {
                    inner.state = State::HalfOpen;
                    inner.half_open_trial = false;
                    return true;
                }

                false
            }
            State::HalfOpen => {
                if !inner.half_open_trial {
                    inner.half_open_trial = true;
                    return true;
                }

                false
            }
            State::Closed => true,
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");

        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            State::HalfOpen => {
                inner.state = State::Open;
                inner.failures = self.threshold;
            }
            State::Closed => {
                inner.failures += 1;

                if inner.failures >= self.threshold {
                    inner.state = State::Open;
                }
            }
            State::Open => {}
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");

        match inner.state {
            State::HalfOpen => {
                inner.state = State::Closed;
                inner.failures = 0;
            }
            State::Closed => {
                inner.failures = 0;
            }
            State::Open => {}
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().expect("breaker lock").state
    }
}
