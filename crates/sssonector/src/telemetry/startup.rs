//! Phased, structured lifecycle logging.
//!
//! Every Start/Stop step of a tunnel endpoint flows through
//! [`StartupLogger::log_operation`], which records the phase, component,
//! operation, duration and outcome as structured tracing fields. This is the
//! single source of lifecycle observability; endpoints must not log lifecycle
//! steps ad hoc.

use std::fmt;
use std::future::Future;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
	PreStartup,
	Initialization,
	Connection,
	Ready,
	Shutdown,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Phase::PreStartup => "pre_startup",
			Phase::Initialization => "initialization",
			Phase::Connection => "connection",
			Phase::Ready => "ready",
			Phase::Shutdown => "shutdown",
		};
		f.write_str(s)
	}
}

pub struct StartupLogger {
	component: &'static str,
	phase: Mutex<Phase>,
}

impl StartupLogger {
	pub fn new(component: &'static str) -> StartupLogger {
		StartupLogger {
			component,
			phase: Mutex::new(Phase::PreStartup),
		}
	}

	pub fn phase(&self) -> Phase {
		*self.phase.lock()
	}

	pub fn enter_phase(&self, phase: Phase) {
		let mut current = self.phase.lock();
		if *current != phase {
			info!(component = self.component, phase = %phase, "phase transition");
			*current = phase;
		}
	}

	/// Run `op`, recording duration and outcome under the current phase, and
	/// pass its result through.
	pub async fn log_operation<T, E, F>(&self, operation: &'static str, op: F) -> Result<T, E>
	where
		F: Future<Output = Result<T, E>>,
		E: fmt::Display,
	{
		let phase = self.phase();
		let start = Instant::now();
		let result = op.await;
		let elapsed = start.elapsed();
		match &result {
			Ok(_) => info!(
				component = self.component,
				phase = %phase,
				operation,
				duration_ms = elapsed.as_millis() as u64,
				result = "ok",
				"lifecycle operation"
			),
			Err(e) => error!(
				component = self.component,
				phase = %phase,
				operation,
				duration_ms = elapsed.as_millis() as u64,
				result = "error",
				error = %e,
				"lifecycle operation"
			),
		}
		result
	}

	/// Synchronous variant for non-async steps (state transitions, config
	/// checks).
	pub fn log_operation_sync<T, E, F>(&self, operation: &'static str, op: F) -> Result<T, E>
	where
		F: FnOnce() -> Result<T, E>,
		E: fmt::Display,
	{
		let phase = self.phase();
		let start = Instant::now();
		let result = op();
		let elapsed = start.elapsed();
		match &result {
			Ok(_) => info!(
				component = self.component,
				phase = %phase,
				operation,
				duration_ms = elapsed.as_millis() as u64,
				result = "ok",
				"lifecycle operation"
			),
			Err(e) => error!(
				component = self.component,
				phase = %phase,
				operation,
				duration_ms = elapsed.as_millis() as u64,
				result = "error",
				error = %e,
				"lifecycle operation"
			),
		}
		result
	}
}
