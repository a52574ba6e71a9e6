//! Crate-level error surface.
//!
//! Each subsystem carries its own `thiserror` enum; at the endpoint boundary
//! (tunnel start/stop, CRL service, rotation loop) those are wrapped into an
//! [`Error`] that names its [`ErrorKind`] and the component/operation that
//! produced it, so operator-facing diagnostics always carry structured
//! context.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
	/// Missing field, out-of-range value, unreadable file.
	Configuration,
	/// Adapter busy, port in use, permission denied, memory reservation denied.
	Resource,
	/// Dial failure, accept failure, socket reset, TLS handshake failure.
	Network,
	/// Certificate expired/not-yet-valid/revoked, chain or CRL failure.
	Security,
	/// Invalid lifecycle transition, already running, already stopped.
	State,
	/// Unrecoverable: adapter dead after cleanup timeout, rotator without a
	/// current certificate.
	Fatal,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ErrorKind::Configuration => "configuration",
			ErrorKind::Resource => "resource",
			ErrorKind::Network => "network",
			ErrorKind::Security => "security",
			ErrorKind::State => "state",
			ErrorKind::Fatal => "fatal",
		};
		f.write_str(s)
	}
}

#[derive(Debug, thiserror::Error)]
#[error("{component}: {operation}: {kind}: {cause}")]
pub struct Error {
	pub kind: ErrorKind,
	pub component: &'static str,
	pub operation: &'static str,
	#[source]
	pub cause: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
	pub fn new(
		kind: ErrorKind,
		component: &'static str,
		operation: &'static str,
		cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
	) -> Self {
		Error {
			kind,
			component,
			operation,
			cause: cause.into(),
		}
	}

	pub fn is_fatal(&self) -> bool {
		self.kind == ErrorKind::Fatal
	}

	/// One-line diagnostic for process exit paths.
	pub fn diagnostic(&self) -> String {
		format!(
			"{} failed during {} ({}): {}",
			self.component, self.operation, self.kind, self.cause
		)
	}
}
