//! CRL generation and the revocation HTTP service.
//!
//! The generator scans the store for revoked records, signs a fresh CRL with
//! the CA key and caches DER and PEM forms in memory (no persistence). The
//! service exposes `GET /crl`, `POST /revoke` and `GET /status`, and
//! regenerates on a ticker once `next_update` passes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use parking_lot::RwLock;
use rcgen::{CertificateRevocationListParams, Issuer, KeyPair, RevokedCertParams, SerialNumber};
use rustls_pki_types::CertificateDer;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::manager::CertificateManager;
use super::{CertError, CertStatus, RevocationReason};
use crate::serdes::serde_rfc3339;

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Clone)]
struct CachedCrl {
	der: Vec<u8>,
	pem: String,
	this_update: OffsetDateTime,
	next_update: OffsetDateTime,
	revoked_count: usize,
}

pub struct CrlGenerator {
	manager: Arc<CertificateManager>,
	ca_serial: String,
	update_interval: Duration,
	crl_number: AtomicU64,
	cached: RwLock<Option<CachedCrl>>,
}

impl CrlGenerator {
	pub fn new(
		manager: Arc<CertificateManager>,
		ca_serial: impl Into<String>,
		update_interval: Option<Duration>,
	) -> CrlGenerator {
		CrlGenerator {
			manager,
			ca_serial: ca_serial.into(),
			update_interval: update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL),
			crl_number: AtomicU64::new(1),
			cached: RwLock::new(None),
		}
	}

	/// Scan the store and sign a fresh CRL.
	pub fn regenerate(&self) -> Result<(), CertError> {
		let now = OffsetDateTime::now_utc();
		let revoked = self.manager.store().list_by_status(CertStatus::Revoked)?;
		let revoked_certs = revoked
			.iter()
			.map(|r| {
				let serial = hex::decode(&r.serial_number)
					.map_err(|e| CertError::Parse(format!("serial {}: {e}", r.serial_number)))?;
				Ok(RevokedCertParams {
					serial_number: SerialNumber::from_slice(&serial),
					revocation_time: r.revoked_at.unwrap_or(now),
					reason_code: r.revocation_reason.map(reason_code),
					invalidity_date: None,
				})
			})
			.collect::<Result<Vec<_>, CertError>>()?;
		let count = revoked_certs.len();

		let ca = self.manager.store().load(&self.ca_serial)?;
		let key = KeyPair::try_from(ca.private_key.expose())
			.map_err(|e| CertError::Key(e.to_string()))?;
		let ca_der = CertificateDer::from(ca.record.raw.clone());
		let issuer =
			Issuer::from_ca_cert_der(&ca_der, key).map_err(|e| CertError::Issuance(e.to_string()))?;

		let next_update = now
			+ time::Duration::try_from(self.update_interval)
				.map_err(|e| CertError::Issuance(e.to_string()))?;
		let params = CertificateRevocationListParams {
			this_update: now,
			next_update,
			crl_number: SerialNumber::from_slice(
				&self.crl_number.fetch_add(1, Ordering::Relaxed).to_be_bytes(),
			),
			issuing_distribution_point: None,
			revoked_certs,
			key_identifier_method: rcgen::KeyIdMethod::Sha256,
		};
		let crl = params
			.signed_by(&issuer)
			.map_err(|e| CertError::Issuance(e.to_string()))?;
		let pem = crl.pem().map_err(|e| CertError::Issuance(e.to_string()))?;
		*self.cached.write() = Some(CachedCrl {
			der: crl.der().as_ref().to_vec(),
			pem,
			this_update: now,
			next_update,
			revoked_count: count,
		});
		info!(revoked = count, next_update = %next_update, "regenerated CRL");
		Ok(())
	}

	fn cached(&self) -> Result<CachedCrl, CertError> {
		if let Some(c) = self.cached.read().clone() {
			return Ok(c);
		}
		Err(CertError::Store("no CRL generated yet".into()))
	}

	/// Regenerate when there is no CRL yet, the window lapsed, or the store's
	/// revocation set no longer matches the cached list (revocations may land
	/// through the manager without passing the HTTP service).
	fn ensure_fresh(&self) -> Result<(), CertError> {
		let stale = match self.cached.read().as_ref() {
			None => true,
			Some(c) => {
				OffsetDateTime::now_utc() >= c.next_update
					|| self
						.manager
						.store()
						.list_by_status(CertStatus::Revoked)
						.map(|r| r.len() != c.revoked_count)
						.unwrap_or(true)
			},
		};
		if stale { self.regenerate() } else { Ok(()) }
	}

	/// Current DER form, regenerating as needed.
	pub fn der(&self) -> Result<Vec<u8>, CertError> {
		self.ensure_fresh()?;
		Ok(self.cached()?.der)
	}

	pub fn pem(&self) -> Result<String, CertError> {
		self.ensure_fresh()?;
		Ok(self.cached()?.pem)
	}

	/// Number of revoked entries on the current CRL, regenerating as needed.
	pub fn revoked_count(&self) -> Result<usize, CertError> {
		self.ensure_fresh()?;
		Ok(self.cached()?.revoked_count)
	}

	pub fn needs_refresh(&self, now: OffsetDateTime) -> bool {
		match self.cached.read().as_ref() {
			Some(c) => now >= c.next_update,
			None => true,
		}
	}
}

fn reason_code(reason: RevocationReason) -> rcgen::RevocationReason {
	match reason {
		RevocationReason::Unspecified => rcgen::RevocationReason::Unspecified,
		RevocationReason::KeyCompromise => rcgen::RevocationReason::KeyCompromise,
		RevocationReason::CaCompromise => rcgen::RevocationReason::CaCompromise,
		RevocationReason::AffiliationChanged => rcgen::RevocationReason::AffiliationChanged,
		RevocationReason::Superseded => rcgen::RevocationReason::Superseded,
		RevocationReason::CessationOfOperation => rcgen::RevocationReason::CessationOfOperation,
	}
}

#[derive(serde::Deserialize)]
struct RevokeBody {
	serial: String,
	reason: String,
	#[allow(dead_code)]
	revoked_by: Option<String>,
}

#[derive(serde::Serialize)]
struct StatusBody {
	revoked_count: usize,
	#[serde(with = "serde_rfc3339")]
	last_update: OffsetDateTime,
	#[serde(with = "serde_rfc3339")]
	next_update: OffsetDateTime,
}

#[derive(Clone)]
struct ServiceState {
	generator: Arc<CrlGenerator>,
	manager: Arc<CertificateManager>,
}

pub struct CrlService {
	state: ServiceState,
}

impl CrlService {
	pub fn new(generator: Arc<CrlGenerator>, manager: Arc<CertificateManager>) -> CrlService {
		CrlService {
			state: ServiceState { generator, manager },
		}
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/crl", get(get_crl))
			.route("/revoke", post(post_revoke))
			.route("/status", get(get_status))
			.with_state(self.state.clone())
	}

	/// Bind and serve until cancelled. The refresh ticker regenerates the
	/// CRL once `next_update` passes.
	pub async fn serve(
		self,
		addr: SocketAddr,
		cancel: CancellationToken,
	) -> Result<(), CertError> {
		let listener = tokio::net::TcpListener::bind(addr)
			.await
			.map_err(|e| CertError::Store(format!("bind {addr}: {e}")))?;
		let local = listener
			.local_addr()
			.map_err(|e| CertError::Store(e.to_string()))?;
		info!(addr = %local, "CRL service listening");

		let ticker_state = self.state.clone();
		let ticker_cancel = cancel.clone();
		let ticker = tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(60));
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = ticker_cancel.cancelled() => return,
					_ = interval.tick() => {},
				}
				if ticker_state.generator.needs_refresh(OffsetDateTime::now_utc())
					&& let Err(e) = ticker_state.generator.regenerate()
				{
					error!(error = %e, "scheduled CRL regeneration failed");
				}
			}
		});

		let result = axum::serve(listener, self.router())
			.with_graceful_shutdown(cancel.clone().cancelled_owned())
			.await
			.map_err(|e| CertError::Store(e.to_string()));
		cancel.cancel();
		let _ = ticker.await;
		result
	}
}

async fn get_crl(State(state): State<ServiceState>, headers: HeaderMap) -> Response {
	let wants_pem = headers
		.get(header::ACCEPT)
		.and_then(|v| v.to_str().ok())
		.map(|accept| accept.contains("pem"))
		.unwrap_or(false);
	let result = if wants_pem {
		state
			.generator
			.pem()
			.map(|pem| ([(header::CONTENT_TYPE, "application/x-pem-file")], pem).into_response())
	} else {
		state
			.generator
			.der()
			.map(|der| ([(header::CONTENT_TYPE, "application/pkix-crl")], der).into_response())
	};
	match result {
		Ok(resp) => resp,
		Err(e) => {
			error!(error = %e, "CRL fetch failed");
			(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
		},
	}
}

async fn post_revoke(
	State(state): State<ServiceState>,
	body: Result<axum::Json<RevokeBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
	let axum::Json(body) = match body {
		Ok(b) => b,
		Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
	};
	let reason: RevocationReason = match body.reason.parse() {
		Ok(r) => r,
		Err(e) => return (StatusCode::BAD_REQUEST, format!("{e}")).into_response(),
	};
	match state.manager.revoke(&body.serial, reason) {
		Ok(_) => {},
		Err(CertError::NotFound(s)) => {
			return (StatusCode::BAD_REQUEST, format!("unknown serial {s}")).into_response();
		},
		Err(CertError::AlreadyRevoked(s)) => {
			return (StatusCode::BAD_REQUEST, format!("already revoked: {s}")).into_response();
		},
		Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
	}
	match state.generator.regenerate() {
		Ok(()) => StatusCode::OK.into_response(),
		Err(e) => {
			warn!(error = %e, "revoked but CRL regeneration failed");
			(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
		},
	}
}

async fn get_status(State(state): State<ServiceState>) -> Response {
	if state.generator.cached.read().is_none()
		&& let Err(e) = state.generator.regenerate()
	{
		return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
	}
	match state.generator.cached() {
		Ok(c) => axum::Json(StatusBody {
			revoked_count: c.revoked_count,
			last_update: c.this_update,
			next_update: c.next_update,
		})
		.into_response(),
		Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
	}
}

