//! Automatic certificate rotation with grace-period overlap.
//!
//! A background loop scans the store for certificates nearing expiry and
//! reissues them with the same subject/SANs/usages. The active pointer for
//! each kind swaps to the new certificate immediately (new handshakes pick it
//! up); the old certificate stays pinned as `previous` until the grace period
//! elapses, then it is revoked as superseded so in-flight sessions are never
//! cut.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::manager::CertificateManager;
use super::store::StoredCertificate;
use super::{CertError, CertKind, CertStatus, CertificateRecord, CertificateRequest, RevocationReason, Subject};

#[derive(Debug, Clone)]
pub struct RotationPolicy {
	/// Rotate when remaining validity is at or below this.
	pub minimum_validity: Duration,
	/// Validity window granted to reissued certificates.
	pub maximum_validity: Duration,
	/// Start renewal when remaining validity is at or below this.
	pub renew_before: Duration,
	pub retry_interval: Duration,
	/// How long a rotated-out certificate stays valid for existing sessions.
	pub grace_period: Duration,
	pub rotation_interval: Duration,
	pub kinds: Vec<CertKind>,
}

impl Default for RotationPolicy {
	fn default() -> Self {
		RotationPolicy {
			minimum_validity: Duration::from_secs(24 * 3600),
			maximum_validity: Duration::from_secs(90 * 86400),
			renew_before: Duration::from_secs(7 * 86400),
			retry_interval: Duration::from_secs(60),
			grace_period: Duration::from_secs(300),
			rotation_interval: Duration::from_secs(3600),
			kinds: vec![CertKind::Server, CertKind::Client],
		}
	}
}

struct ActiveSet {
	current: Arc<StoredCertificate>,
	/// Pinned during the grace interval, with its expiry instant.
	previous: Option<(Arc<StoredCertificate>, OffsetDateTime)>,
}

pub struct Rotator {
	manager: Arc<CertificateManager>,
	policy: RotationPolicy,
	active: RwLock<HashMap<CertKind, ActiveSet>>,
	rotations: AtomicU64,
	errors: AtomicU64,
	cancel: CancellationToken,
	handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Rotator {
	pub fn new(manager: Arc<CertificateManager>, policy: RotationPolicy) -> Arc<Rotator> {
		Arc::new(Rotator {
			manager,
			policy,
			active: RwLock::new(HashMap::new()),
			rotations: AtomicU64::new(0),
			errors: AtomicU64::new(0),
			cancel: CancellationToken::new(),
			handle: Mutex::new(None),
		})
	}

	pub fn policy(&self) -> &RotationPolicy {
		&self.policy
	}

	/// Pin the active certificate for a kind. Must be called before the
	/// endpoint starts handing out TLS configs for that kind.
	pub fn initialize(&self, kind: CertKind, serial: &str) -> Result<(), CertError> {
		let stored = self.manager.store().load(serial)?;
		self.active.write().insert(
			kind,
			ActiveSet {
				current: Arc::new(stored),
				previous: None,
			},
		);
		Ok(())
	}

	/// The certificate new handshakes should use. Never `None` for an
	/// initialized kind.
	pub fn current(&self, kind: CertKind) -> Option<Arc<StoredCertificate>> {
		self.active.read().get(&kind).map(|s| s.current.clone())
	}

	/// The rotated-out certificate, observable only during its grace window.
	pub fn previous(&self, kind: CertKind) -> Option<Arc<StoredCertificate>> {
		self
			.active
			.read()
			.get(&kind)
			.and_then(|s| s.previous.as_ref().map(|(c, _)| c.clone()))
	}

	pub fn rotations(&self) -> u64 {
		self.rotations.load(Ordering::Relaxed)
	}

	pub fn rotation_errors(&self) -> u64 {
		self.errors.load(Ordering::Relaxed)
	}

	pub fn should_rotate(&self, record: &CertificateRecord, now: OffsetDateTime) -> bool {
		if record.effective_status(now) != CertStatus::Valid {
			return false;
		}
		let remaining = record.remaining_validity(now);
		let renew_at = time::Duration::try_from(self.policy.renew_before.max(self.policy.minimum_validity))
			.unwrap_or(time::Duration::ZERO);
		remaining <= renew_at
	}

	/// Reissue one certificate and swap it in. Returns the new record.
	pub fn rotate(&self, record: &CertificateRecord) -> Result<CertificateRecord, CertError> {
		let now = OffsetDateTime::now_utc();
		let cert = record.parse()?;
		let subject = decode_subject(&cert.subject());
		let not_after = now
			+ time::Duration::try_from(self.policy.maximum_validity)
				.map_err(|e| CertError::Issuance(e.to_string()))?;
		let req = CertificateRequest {
			kind: record.kind,
			subject,
			sans: record.sans.clone(),
			key_usages: record.key_usage.clone(),
			ext_key_usages: record.ext_key_usage.clone(),
			// Small backdate absorbs clock skew between peers.
			not_before: now - time::Duration::minutes(5),
			not_after,
			metadata: record.metadata.clone(),
		};
		let new = match (&record.issuer_serial, record.kind) {
			(None, CertKind::Ca) => self.manager.create_ca(&req)?,
			(Some(parent), CertKind::Intermediate) => self.manager.create_intermediate(&req, parent)?,
			(Some(parent), CertKind::Server) => self.manager.create_server(&req, parent)?,
			(Some(parent), CertKind::Client) => self.manager.create_client(&req, parent)?,
			(issuer, kind) => {
				return Err(CertError::Issuance(format!(
					"cannot rotate {kind} certificate with issuer {issuer:?}"
				)));
			},
		};
		self.manager.verify(&new.record.serial_number)?;

		let grace_until = now
			+ time::Duration::try_from(self.policy.grace_period).unwrap_or(time::Duration::ZERO);
		let mut active = self.active.write();
		let entry = active.entry(record.kind);
		let new_arc = Arc::new(new);
		match entry {
			std::collections::hash_map::Entry::Occupied(mut o) => {
				let set = o.get_mut();
				// Only pin as previous if we are actually replacing the
				// active certificate; background store sweeps may rotate
				// records that were never active.
				if set.current.record.serial_number == record.serial_number {
					let old = std::mem::replace(&mut set.current, new_arc.clone());
					set.previous = Some((old, grace_until));
				}
			},
			std::collections::hash_map::Entry::Vacant(v) => {
				v.insert(ActiveSet {
					current: new_arc.clone(),
					previous: None,
				});
			},
		}
		drop(active);
		self.rotations.fetch_add(1, Ordering::Relaxed);
		info!(
			kind = %record.kind,
			old = %record.serial_number,
			new = %new_arc.record.serial_number,
			grace_until = %grace_until,
			"rotated certificate"
		);
		Ok(new_arc.record.clone())
	}

	/// Drop grace-expired `previous` pins and revoke the superseded
	/// certificates. Returns the serials revoked.
	pub fn expire_grace(&self, now: OffsetDateTime) -> Vec<String> {
		let mut expired = Vec::new();
		{
			let mut active = self.active.write();
			for set in active.values_mut() {
				if let Some((old, until)) = &set.previous
					&& *until <= now
				{
					expired.push(old.record.serial_number.clone());
					set.previous = None;
				}
			}
		}
		for serial in &expired {
			match self.manager.revoke(serial, RevocationReason::Superseded) {
				Ok(_) => {},
				Err(CertError::AlreadyRevoked(_)) => {},
				Err(e) => warn!(serial, error = %e, "failed to revoke superseded certificate"),
			}
		}
		expired
	}

	/// One scan of the store: rotate everything due. Errors are counted and
	/// logged; the scan continues so one bad record cannot stall the rest.
	pub fn tick(&self, now: OffsetDateTime) {
		for kind in self.policy.kinds.clone() {
			let records = match self.manager.store().list_by_kind(kind) {
				Ok(r) => r,
				Err(e) => {
					self.errors.fetch_add(1, Ordering::Relaxed);
					error!(kind = %kind, error = %e, "rotation scan failed to list store");
					continue;
				},
			};
			for record in records {
				if !self.should_rotate(&record, now) {
					continue;
				}
				if let Err(e) = self.rotate(&record) {
					self.errors.fetch_add(1, Ordering::Relaxed);
					error!(
						kind = %kind,
						serial = %record.serial_number,
						error = %e,
						"rotation failed; will retry next tick"
					);
				}
			}
		}
		self.expire_grace(now);
	}

	/// Start the rotation loop. Idempotent.
	pub fn start(self: &Arc<Self>) {
		let mut slot = self.handle.lock();
		if slot.is_some() {
			return;
		}
		let this = self.clone();
		let cancel = self.cancel.clone();
		*slot = Some(tokio::spawn(async move {
			let mut grace_timers: JoinSet<()> = JoinSet::new();
			let mut ticker = tokio::time::interval(this.policy.rotation_interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = ticker.tick() => {},
					Some(_) = grace_timers.join_next() => {
						this.expire_grace(OffsetDateTime::now_utc());
						continue;
					},
				}
				let before = this.rotations();
				this.tick(OffsetDateTime::now_utc());
				// A rotation happened: arm a timer so the grace pin expires
				// on time instead of at the next (possibly distant) tick.
				if this.rotations() > before {
					let grace = this.policy.grace_period;
					grace_timers.spawn(async move {
						tokio::time::sleep(grace).await;
					});
				}
			}
		}));
	}

	pub async fn stop(&self) {
		self.cancel.cancel();
		let handle = self.handle.lock().take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}
}

/// Subject fields from a decoded X.509 name.
pub(crate) fn decode_subject(name: &x509_parser::x509::X509Name<'_>) -> Subject {
	let first = |it: &mut dyn Iterator<Item = String>| it.next();
	Subject {
		common_name: first(&mut name.iter_common_name().filter_map(|a| a.as_str().ok().map(String::from)))
			.unwrap_or_default(),
		organization: first(&mut name.iter_organization().filter_map(|a| a.as_str().ok().map(String::from))),
		organizational_unit: first(
			&mut name
				.iter_organizational_unit()
				.filter_map(|a| a.as_str().ok().map(String::from)),
		),
		country: first(&mut name.iter_country().filter_map(|a| a.as_str().ok().map(String::from))),
		state: first(&mut name.iter_state_or_province().filter_map(|a| a.as_str().ok().map(String::from))),
		locality: first(&mut name.iter_locality().filter_map(|a| a.as_str().ok().map(String::from))),
	}
}

