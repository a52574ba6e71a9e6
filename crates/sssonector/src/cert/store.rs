//! Encrypted on-disk certificate store.
//!
//! One JSON file per record, named by serial. Private keys are encrypted at
//! rest with AES-256-GCM under a key derived by SHA-256 from operator key
//! material; a fresh random IV is stored beside each ciphertext. Writes go
//! through a temp file + fsync + atomic rename. List operations re-read the
//! directory every time so external edits are picked up.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aws_lc_rs::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use aws_lc_rs::digest::{SHA256, digest};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use parking_lot::RwLock;
use time::OffsetDateTime;
use tracing::warn;

use super::{CertError, CertKind, CertStatus, CertificateRecord, RevocationReason};

/// PKCS#8 DER key bytes, zeroed on drop.
pub struct SecretDer(Vec<u8>);

impl SecretDer {
	pub fn new(der: Vec<u8>) -> SecretDer {
		SecretDer(der)
	}

	pub fn expose(&self) -> &[u8] {
		&self.0
	}
}

impl Clone for SecretDer {
	fn clone(&self) -> Self {
		SecretDer(self.0.clone())
	}
}

impl std::fmt::Debug for SecretDer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "SecretDer({} bytes)", self.0.len())
	}
}

impl Drop for SecretDer {
	fn drop(&mut self) {
		for b in self.0.iter_mut() {
			unsafe { std::ptr::write_volatile(b, 0) };
		}
	}
}

/// A record together with its decrypted private key.
#[derive(Debug, Clone)]
pub struct StoredCertificate {
	pub record: CertificateRecord,
	pub private_key: SecretDer,
}

/// On-disk shape: the record plus the encrypted key material.
#[derive(serde::Serialize, serde::Deserialize)]
struct DiskRecord {
	#[serde(flatten)]
	record: CertificateRecord,
	/// AES-256-GCM ciphertext (tag appended), base64.
	private_key: String,
	/// 96-bit IV, base64.
	private_key_iv: String,
}

pub struct CertificateStore {
	dir: PathBuf,
	key: [u8; 32],
	lock: RwLock<()>,
}

impl CertificateStore {
	/// Open (creating if needed) the store at `dir/certs`, deriving the
	/// at-rest key from `key_material`.
	pub fn open(dir: impl AsRef<Path>, key_material: &[u8]) -> Result<CertificateStore, CertError> {
		let dir = dir.as_ref().join("certs");
		fs::create_dir_all(&dir).map_err(|e| CertError::Store(e.to_string()))?;
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
				.map_err(|e| CertError::Store(e.to_string()))?;
		}
		let derived = digest(&SHA256, key_material);
		let mut key = [0u8; 32];
		key.copy_from_slice(derived.as_ref());
		Ok(CertificateStore {
			dir,
			key,
			lock: RwLock::new(()),
		})
	}

	fn path_for(&self, serial: &str) -> PathBuf {
		self.dir.join(format!("{serial}.json"))
	}

	fn encrypt_key(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CertError> {
		let iv: [u8; NONCE_LEN] = rand::random();
		let key = LessSafeKey::new(
			UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CertError::Key("bad key".into()))?,
		);
		let mut in_out = plaintext.to_vec();
		key
			.seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
			.map_err(|_| CertError::Key("seal failed".into()))?;
		Ok((in_out, iv))
	}

	fn decrypt_key(&self, ciphertext: &[u8], iv: &[u8]) -> Result<SecretDer, CertError> {
		let iv: [u8; NONCE_LEN] = iv
			.try_into()
			.map_err(|_| CertError::Key("bad iv length".into()))?;
		let key = LessSafeKey::new(
			UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CertError::Key("bad key".into()))?,
		);
		let mut in_out = ciphertext.to_vec();
		let plain = key
			.open_in_place(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
			.map_err(|_| CertError::Key("open failed (wrong key material?)".into()))?;
		Ok(SecretDer::new(plain.to_vec()))
	}

	/// Persist a record and its private key. Overwrites any existing record
	/// with the same serial.
	pub fn store(&self, cert: &StoredCertificate) -> Result<(), CertError> {
		let _w = self.lock.write();
		let (ciphertext, iv) = self.encrypt_key(cert.private_key.expose())?;
		let disk = DiskRecord {
			record: cert.record.clone(),
			private_key: B64.encode(&ciphertext),
			private_key_iv: B64.encode(iv),
		};
		let json = serde_json::to_vec_pretty(&disk).map_err(|e| CertError::Store(e.to_string()))?;
		let tmp = self.dir.join(format!(
			".tmp-{}-{}",
			cert.record.serial_number,
			std::process::id()
		));
		let final_path = self.path_for(&cert.record.serial_number);
		let result = (|| {
			let mut f = fs::File::create(&tmp)?;
			#[cfg(unix)]
			{
				use std::os::unix::fs::PermissionsExt;
				f.set_permissions(fs::Permissions::from_mode(0o600))?;
			}
			f.write_all(&json)?;
			f.sync_all()?;
			fs::rename(&tmp, &final_path)
		})();
		if result.is_err() {
			let _ = fs::remove_file(&tmp);
		}
		result.map_err(|e| CertError::Store(e.to_string()))
	}

	pub fn load(&self, serial: &str) -> Result<StoredCertificate, CertError> {
		let _r = self.lock.read();
		self.load_unlocked(serial)
	}

	fn load_unlocked(&self, serial: &str) -> Result<StoredCertificate, CertError> {
		let path = self.path_for(serial);
		let json = fs::read(&path).map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				CertError::NotFound(serial.to_string())
			} else {
				CertError::Store(e.to_string())
			}
		})?;
		let disk: DiskRecord =
			serde_json::from_slice(&json).map_err(|e| CertError::Store(e.to_string()))?;
		let ciphertext = B64
			.decode(&disk.private_key)
			.map_err(|e| CertError::Store(e.to_string()))?;
		let iv = B64
			.decode(&disk.private_key_iv)
			.map_err(|e| CertError::Store(e.to_string()))?;
		let private_key = self.decrypt_key(&ciphertext, &iv)?;
		Ok(StoredCertificate {
			record: disk.record,
			private_key,
		})
	}

	pub fn delete(&self, serial: &str) -> Result<(), CertError> {
		let _w = self.lock.write();
		fs::remove_file(self.path_for(serial)).map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				CertError::NotFound(serial.to_string())
			} else {
				CertError::Store(e.to_string())
			}
		})
	}

	/// All records, re-read from disk. Unreadable entries are skipped with a
	/// warning rather than failing the whole listing.
	pub fn list(&self) -> Result<Vec<CertificateRecord>, CertError> {
		let _r = self.lock.read();
		let mut out = Vec::new();
		let entries = fs::read_dir(&self.dir).map_err(|e| CertError::Store(e.to_string()))?;
		for entry in entries {
			let entry = entry.map_err(|e| CertError::Store(e.to_string()))?;
			let name = entry.file_name();
			let Some(name) = name.to_str() else { continue };
			let Some(serial) = name.strip_suffix(".json") else {
				continue;
			};
			match self.load_unlocked(serial) {
				Ok(stored) => out.push(stored.record),
				Err(e) => warn!(serial, error = %e, "skipping unreadable certificate record"),
			}
		}
		out.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));
		Ok(out)
	}

	pub fn list_by_kind(&self, kind: CertKind) -> Result<Vec<CertificateRecord>, CertError> {
		Ok(self.list()?.into_iter().filter(|r| r.kind == kind).collect())
	}

	pub fn list_by_status(&self, status: CertStatus) -> Result<Vec<CertificateRecord>, CertError> {
		Ok(
			self
				.list()?
				.into_iter()
				.filter(|r| r.status == status)
				.collect(),
		)
	}

	/// Load-modify-store under the write lock.
	pub fn update_status(
		&self,
		serial: &str,
		status: CertStatus,
		reason: Option<RevocationReason>,
	) -> Result<CertificateRecord, CertError> {
		let _w = self.lock.write();
		let mut stored = self.load_unlocked(serial)?;
		let now = OffsetDateTime::now_utc();
		match status {
			CertStatus::Revoked => {
				stored
					.record
					.revoke(reason.unwrap_or(RevocationReason::Unspecified), now)?;
			},
			other => {
				stored.record.status = other;
				stored.record.updated_at = now;
			},
		}
		// Re-encrypt and rewrite in place; reuse the plain store path but we
		// already hold the write lock, so inline it.
		let (ciphertext, iv) = self.encrypt_key(stored.private_key.expose())?;
		let disk = DiskRecord {
			record: stored.record.clone(),
			private_key: B64.encode(&ciphertext),
			private_key_iv: B64.encode(iv),
		};
		let json = serde_json::to_vec_pretty(&disk).map_err(|e| CertError::Store(e.to_string()))?;
		let tmp = self
			.dir
			.join(format!(".tmp-{}-{}", serial, std::process::id()));
		let final_path = self.path_for(serial);
		let result = (|| {
			let mut f = fs::File::create(&tmp)?;
			#[cfg(unix)]
			{
				use std::os::unix::fs::PermissionsExt;
				f.set_permissions(fs::Permissions::from_mode(0o600))?;
			}
			f.write_all(&json)?;
			f.sync_all()?;
			fs::rename(&tmp, &final_path)
		})();
		if result.is_err() {
			let _ = fs::remove_file(&tmp);
		}
		result.map_err(|e| CertError::Store(e.to_string()))?;
		Ok(stored.record)
	}
}
