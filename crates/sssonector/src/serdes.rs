//! Serde helpers shared across config and certificate types.

use std::time::Duration;

/// Parse a Go-style duration string ("500ms", "30s", "1h30m"). Bare integers
/// are seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
	let s = s.trim();
	if s.is_empty() {
		return Err("empty duration".to_string());
	}
	if let Ok(secs) = s.parse::<u64>() {
		return Ok(Duration::from_secs(secs));
	}
	let mut total = Duration::ZERO;
	let mut num = String::new();
	let mut chars = s.chars().peekable();
	while let Some(c) = chars.next() {
		if c.is_ascii_digit() || c == '.' {
			num.push(c);
			continue;
		}
		let mut unit = c.to_string();
		if let Some(&next) = chars.peek()
			&& !next.is_ascii_digit()
			&& next != '.'
		{
			unit.push(next);
			chars.next();
		}
		let value: f64 = num
			.parse()
			.map_err(|_| format!("invalid duration value in {s:?}"))?;
		num.clear();
		let scale = match unit.as_str() {
			"ms" => Duration::from_millis(1),
			"s" => Duration::from_secs(1),
			"m" => Duration::from_secs(60),
			"h" => Duration::from_secs(3600),
			"d" => Duration::from_secs(86400),
			other => return Err(format!("unknown duration unit {other:?} in {s:?}")),
		};
		total += scale.mul_f64(value);
	}
	if !num.is_empty() {
		return Err(format!("trailing number without unit in {s:?}"));
	}
	Ok(total)
}

pub fn format_duration(d: Duration) -> String {
	let ms = d.as_millis();
	if ms % 1000 != 0 {
		return format!("{ms}ms");
	}
	let secs = d.as_secs();
	if secs % 3600 == 0 && secs != 0 {
		format!("{}h", secs / 3600)
	} else if secs % 60 == 0 && secs != 0 {
		format!("{}m", secs / 60)
	} else {
		format!("{secs}s")
	}
}

/// Duration as a Go-style string ("30s"), accepting bare seconds on input.
pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer, de::Error};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&super::format_duration(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Str(String),
			Secs(u64),
		}
		match Raw::deserialize(d)? {
			Raw::Str(s) => super::parse_duration(&s).map_err(D::Error::custom),
			Raw::Secs(n) => Ok(Duration::from_secs(n)),
		}
	}
}

/// Optional variant of [`serde_dur`].
pub mod serde_dur_option {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer, de::Error};

	pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => s.serialize_some(&super::format_duration(*d)),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Str(String),
			Secs(u64),
		}
		match Option::<Raw>::deserialize(d)? {
			None => Ok(None),
			Some(Raw::Str(s)) => super::parse_duration(&s)
				.map(Some)
				.map_err(D::Error::custom),
			Some(Raw::Secs(n)) => Ok(Some(Duration::from_secs(n))),
		}
	}
}

/// `time::OffsetDateTime` as RFC 3339.
pub mod serde_rfc3339 {
	use serde::{Deserialize, Deserializer, Serializer, de::Error};
	use time::OffsetDateTime;
	use time::format_description::well_known::Rfc3339;

	pub fn serialize<S: Serializer>(t: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
		let out = t
			.format(&Rfc3339)
			.map_err(|e| serde::ser::Error::custom(e.to_string()))?;
		s.serialize_str(&out)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
		let raw = String::deserialize(d)?;
		OffsetDateTime::parse(&raw, &Rfc3339).map_err(D::Error::custom)
	}
}

/// Optional variant of [`serde_rfc3339`].
pub mod serde_rfc3339_option {
	use serde::{Deserialize, Deserializer, Serializer, de::Error};
	use time::OffsetDateTime;
	use time::format_description::well_known::Rfc3339;

	pub fn serialize<S: Serializer>(t: &Option<OffsetDateTime>, s: S) -> Result<S::Ok, S::Error> {
		match t {
			Some(t) => {
				let out = t
					.format(&Rfc3339)
					.map_err(|e| serde::ser::Error::custom(e.to_string()))?;
				s.serialize_some(&out)
			},
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		d: D,
	) -> Result<Option<OffsetDateTime>, D::Error> {
		match Option::<String>::deserialize(d)? {
			None => Ok(None),
			Some(raw) => OffsetDateTime::parse(&raw, &Rfc3339)
				.map(Some)
				.map_err(D::Error::custom),
		}
	}
}
