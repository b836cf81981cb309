//! Redaction of distinguished names before they reach the log sink.
//!
//! Every DN destined for a log line passes through [`scrub_dn`] (or the
//! log-mode helper in [`crate::config::LogMode`]) first; the sink itself is
//! never trusted to sanitize.

/// Replacement for the value of a sensitive RDN.
const REDACTED: &str = "xxxx";

/// RDN types whose values identify people or infrastructure.
fn is_sensitive_rdn_type(attr: &str) -> bool {
	attr.trim().eq_ignore_ascii_case("cn")
		|| attr.trim().eq_ignore_ascii_case("dc")
		|| attr.trim().eq_ignore_ascii_case("ou")
		|| attr.trim().eq_ignore_ascii_case("uid")
}

/// Redact the values of `cn`, `dc`, `ou` and `uid` RDNs in `dn`, keeping
/// other RDN types verbatim. Idempotent.
#[must_use]
pub fn scrub_dn(dn: &str) -> String {
	dn.split(',')
		.map(|rdn| match rdn.split_once('=') {
			Some((attr, _)) if is_sensitive_rdn_type(attr) => {
				format!("{attr}={REDACTED}")
			}
			_ => rdn.to_owned(),
		})
		.collect::<Vec<_>>()
		.join(",")
}

#[cfg(test)]
mod tests {
	use super::scrub_dn;

	#[test]
	fn redacts_sensitive_rdn_values() {
		assert_eq!(
			scrub_dn("uid=alice,ou=People,dc=example,dc=com"),
			"uid=xxxx,ou=xxxx,dc=xxxx,dc=xxxx"
		);
	}

	#[test]
	fn keeps_other_rdn_types_verbatim() {
		assert_eq!(
			scrub_dn("uid=alice,l=Berlin,o=Example Org,dc=example"),
			"uid=xxxx,l=Berlin,o=Example Org,dc=xxxx"
		);
	}

	#[test]
	fn rdn_type_match_is_case_insensitive() {
		assert_eq!(scrub_dn("CN=admin,DC=example"), "CN=xxxx,DC=xxxx");
	}

	#[test]
	fn scrubbing_is_idempotent() {
		let once = scrub_dn("uid=alice,ou=People,st=BE,dc=example,dc=com");
		assert_eq!(scrub_dn(&once), once);
	}

	#[test]
	fn tolerates_non_dn_input() {
		assert_eq!(scrub_dn("not a dn"), "not a dn");
		assert_eq!(scrub_dn(""), "");
	}
}
