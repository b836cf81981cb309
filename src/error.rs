//! Error kinds surfaced to the broker.

/// Errors that can occur while authenticating or authorizing against the
/// directory.
///
/// Protocol-level detail from the LDAP library is logged where it occurs and
/// deliberately not carried here, so callers cannot distinguish a schema
/// mismatch from a transport fault.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The directory or a policy decision refused the principal.
	#[error("access refused for {dn}: {reason}")]
	Refused {
		/// The distinguished name (or username, when no DN was resolved)
		/// the refusal applies to.
		dn: String,
		/// Human-readable reason, safe to log.
		reason: String,
	},
	/// No connection could be opened to any configured server.
	#[error("could not connect to any configured LDAP server")]
	Connect,
	/// A bind failed for a reason other than invalid credentials.
	#[error("LDAP bind failed")]
	Bind,
	/// A search performed during query evaluation failed.
	#[error("LDAP query evaluation failed")]
	Evaluate,
	/// The transport under a cached connection was found closed by the peer.
	#[error("LDAP connection closed")]
	ConnectionClosed,
	/// The `servers` list is empty.
	#[error("no LDAP servers defined")]
	NoServersDefined,
	/// A bind as the authenticated user was requested, but the flow carries
	/// no password (e.g. external authentication).
	#[error("cannot bind as the authenticated user without a password")]
	MissingPassword,
	/// The worker pool has shut down.
	#[error("LDAP worker pool unavailable")]
	Pool,
	/// A configuration value was found unusable at the point of use.
	#[error("invalid configuration: {0}")]
	Config(String),
}

impl Error {
	/// Shorthand for a refusal.
	pub(crate) fn refused(dn: impl Into<String>, reason: impl Into<String>) -> Self {
		Error::Refused { dn: dn.into(), reason: reason.into() }
	}
}
