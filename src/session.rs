//! Pooled, re-entrant LDAP sessions.
//!
//! A session run acquires (or reuses) a cached connection for the
//! credential's key, rebinds when the credential is not anonymous, and hands
//! the live handle to the caller. A closed transport on the first attempt
//! purges the cache entry and retries once on a fresh connection.

use std::{future::Future, pin::Pin, time::Duration};

use ldap3::{Ldap, LdapError};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::{
	cache::{ConnectionCache, ConnectionKey},
	config::{BindMode, Config},
	error::Error,
};

/// LDAP result code for invalidCredentials.
const RC_INVALID_CREDENTIALS: u32 = 49;

/// The identity a session is bound as.
#[derive(Debug, Clone)]
pub(crate) enum Credential {
	/// No bind; the connection stays anonymous.
	Anonymous,
	/// A simple bind.
	Simple {
		/// The bind DN.
		dn: String,
		/// The bind password.
		password: SecretString,
	},
}

impl Credential {
	pub(crate) fn is_anonymous(&self) -> bool {
		matches!(self, Credential::Anonymous)
	}
}

/// Choose the bind identity for a directory operation under `mode`.
///
/// `user_dn` and `password` describe the authenticated principal, where
/// known; `as_user` requires both.
pub(crate) fn select_credential(
	mode: &BindMode,
	user_dn: Option<&str>,
	password: Option<&SecretString>,
) -> Result<Credential, Error> {
	match mode {
		BindMode::Anonymous => Ok(Credential::Anonymous),
		BindMode::Creds { dn, password } => {
			Ok(Credential::Simple { dn: dn.clone(), password: password.clone() })
		}
		BindMode::AsUser => match (user_dn, password) {
			(Some(dn), Some(password)) => {
				Ok(Credential::Simple { dn: dn.to_owned(), password: password.clone() })
			}
			_ => Err(Error::MissingPassword),
		},
	}
}

/// Whether `err` marks the transport under the handle as gone, as opposed to
/// a directory-level failure.
pub(crate) fn is_transport_closed(err: &LdapError) -> bool {
	matches!(
		err,
		LdapError::EndOfStream
			| LdapError::Io { .. }
			| LdapError::OpSend { .. }
			| LdapError::ResultRecv { .. }
	)
}

/// Identity helper pinning a closure to the session-operation signature.
pub(crate) fn session_op<T, F>(f: F) -> F
where
	F: for<'c> Fn(&'c mut Ldap) -> Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'c>>
		+ Send,
{
	f
}

/// Run `op` against a bound session for `credential`.
///
/// Credential errors are returned unchanged. Anonymous credentials are
/// refused unless `anon_auth` permits anonymous opens. An
/// invalidCredentials bind outcome becomes [`Error::Refused`]; other bind
/// failures become the opaque [`Error::Bind`] with detail logged only.
pub(crate) async fn with_session<T, F>(
	config: &Config,
	cache: &mut ConnectionCache,
	credential: Result<Credential, Error>,
	op: F,
) -> Result<T, Error>
where
	F: for<'c> Fn(&'c mut Ldap) -> Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'c>>
		+ Send,
{
	let credential = credential?;
	if credential.is_anonymous() && !config.anon_auth {
		warn!("anonymous LDAP operations are disabled (anon_auth = false)");
		return Err(Error::Bind);
	}
	let key = ConnectionKey::new(config, credential.is_anonymous());
	let mut retried = false;
	loop {
		let mut ldap = cache.acquire(&key, config).await?;
		match run_once(config, &mut ldap, &credential, &op).await {
			Err(Error::ConnectionClosed) if !retried => {
				retried = true;
				if config.log.verbose() {
					info!("LDAP connection closed by peer, retrying on a fresh connection");
				}
				cache.purge(&key);
			}
			other => return other,
		}
	}
}

async fn run_once<T, F>(
	config: &Config,
	ldap: &mut Ldap,
	credential: &Credential,
	op: &F,
) -> Result<T, Error>
where
	F: for<'c> Fn(&'c mut Ldap) -> Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'c>>
		+ Send,
{
	if let Credential::Simple { dn, password } = credential {
		bind(config, ldap, dn, password).await?;
	}
	op(ldap).await
}

/// Issue a simple bind and classify the outcome.
async fn bind(
	config: &Config,
	ldap: &mut Ldap,
	dn: &str,
	password: &SecretString,
) -> Result<(), Error> {
	if config.log.wire() {
		debug!(dn = %config.log.dn(dn), "LDAP simple bind");
	}
	if let Some(timeout) = config.connection.operation_timeout {
		ldap.with_timeout(Duration::from_secs(timeout));
	}
	match ldap.simple_bind(dn, password.expose_secret()).await {
		Ok(result) if result.rc == 0 => Ok(()),
		Ok(result) if result.rc == RC_INVALID_CREDENTIALS => {
			Err(Error::refused(dn, "invalid credentials"))
		}
		Ok(result) => {
			warn!(rc = result.rc, dn = %config.log.dn(dn), "LDAP bind failed");
			Err(Error::Bind)
		}
		Err(err) if is_transport_closed(&err) => Err(Error::ConnectionClosed),
		Err(err) => {
			warn!(error = %err, dn = %config.log.dn(dn), "LDAP bind error");
			Err(Error::Bind)
		}
	}
}
