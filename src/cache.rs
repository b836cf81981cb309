//! Worker-local cache of live LDAP connections.
//!
//! Each worker owns one cache, so no locking guards the map. Connections
//! are keyed on everything that makes them interchangeable: anonymity, the
//! endpoint list and the open options. The idle timeout governs eviction,
//! not identity, and is deliberately absent from the key.
use std::{collections::HashMap, time::Duration};

use ldap3::{Ldap, LdapConnAsync};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
	config::{Config, TlsConfig},
	error::Error,
};

/// The open options participating in connection identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct OpenOptions {
	use_ssl: bool,
	use_starttls: bool,
	no_tls_verify: bool,
	timeout: Option<u64>,
	operation_timeout: Option<u64>,
	tls: Option<TlsConfig>,
}

/// Identity of a cached connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionKey {
	anonymous: bool,
	endpoints: Vec<String>,
	options: OpenOptions,
}

impl ConnectionKey {
	pub(crate) fn new(config: &Config, anonymous: bool) -> Self {
		let connection = &config.connection;
		ConnectionKey {
			anonymous,
			endpoints: config.endpoints(),
			options: OpenOptions {
				use_ssl: connection.use_ssl,
				use_starttls: connection.use_starttls,
				no_tls_verify: connection.no_tls_verify,
				timeout: connection.timeout,
				operation_timeout: connection.operation_timeout,
				tls: connection.tls.clone(),
			},
		}
	}
}

/// A live connection, its driver task and its idle stamp.
struct CachedConn {
	ldap: Ldap,
	driver: JoinHandle<()>,
	last_used: Instant,
}

/// Owns the live connections of one worker.
pub(crate) struct ConnectionCache {
	entries: HashMap<ConnectionKey, CachedConn>,
	idle_timeout: Option<Duration>,
}

impl ConnectionCache {
	pub(crate) fn new(idle_timeout: Option<Duration>) -> Self {
		ConnectionCache { entries: HashMap::new(), idle_timeout }
	}

	/// Return the cached handle for `key`, refreshing its idle stamp, or
	/// open a new connection and cache it.
	pub(crate) async fn acquire(
		&mut self,
		key: &ConnectionKey,
		config: &Config,
	) -> Result<Ldap, Error> {
		if let Some(cached) = self.entries.get_mut(key) {
			cached.last_used = Instant::now();
			if config.log.verbose() {
				debug!("reusing cached LDAP connection");
			}
			return Ok(cached.ldap.clone());
		}
		let (ldap, driver) = open_connection(config).await?;
		self.entries.insert(
			key.clone(),
			CachedConn { ldap: ldap.clone(), driver, last_used: Instant::now() },
		);
		Ok(ldap)
	}

	/// Forcibly drop the entry for `key` without a graceful unbind; the
	/// transport it held is already gone.
	pub(crate) fn purge(&mut self, key: &ConnectionKey) {
		if let Some(conn) = self.entries.remove(key) {
			conn.driver.abort();
		}
	}

	/// The earliest instant at which an entry goes idle, if any.
	pub(crate) fn next_expiry(&self) -> Option<Instant> {
		let idle = self.idle_timeout?;
		self.entries.values().map(|conn| conn.last_used + idle).min()
	}

	/// Unbind and drop every entry whose idle deadline has passed.
	pub(crate) async fn evict_idle(&mut self) {
		let Some(idle) = self.idle_timeout else { return };
		let now = Instant::now();
		let expired: Vec<ConnectionKey> = self
			.entries
			.iter()
			.filter(|(_, conn)| now >= conn.last_used + idle)
			.map(|(key, _)| key.clone())
			.collect();
		for key in expired {
			if let Some(mut conn) = self.entries.remove(&key) {
				debug!("evicting idle LDAP connection");
				let _ = conn.ldap.unbind().await;
				conn.driver.abort();
			}
		}
	}

	/// Gracefully close every cached connection.
	pub(crate) async fn close_all(&mut self) {
		for (_, mut conn) in self.entries.drain() {
			let _ = conn.ldap.unbind().await;
			conn.driver.abort();
		}
	}
}

/// Open a connection to the first configured endpoint that answers.
async fn open_connection(config: &Config) -> Result<(Ldap, JoinHandle<()>), Error> {
	let endpoints = config.endpoints();
	if endpoints.is_empty() {
		return Err(Error::NoServersDefined);
	}
	for endpoint in &endpoints {
		let url = match Url::parse(endpoint) {
			Ok(url) => url,
			Err(err) => {
				warn!(%endpoint, error = %err, "invalid LDAP endpoint");
				continue;
			}
		};
		let settings = config.connection.to_settings().await?;
		match LdapConnAsync::from_url_with_settings(settings, &url).await {
			Ok((conn, ldap)) => {
				if config.log.verbose() {
					info!(%endpoint, "LDAP connection opened");
				}
				let driver = tokio::spawn(async move {
					if let Err(err) = conn.drive().await {
						warn!("LDAP connection error {err}");
					}
				});
				return Ok((ldap, driver));
			}
			Err(err) => {
				warn!(%endpoint, error = %err, "could not open LDAP connection");
			}
		}
	}
	Err(Error::Connect)
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::time::Duration;

	use super::{ConnectionCache, ConnectionKey};
	use crate::{config::Config, error::Error};

	#[test]
	fn key_identity_excludes_the_idle_timeout() {
		let mut a = Config::example();
		let mut b = Config::example();
		a.idle_timeout = Some(30);
		b.idle_timeout = None;
		assert_eq!(
			ConnectionKey::new(&a, false),
			ConnectionKey::new(&b, false),
			"the idle timeout governs eviction, not identity"
		);
	}

	#[test]
	fn key_identity_covers_anonymity_and_options() {
		let config = Config::example();
		assert_ne!(ConnectionKey::new(&config, true), ConnectionKey::new(&config, false));

		let mut tls = Config::example();
		tls.connection.use_starttls = true;
		assert_ne!(ConnectionKey::new(&config, false), ConnectionKey::new(&tls, false));

		let mut other_server = Config::example();
		other_server.servers = vec!["other.example.com".to_owned()];
		assert_ne!(
			ConnectionKey::new(&config, false),
			ConnectionKey::new(&other_server, false)
		);
	}

	#[test]
	fn empty_cache_has_no_expiry() {
		let cache = ConnectionCache::new(Some(Duration::from_secs(1)));
		assert_eq!(cache.next_expiry(), None);
		let untimed = ConnectionCache::new(None);
		assert_eq!(untimed.next_expiry(), None);
	}

	#[test]
	fn purging_an_absent_key_is_a_no_op() {
		let mut cache = ConnectionCache::new(None);
		cache.purge(&ConnectionKey::new(&Config::example(), false));
	}

	#[tokio::test]
	async fn empty_server_list_is_a_configuration_error() {
		let mut config = Config::example();
		config.servers.clear();
		let mut cache = ConnectionCache::new(None);
		let err = cache
			.acquire(&ConnectionKey::new(&config, false), &config)
			.await
			.unwrap_err();
		assert!(matches!(err, Error::NoServersDefined));
	}

	#[tokio::test]
	async fn unreachable_servers_surface_as_connect_error() {
		let mut config = Config::example();
		// Discard port: nothing listens there.
		config.servers = vec!["127.0.0.1:9".to_owned()];
		config.connection.timeout = Some(1);
		let mut cache = ConnectionCache::new(None);
		let err = cache
			.acquire(&ConnectionKey::new(&config, false), &config)
			.await
			.unwrap_err();
		assert!(matches!(err, Error::Connect));
	}
}
