//! Config for the LDAP authentication backend.
use std::{path::PathBuf, sync::Arc, time::Duration};

use ldap3::LdapConnSettings;
use rustls::{Certificate, RootCertStore};
use secrecy::SecretString;
use serde::Deserialize;

use crate::{
	error::Error,
	query::Query,
	scrub::scrub_dn,
};

/// Backend configuration.
///
/// Deserializable with serde; every option except `servers` has the default
/// documented on its field.
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
	/// Ordered list of directory endpoints, tried in order when opening a
	/// connection. Entries are `host` or `host:port`; no default.
	pub servers: Vec<String>,
	/// Port used for entries of `servers` that do not carry one.
	#[serde(default = "default_port")]
	pub port: u16,
	/// Template for direct DN synthesis from the username.
	#[serde(default = "default_user_dn_pattern")]
	pub user_dn_pattern: String,
	/// Attribute to search on when resolving a username to a DN; DN lookup
	/// is disabled when unset.
	#[serde(default)]
	pub dn_lookup_attribute: Option<String>,
	/// Base DN for the DN lookup search.
	#[serde(default)]
	pub dn_lookup_base: Option<String>,
	/// Base DN for nested-group searches; falls back to `dn_lookup_base`.
	#[serde(default)]
	pub group_lookup_base: Option<String>,
	/// Identity to bind as while looking up a DN before authentication.
	#[serde(default)]
	pub dn_lookup_bind: BindMode,
	/// Identity for directory operations other than the login bind.
	#[serde(default)]
	pub other_bind: BindMode,
	/// Whether anonymous connections may be opened at all.
	#[serde(default)]
	pub anon_auth: bool,
	/// Query guarding virtual-host access. Defaults to `constant true`.
	#[serde(default)]
	pub vhost_access_query: Query,
	/// Query guarding resource access. Defaults to `constant true`.
	#[serde(default)]
	pub resource_access_query: Query,
	/// Query guarding topic access. Defaults to `constant true`.
	#[serde(default)]
	pub topic_access_query: Query,
	/// Ordered `(tag, query)` pairs evaluated at login.
	#[serde(default)]
	pub tag_queries: Vec<TagQuery>,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// Idle eviction deadline for cached connections, in seconds. Cached
	/// connections live forever if unset.
	#[serde(default)]
	pub idle_timeout: Option<u64>,
	/// Number of serial workers LDAP work is pinned to.
	#[serde(default = "default_pool_size")]
	pub pool_size: usize,
	/// Log verbosity and scrubbing behavior.
	#[serde(default)]
	pub log: LogMode,
}

fn default_port() -> u16 {
	389
}

fn default_user_dn_pattern() -> String {
	"${username}".to_owned()
}

fn default_pool_size() -> usize {
	64
}

impl Config {
	/// The connection URLs to try, in configuration order.
	#[must_use]
	pub(crate) fn endpoints(&self) -> Vec<String> {
		let scheme = if self.connection.use_ssl { "ldaps" } else { "ldap" };
		self.servers
			.iter()
			.map(|server| {
				if server.contains("://") {
					server.clone()
				} else if server.contains(':') {
					format!("{scheme}://{server}")
				} else {
					format!("{scheme}://{server}:{}", self.port)
				}
			})
			.collect()
	}

	/// Base DN for nested-group searches, with the documented fallback.
	#[must_use]
	pub(crate) fn group_base(&self) -> Option<&str> {
		self.group_lookup_base.as_deref().or(self.dn_lookup_base.as_deref())
	}

	/// Idle eviction deadline as a [`Duration`].
	#[must_use]
	pub(crate) fn idle_timeout(&self) -> Option<Duration> {
		self.idle_timeout.map(Duration::from_secs)
	}

	/// Returns an example Config for tests.
	#[allow(dead_code)]
	pub(crate) fn example() -> Self {
		Config {
			servers: vec!["localhost".to_owned()],
			port: default_port(),
			user_dn_pattern: "uid=${username},ou=People,dc=example,dc=com".to_owned(),
			dn_lookup_attribute: None,
			dn_lookup_base: None,
			group_lookup_base: None,
			dn_lookup_bind: BindMode::default(),
			other_bind: BindMode::default(),
			anon_auth: false,
			vhost_access_query: Query::default(),
			resource_access_query: Query::default(),
			topic_access_query: Query::default(),
			tag_queries: Vec::new(),
			connection: ConnectionConfig::default(),
			idle_timeout: None,
			pool_size: default_pool_size(),
			log: LogMode::default(),
		}
	}
}

/// A named tag and the query deciding whether a principal carries it.
#[derive(Deserialize, Clone, Debug)]
pub struct TagQuery {
	/// Tag name, e.g. `administrator` or `monitoring`.
	pub tag: String,
	/// The query; the tag is granted iff it evaluates to boolean true.
	pub query: Query,
}

/// The identity used for a class of directory operations.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
	/// Re-bind as the authenticated principal, using the password it
	/// logged in with.
	#[default]
	AsUser,
	/// Use an anonymous bind.
	Anonymous,
	/// Bind as a dedicated service identity.
	Creds {
		/// The service identity's DN.
		dn: String,
		/// Its password.
		password: SecretString,
	},
}

/// Configuration for how to connect to the LDAP servers. Uses defaults from
/// [`LdapConnSettings`] for unset values.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection, in seconds. Infinite if unset.
	#[serde(default)]
	pub timeout: Option<u64>,

	/// Deadline for each directory operation, in seconds. Infinite if unset.
	#[serde(default)]
	pub operation_timeout: Option<u64>,

	/// Connect over TLS from the outset (`ldaps`). False if unset.
	#[serde(default)]
	pub use_ssl: bool,

	/// Use the StartTLS extended operation for establishing a secure
	/// connection, rather than TLS on a dedicated port. False if unset.
	#[serde(default)]
	pub use_starttls: bool,

	/// Disable verification of TLS certificates. False if unset.
	#[serde(default)]
	pub no_tls_verify: bool,

	/// Optional TLS config
	#[serde(default)]
	pub tls: Option<TlsConfig>,
}

/// TLS Configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Hash)]
pub struct TlsConfig {
	/// TLS root certificate path
	pub root_certificate_path: PathBuf,
}

impl ConnectionConfig {
	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();
		if let Some(timeout) = self.timeout {
			settings = settings.set_conn_timeout(Duration::from_secs(timeout));
		}
		settings = settings.set_starttls(self.use_starttls);
		settings = settings.set_no_tls_verify(self.no_tls_verify);
		if let Some(config) = &self.tls {
			let contents = tokio::fs::read(&config.root_certificate_path)
				.await
				.map_err(|err| Error::Config(format!("reading root certificate: {err}")))?;
			let certs = rustls_pemfile::certs(&mut contents.as_slice())
				.map_err(|err| Error::Config(format!("parsing root certificate: {err}")))?;
			if certs.is_empty() {
				return Err(Error::Config("no certificates found".to_owned()));
			}
			let mut store = RootCertStore::empty();
			for cert in certs.into_iter().map(Certificate) {
				store
					.add(&cert)
					.map_err(|err| Error::Config(format!("adding root certificate: {err}")))?;
			}
			let client_config = rustls::ClientConfig::builder()
				.with_safe_defaults()
				.with_root_certificates(Arc::new(store))
				.with_no_client_auth();
			settings = settings.set_config(client_config.into());
		}
		Ok(settings)
	}
}

/// Log verbosity and scrubbing behavior.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
	/// Only warnings and errors.
	#[default]
	Off,
	/// Decision-level logging, DNs scrubbed.
	On,
	/// Wire-level logging, credentials scrubbed and DNs partially scrubbed.
	Network,
	/// Wire-level logging with DNs intact. Passwords are still omitted.
	NetworkUnsafe,
}

impl LogMode {
	/// Whether chatty (debug/info) logs are emitted at all.
	#[must_use]
	pub(crate) fn verbose(self) -> bool {
		self != LogMode::Off
	}

	/// Whether wire-level (bind/search) detail is emitted.
	#[must_use]
	pub(crate) fn wire(self) -> bool {
		matches!(self, LogMode::Network | LogMode::NetworkUnsafe)
	}

	/// A DN in loggable form. Only `network_unsafe` emits DNs verbatim.
	#[must_use]
	pub(crate) fn dn(self, dn: &str) -> String {
		match self {
			LogMode::NetworkUnsafe => dn.to_owned(),
			_ => scrub_dn(dn),
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::path::PathBuf;

	use super::{BindMode, Config, ConnectionConfig, LogMode, TlsConfig};
	use crate::query::Query;

	#[test]
	fn minimal_config_gets_documented_defaults() {
		let config: Config =
			serde_json::from_str(r#"{"servers": ["ldap.example.com"]}"#).unwrap();
		assert_eq!(config.port, 389);
		assert_eq!(config.user_dn_pattern, "${username}");
		assert!(matches!(config.dn_lookup_bind, BindMode::AsUser));
		assert!(matches!(config.other_bind, BindMode::AsUser));
		assert!(!config.anon_auth);
		assert_eq!(config.vhost_access_query, Query::Constant(true));
		assert_eq!(config.resource_access_query, Query::Constant(true));
		assert_eq!(config.topic_access_query, Query::Constant(true));
		assert!(config.tag_queries.is_empty());
		assert_eq!(config.pool_size, 64);
		assert_eq!(config.idle_timeout, None);
		assert_eq!(config.log, LogMode::Off);
	}

	#[test]
	fn endpoints_synthesize_scheme_and_port() {
		let mut config = Config::example();
		config.servers = vec![
			"one.example.com".to_owned(),
			"two.example.com:10389".to_owned(),
			"ldaps://three.example.com:636".to_owned(),
		];
		assert_eq!(
			config.endpoints(),
			vec![
				"ldap://one.example.com:389".to_owned(),
				"ldap://two.example.com:10389".to_owned(),
				"ldaps://three.example.com:636".to_owned(),
			]
		);

		config.connection.use_ssl = true;
		assert_eq!(config.endpoints()[0], "ldaps://one.example.com:389");
	}

	#[test]
	fn group_base_falls_back_to_dn_lookup_base() {
		let mut config = Config::example();
		assert_eq!(config.group_base(), None);
		config.dn_lookup_base = Some("ou=People,dc=x".to_owned());
		assert_eq!(config.group_base(), Some("ou=People,dc=x"));
		config.group_lookup_base = Some("ou=Groups,dc=x".to_owned());
		assert_eq!(config.group_base(), Some("ou=Groups,dc=x"));
	}

	#[test]
	fn log_mode_scrubs_except_network_unsafe() {
		let dn = "uid=alice,dc=example";
		assert_eq!(LogMode::On.dn(dn), "uid=xxxx,dc=xxxx");
		assert_eq!(LogMode::Network.dn(dn), "uid=xxxx,dc=xxxx");
		assert_eq!(LogMode::NetworkUnsafe.dn(dn), dn);
		assert!(!LogMode::Off.verbose());
		assert!(LogMode::On.verbose());
		assert!(!LogMode::On.wire());
		assert!(LogMode::Network.wire());
	}

	#[test]
	fn bind_mode_deserializes_all_shapes() {
		let as_user: BindMode = serde_json::from_str(r#""as_user""#).unwrap();
		assert!(matches!(as_user, BindMode::AsUser));
		let anon: BindMode = serde_json::from_str(r#""anonymous""#).unwrap();
		assert!(matches!(anon, BindMode::Anonymous));
		let creds: BindMode = serde_json::from_str(
			r#"{"creds": {"dn": "cn=svc,dc=x", "password": "hunter2"}}"#,
		)
		.unwrap();
		assert!(matches!(creds, BindMode::Creds { .. }));
	}

	#[tokio::test]
	async fn to_settings_accepts_defaults_and_rejects_bad_certs() {
		ConnectionConfig::default().to_settings().await.unwrap();

		let bad = ConnectionConfig {
			tls: Some(TlsConfig {
				root_certificate_path: PathBuf::from("does/not/exist.crt"),
			}),
			..Default::default()
		};
		assert!(matches!(
			bad.to_settings().await.err().unwrap(),
			crate::error::Error::Config(_)
		));
	}
}
