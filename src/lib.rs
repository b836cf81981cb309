//! LDAP-backed authentication and authorization for a message broker.
//!
//! Given a username (and optionally a password plus per-request context),
//! the backend decides whether the principal may log in, which capability
//! tags it carries, and whether it may access a given virtual host,
//! resource or topic under a given permission. Decisions are driven by a
//! small declarative query language evaluated against the live directory;
//! connections are cached per worker with idle eviction and recover
//! automatically when the peer closes the transport.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate
//! which is used here for interfacing with LDAP is an excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! A minimal example of authenticating and authorizing a user:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ldap_auth_backend::{AuthProps, Config, LdapAuthBackend, SecretString};
//!
//! // Configuration is usually deserialized from the broker's config store;
//! // JSON is used here for demonstration purposes.
//! let config: Config = serde_json::from_str(
//!     r#"{
//!         "servers": ["ldap.example.org"],
//!         "user_dn_pattern": "uid=${username},ou=People,dc=example,dc=org",
//!         "vhost_access_query": {
//!             "in_group_nested": {"dn": "cn=${vhost}-users,ou=Groups,dc=example,dc=org"}
//!         },
//!         "group_lookup_base": "ou=Groups,dc=example,dc=org",
//!         "tag_queries": [
//!             {"tag": "administrator",
//!              "query": {"in_group": {"dn": "cn=admins,ou=Groups,dc=example,dc=org"}}}
//!         ]
//!     }"#,
//! )?;
//!
//! let backend = LdapAuthBackend::new(config);
//! let user = backend
//!     .authenticate(
//!         "alice",
//!         AuthProps { password: Some(SecretString::new("s3cret".to_owned())), vhost: None },
//!     )
//!     .await?;
//! if backend.check_vhost_access(&user, "prod").await? {
//!     println!("{} may enter prod (admin: {})", user.username, user.has_tag("administrator"));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * Only simple and anonymous binds are supported; there is no SASL or
//!   Kerberos support.
//! * Authorization decisions are not cached across requests; every check
//!   reaches the directory (over a cached connection).
//! * The directory is never written to.

pub mod backend;
mod cache;
pub mod config;
pub mod entry;
pub mod error;
mod eval;
mod pool;
pub mod query;
pub mod scrub;
mod session;
pub mod template;

pub use ldap3::{self, SearchEntry};
pub use secrecy::SecretString;

pub use crate::{
	backend::{
		AuthProps, AuthUser, LdapAuthBackend, Permission, Resource, ResourceKind, UNKNOWN_DN,
	},
	config::{BindMode, Config, ConnectionConfig, LogMode, TagQuery, TlsConfig},
	entry::SearchEntryExt,
	error::Error,
	query::{ForArm, NestedScope, Query},
	scrub::scrub_dn,
	template::{fill, Vars},
};
