//! The authentication and authorization backend consumed by the broker.

use std::{collections::HashMap, fmt, sync::Arc};

use ldap3::{ldap_escape, Ldap, Scope};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
	cache::ConnectionCache,
	config::{BindMode, Config},
	error::Error,
	eval::{Directory, Evaluator, LdapDirectory, SearchOutcome, Value, NO_ATTRS},
	pool::{self, WorkerPool},
	query::Query,
	session::{select_credential, session_op, with_session, Credential},
	template::{fill, Vars},
};

/// Sentinel DN for principals whose DN was never resolved.
pub const UNKNOWN_DN: &str = "unknown";

/// An authenticated principal.
///
/// Born at login and carried through subsequent authorization calls. The
/// password is held only so `other_bind = as_user` can rebind for those
/// calls; `Debug` output redacts it.
#[derive(Debug, Clone)]
pub struct AuthUser {
	/// The username the principal presented.
	pub username: String,
	/// The resolved distinguished name, or [`UNKNOWN_DN`].
	pub user_dn: String,
	/// The login password, if the flow carried one.
	password: Option<SecretString>,
	/// The tags whose query evaluated to exactly boolean true at login.
	pub tags: Vec<String>,
}

impl AuthUser {
	/// A principal with no resolved DN, password or tags.
	#[must_use]
	pub fn unresolved(username: impl Into<String>) -> Self {
		AuthUser {
			username: username.into(),
			user_dn: UNKNOWN_DN.to_owned(),
			password: None,
			tags: Vec::new(),
		}
	}

	/// Whether the principal carries `tag`.
	#[must_use]
	pub fn has_tag(&self, tag: &str) -> bool {
		self.tags.iter().any(|t| t == tag)
	}

	/// The resolved DN, unless it is the unknown sentinel.
	fn dn_if_known(&self) -> Option<&str> {
		(self.user_dn != UNKNOWN_DN).then_some(self.user_dn.as_str())
	}
}

/// The broker-level resource classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
	Queue,
	Exchange,
	Topic,
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ResourceKind::Queue => write!(f, "queue"),
			ResourceKind::Exchange => write!(f, "exchange"),
			ResourceKind::Topic => write!(f, "topic"),
		}
	}
}

/// The broker's operation classes on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
	Configure,
	Write,
	Read,
}

impl fmt::Display for Permission {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Permission::Configure => write!(f, "configure"),
			Permission::Write => write!(f, "write"),
			Permission::Read => write!(f, "read"),
		}
	}
}

/// A broker resource inside a virtual host.
#[derive(Debug, Clone)]
pub struct Resource {
	/// The virtual host the resource lives in.
	pub vhost: String,
	/// The resource class.
	pub kind: ResourceKind,
	/// The resource name.
	pub name: String,
}

/// Properties accompanying an authentication request.
#[derive(Debug, Clone, Default)]
pub struct AuthProps {
	/// The password presented at login; absence selects the passwordless
	/// flow.
	pub password: Option<SecretString>,
	/// The virtual host the login is scoped to, when known.
	pub vhost: Option<String>,
}

/// The LDAP authentication backend.
///
/// Owns the worker pool all directory work is pinned to; cheap to share
/// behind an [`Arc`]. Construction must happen within a Tokio runtime.
pub struct LdapAuthBackend {
	config: Arc<Config>,
	pool: WorkerPool,
}

impl LdapAuthBackend {
	/// Create a backend for `config`, spawning its worker pool.
	#[must_use]
	pub fn new(config: Config) -> Self {
		let pool = WorkerPool::new(config.pool_size, config.idle_timeout());
		LdapAuthBackend { config: Arc::new(config), pool }
	}

	/// Authenticate `username` and run the configured tag queries.
	pub async fn authenticate(
		&self,
		username: &str,
		props: AuthProps,
	) -> Result<AuthUser, Error> {
		let config = Arc::clone(&self.config);
		let username = username.to_owned();
		self.pool
			.run(pool::job(move |cache| {
				Box::pin(async move { login(&config, cache, &username, &props).await })
			}))
			.await
	}

	/// Resolve `username` without authenticating it: the passwordless flow.
	pub async fn authorize(&self, username: &str) -> Result<AuthUser, Error> {
		self.authenticate(username, AuthProps::default()).await
	}

	/// Whether `user` may access `vhost`.
	pub async fn check_vhost_access(
		&self,
		user: &AuthUser,
		vhost: &str,
	) -> Result<bool, Error> {
		let config = Arc::clone(&self.config);
		let user = user.clone();
		let vhost = vhost.to_owned();
		self.pool
			.run(pool::job(move |cache| {
				Box::pin(async move {
					let vars = Vars::new()
						.with("username", user.username.clone())
						.with("user_dn", user.user_dn.clone())
						.with("vhost", vhost.clone());
					check(&config, cache, &config.vhost_access_query, &user, &vars).await
				})
			}))
			.await
	}

	/// Whether `user` may apply `permission` to `resource`.
	pub async fn check_resource_access(
		&self,
		user: &AuthUser,
		resource: &Resource,
		permission: Permission,
	) -> Result<bool, Error> {
		let config = Arc::clone(&self.config);
		let user = user.clone();
		let resource = resource.clone();
		self.pool
			.run(pool::job(move |cache| {
				Box::pin(async move {
					let vars = resource_vars(&user, &resource, permission);
					check(&config, cache, &config.resource_access_query, &user, &vars).await
				})
			}))
			.await
	}

	/// Whether `user` may apply `permission` to the topic `resource` under
	/// the given routing context.
	pub async fn check_topic_access(
		&self,
		user: &AuthUser,
		resource: &Resource,
		permission: Permission,
		context: &HashMap<String, String>,
	) -> Result<bool, Error> {
		let config = Arc::clone(&self.config);
		let user = user.clone();
		let resource = resource.clone();
		let context = context.clone();
		self.pool
			.run(pool::job(move |cache| {
				Box::pin(async move {
					let vars = topic_vars(&user, &resource, permission, &context);
					check(&config, cache, &config.topic_access_query, &user, &vars).await
				})
			}))
			.await
	}
}

/// The variable map for a resource access check.
fn resource_vars(user: &AuthUser, resource: &Resource, permission: Permission) -> Vars {
	Vars::new()
		.with("username", user.username.clone())
		.with("user_dn", user.user_dn.clone())
		.with("vhost", resource.vhost.clone())
		.with("resource", resource.kind.to_string())
		.with("name", resource.name.clone())
		.with("permission", permission.to_string())
}

/// The variable map for a topic access check: the resource map plus every
/// context pair whose key does not collide with a fixed variable name.
fn topic_vars(
	user: &AuthUser,
	resource: &Resource,
	permission: Permission,
	context: &HashMap<String, String>,
) -> Vars {
	let mut vars = resource_vars(user, resource, permission);
	for (key, value) in context {
		if !vars.contains(key) {
			vars.push(key.clone(), value.clone());
		}
	}
	vars
}

/// How `user_dn` is resolved relative to the authenticating bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DnResolution {
	/// Pattern substitution only.
	Never,
	/// Bind as a configured identity, search for the DN, then authenticate.
	Prebind,
	/// Authenticate with the pattern DN, then re-resolve under the
	/// authenticated session.
	Postbind,
}

fn resolution_mode(config: &Config) -> DnResolution {
	match (&config.dn_lookup_attribute, &config.dn_lookup_bind) {
		(None, _) => DnResolution::Never,
		(Some(_), BindMode::AsUser) => DnResolution::Postbind,
		(Some(_), _) => DnResolution::Prebind,
	}
}

/// The login pipeline.
async fn login(
	config: &Config,
	cache: &mut ConnectionCache,
	username: &str,
	props: &AuthProps,
) -> Result<AuthUser, Error> {
	if let Some(password) = &props.password {
		if password.expose_secret().is_empty() {
			// The protocol treats an empty password as a successful
			// anonymous bind; it must not pass as authentication.
			return Err(Error::refused(username, "unauthenticated bind is not allowed"));
		}
	}

	let mode = resolution_mode(config);
	let mut user_dn = match mode {
		DnResolution::Prebind => prebind_lookup(config, cache, username).await?,
		DnResolution::Never | DnResolution::Postbind => {
			fill(&config.user_dn_pattern, &Vars::new().with("username", username))
		}
	};

	// The authenticating bind; passwordless flows run anonymously and are
	// subject to the anon_auth gate.
	let credential = match &props.password {
		Some(password) => {
			Credential::Simple { dn: user_dn.clone(), password: password.clone() }
		}
		None => Credential::Anonymous,
	};
	let postbind = mode == DnResolution::Postbind;
	let resolved = with_session(
		config,
		cache,
		Ok(credential),
		session_op(|ldap| {
			let config = config.clone();
			let username = username.to_owned();
			Box::pin(async move {
				if postbind {
					dn_lookup(&config, ldap, &username).await.map(Some)
				} else {
					Ok(None)
				}
			})
		}),
	)
	.await?;
	if let Some(dn) = resolved {
		user_dn = dn;
	}

	let mut user = AuthUser {
		username: username.to_owned(),
		user_dn,
		password: props.password.clone(),
		tags: Vec::new(),
	};
	user.tags = tag_sweep(config, cache, &user, props.vhost.as_deref()).await?;

	if config.log.verbose() {
		info!(
			username = %user.username,
			dn = %config.log.dn(&user.user_dn),
			tags = ?user.tags,
			"login succeeded"
		);
	}
	Ok(user)
}

/// Evaluate the configured tag queries under the `other_bind` credential.
async fn tag_sweep(
	config: &Config,
	cache: &mut ConnectionCache,
	user: &AuthUser,
	vhost: Option<&str>,
) -> Result<Vec<String>, Error> {
	if config.tag_queries.is_empty() {
		return Ok(Vec::new());
	}
	let mut vars = Vars::new()
		.with("username", user.username.clone())
		.with("user_dn", user.user_dn.clone());
	if let Some(vhost) = vhost {
		vars.push("vhost", vhost);
	}
	let credential =
		select_credential(&config.other_bind, user.dn_if_known(), user.password.as_ref());
	with_session(
		config,
		cache,
		credential,
		session_op(|ldap| {
			let config = config.clone();
			let vars = vars.clone();
			Box::pin(async move {
				let mut directory = LdapDirectory::new(ldap, &config);
				let mut granted = Vec::new();
				for tag_query in &config.tag_queries {
					let value = Evaluator::new(&config, &vars, &mut directory)
						.eval(&tag_query.query)
						.await?;
					match value {
						Value::Bool(true) => granted.push(tag_query.tag.clone()),
						Value::Bool(false) => {}
						Value::Error(err) => {
							warn!(tag = %tag_query.tag, error = ?err, "tag query failed");
							return Err(Error::Evaluate);
						}
						other => {
							warn!(
								tag = %tag_query.tag,
								result = ?other,
								"tag query returned a non-boolean"
							);
						}
					}
				}
				Ok(granted)
			})
		}),
	)
	.await
}

/// Resolve a DN before authentication, under the `dn_lookup_bind` identity.
async fn prebind_lookup(
	config: &Config,
	cache: &mut ConnectionCache,
	username: &str,
) -> Result<String, Error> {
	let credential = match &config.dn_lookup_bind {
		BindMode::Anonymous => Ok(Credential::Anonymous),
		BindMode::Creds { dn, password } => {
			Ok(Credential::Simple { dn: dn.clone(), password: password.clone() })
		}
		// resolution_mode maps as_user to postbind, so this cannot be
		// reached through the pipeline.
		BindMode::AsUser => Err(Error::Config(
			"dn_lookup_bind = as_user cannot run before authentication".to_owned(),
		)),
	};
	with_session(
		config,
		cache,
		credential,
		session_op(|ldap| {
			let config = config.clone();
			let username = username.to_owned();
			Box::pin(async move { dn_lookup(&config, ldap, &username).await })
		}),
	)
	.await
}

/// Search for the DN whose `dn_lookup_attribute` equals `username`.
async fn dn_lookup(config: &Config, ldap: &mut Ldap, username: &str) -> Result<String, Error> {
	let (Some(attribute), Some(base)) =
		(config.dn_lookup_attribute.as_deref(), config.dn_lookup_base.as_deref())
	else {
		return Err(Error::Config(
			"dn_lookup_attribute requires dn_lookup_base".to_owned(),
		));
	};
	let filter = format!("({}={})", attribute, ldap_escape(username));
	let mut directory = LdapDirectory::new(ldap, config);
	match directory.search(base, Scope::Subtree, &filter, vec![NO_ATTRS.to_owned()]).await? {
		SearchOutcome::Failed => Err(Error::Evaluate),
		SearchOutcome::Entries(entries) => {
			let mut entries = entries.into_iter();
			let Some(first) = entries.next() else {
				return Err(Error::refused(username, "no distinguished name found"));
			};
			let extra = entries.count();
			if extra > 0 {
				warn!(username, extra, "DN lookup matched multiple entries, using the first");
			}
			if config.log.verbose() {
				info!(username, dn = %config.log.dn(&first.dn), "resolved DN");
			}
			Ok(first.dn)
		}
	}
}

/// Evaluate an authorization query for `user` under the `other_bind`
/// credential and reduce the result to a decision.
async fn check(
	config: &Config,
	cache: &mut ConnectionCache,
	query: &Query,
	user: &AuthUser,
	vars: &Vars,
) -> Result<bool, Error> {
	if user.dn_if_known().is_none() && query.reads_user_dn() {
		warn!(
			username = %user.username,
			"denying a query that reads user_dn for a principal without one"
		);
		return Ok(false);
	}
	let credential =
		select_credential(&config.other_bind, user.dn_if_known(), user.password.as_ref());
	let value = with_session(
		config,
		cache,
		credential,
		session_op(|ldap| {
			let config = config.clone();
			let vars = vars.clone();
			let query = query.clone();
			Box::pin(async move {
				let mut directory = LdapDirectory::new(ldap, &config);
				Evaluator::new(&config, &vars, &mut directory).eval(&query).await
			})
		}),
	)
	.await?;
	match value {
		Value::Bool(decision) => {
			if config.log.verbose() {
				info!(username = %user.username, decision, "authorization query evaluated");
			}
			Ok(decision)
		}
		Value::Error(err) => {
			warn!(username = %user.username, error = ?err, "authorization query failed");
			Err(Error::Evaluate)
		}
		other => {
			warn!(
				username = %user.username,
				result = ?other,
				"authorization query returned a non-boolean"
			);
			Ok(false)
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use secrecy::SecretString;

	use super::{
		check, login, resolution_mode, resource_vars, topic_vars, AuthProps, AuthUser,
		DnResolution, Permission, Resource, ResourceKind, UNKNOWN_DN,
	};
	use crate::{
		cache::ConnectionCache,
		config::{BindMode, Config},
		error::Error,
		query::Query,
	};

	fn secret(value: &str) -> SecretString {
		SecretString::new(value.to_owned())
	}

	fn alice() -> AuthUser {
		AuthUser {
			username: "alice".to_owned(),
			user_dn: "uid=alice,ou=People,dc=x".to_owned(),
			password: Some(secret("s3cret")),
			tags: Vec::new(),
		}
	}

	fn topic() -> Resource {
		Resource { vhost: "prod".to_owned(), kind: ResourceKind::Topic, name: "events".to_owned() }
	}

	#[test]
	fn resolution_mode_follows_lookup_configuration() {
		let mut config = Config::example();
		assert_eq!(resolution_mode(&config), DnResolution::Never);

		config.dn_lookup_attribute = Some("uid".to_owned());
		assert_eq!(
			resolution_mode(&config),
			DnResolution::Postbind,
			"as_user lookup binds can only run after authentication"
		);

		config.dn_lookup_bind = BindMode::Anonymous;
		assert_eq!(resolution_mode(&config), DnResolution::Prebind);

		config.dn_lookup_bind =
			BindMode::Creds { dn: "cn=svc,dc=x".to_owned(), password: secret("pw") };
		assert_eq!(resolution_mode(&config), DnResolution::Prebind);
	}

	#[test]
	fn resource_vars_bind_the_fixed_names() {
		let vars = resource_vars(&alice(), &topic(), Permission::Write);
		assert_eq!(vars.get("username"), Some("alice"));
		assert_eq!(vars.get("user_dn"), Some("uid=alice,ou=People,dc=x"));
		assert_eq!(vars.get("vhost"), Some("prod"));
		assert_eq!(vars.get("resource"), Some("topic"));
		assert_eq!(vars.get("name"), Some("events"));
		assert_eq!(vars.get("permission"), Some("write"));
	}

	#[test]
	fn topic_context_keys_never_shadow_fixed_names() {
		let context: HashMap<String, String> = [
			("routing_key".to_owned(), "a.b.c".to_owned()),
			("username".to_owned(), "mallory".to_owned()),
			("vhost".to_owned(), "other".to_owned()),
		]
		.into_iter()
		.collect();
		let vars = topic_vars(&alice(), &topic(), Permission::Read, &context);
		assert_eq!(vars.get("routing_key"), Some("a.b.c"));
		assert_eq!(vars.get("username"), Some("alice"), "colliding keys are dropped");
		assert_eq!(vars.get("vhost"), Some("prod"));
	}

	#[tokio::test]
	async fn empty_password_is_refused_before_any_directory_contact() {
		let config = Config::example();
		let mut cache = ConnectionCache::new(None);
		let props = AuthProps { password: Some(secret("")), vhost: None };
		let err = login(&config, &mut cache, "alice", &props).await.unwrap_err();
		let Error::Refused { dn, reason } = err else { panic!("expected a refusal") };
		assert_eq!(dn, "alice");
		assert!(reason.contains("unauthenticated"));
	}

	#[tokio::test]
	async fn passwordless_login_requires_anonymous_opens() {
		let config = Config::example();
		assert!(!config.anon_auth);
		let mut cache = ConnectionCache::new(None);
		let err = login(&config, &mut cache, "alice", &AuthProps::default())
			.await
			.unwrap_err();
		assert!(matches!(err, Error::Bind));
	}

	#[tokio::test]
	async fn queries_reading_user_dn_deny_unresolved_principals() {
		let config = Config::example();
		let mut cache = ConnectionCache::new(None);
		let user = AuthUser::unresolved("alice");
		assert_eq!(user.user_dn, UNKNOWN_DN);

		let query: Query =
			serde_json::from_str(r#"{"in_group": {"dn": "cn=admins,dc=x"}}"#).unwrap();
		let vars = resource_vars(&user, &topic(), Permission::Read);
		let decision = check(&config, &mut cache, &query, &user, &vars).await.unwrap();
		assert!(!decision, "unresolved principals cannot satisfy group predicates");
	}

	#[test]
	fn display_forms_match_the_wire_vocabulary() {
		assert_eq!(ResourceKind::Queue.to_string(), "queue");
		assert_eq!(ResourceKind::Exchange.to_string(), "exchange");
		assert_eq!(Permission::Configure.to_string(), "configure");
	}

	#[test]
	fn debug_output_redacts_the_password() {
		let rendered = format!("{:?}", alice());
		assert!(!rendered.contains("s3cret"), "Debug must not reveal the password");
	}
}
