//! The access-query evaluator.
//!
//! Evaluation interleaves pure boolean folding with live directory searches.
//! Directory-level failures degrade to an error marker that combinators
//! treat as false, so a misbehaving directory can never flip a deny into an
//! allow; only a closed transport propagates, letting the session runner
//! retry on a fresh connection.

use std::{collections::HashSet, future::Future, pin::Pin, time::Duration};

use async_trait::async_trait;
use ldap3::{ldap_escape, Ldap, Scope, SearchEntry};
use regex::Regex;
use tracing::{debug, warn};

use crate::{
	config::{Config, LogMode},
	entry::SearchEntryExt,
	error::Error,
	query::{NestedScope, Query},
	session::is_transport_closed,
	template::{fill, Vars},
};

/// Presence filter used for base-scope object lookups.
const PRESENCE: &str = "(objectClass=*)";

/// Attribute selector requesting no attributes at all.
pub(crate) const NO_ATTRS: &str = "1.1";

/// The result of evaluating a query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
	/// A boolean decision.
	Bool(bool),
	/// A single string, e.g. a filled template or a single-valued attribute.
	Str(String),
	/// An ordered list, e.g. a multi-valued attribute.
	List(Vec<String>),
	/// An evaluation error marker; combinators treat it as false.
	Error(EvalError),
}

/// Error markers internal to evaluation; they never leave the component.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EvalError {
	/// An attribute lookup returned no values.
	NotFound,
	/// A dispatch read a binding that is absent, or no arm matched.
	ArgsDoNotContain(String),
	/// A directory search failed.
	Search,
}

/// Outcome of a single directory search.
#[derive(Debug)]
pub(crate) enum SearchOutcome {
	/// The search completed; zero entries means nothing matched.
	Entries(Vec<SearchEntry>),
	/// The search failed at the directory level; detail was logged.
	Failed,
}

/// The evaluator's seam to the directory.
///
/// Implemented for live [`ldap3`] handles via [`LdapDirectory`] and by an
/// in-memory mock in tests. Transport faults are the only error this
/// returns; everything else degrades to [`SearchOutcome::Failed`].
#[async_trait]
pub(crate) trait Directory: Send {
	/// Perform one search.
	async fn search(
		&mut self,
		base: &str,
		scope: Scope,
		filter: &str,
		attrs: Vec<String>,
	) -> Result<SearchOutcome, Error>;
}

/// A live directory handle plus the logging/timeout context its searches
/// are performed under.
pub(crate) struct LdapDirectory<'a> {
	ldap: &'a mut Ldap,
	log: LogMode,
	operation_timeout: Option<Duration>,
}

impl<'a> LdapDirectory<'a> {
	pub(crate) fn new(ldap: &'a mut Ldap, config: &Config) -> Self {
		LdapDirectory {
			ldap,
			log: config.log,
			operation_timeout: config.connection.operation_timeout.map(Duration::from_secs),
		}
	}
}

#[async_trait]
impl Directory for LdapDirectory<'_> {
	async fn search(
		&mut self,
		base: &str,
		scope: Scope,
		filter: &str,
		attrs: Vec<String>,
	) -> Result<SearchOutcome, Error> {
		if self.log.wire() {
			// The filter embeds DNs and attribute values; only the unsafe
			// mode may see it.
			if self.log == LogMode::NetworkUnsafe {
				debug!(base, filter, "LDAP search");
			} else {
				debug!(base = %self.log.dn(base), "LDAP search");
			}
		}
		if let Some(timeout) = self.operation_timeout {
			self.ldap.with_timeout(timeout);
		}
		match self.ldap.search(base, scope, filter, attrs).await {
			Ok(result) => {
				let rc = result.1.rc;
				// 32 = noSuchObject: the base does not exist, which is a
				// negative answer rather than a fault.
				if rc == 0 || rc == 32 {
					Ok(SearchOutcome::Entries(
						result.0.into_iter().map(SearchEntry::construct).collect(),
					))
				} else {
					warn!(rc, text = %result.1.text, "LDAP search returned an error result");
					Ok(SearchOutcome::Failed)
				}
			}
			Err(err) if is_transport_closed(&err) => Err(Error::ConnectionClosed),
			Err(err) => {
				warn!(error = %err, "LDAP search failed");
				Ok(SearchOutcome::Failed)
			}
		}
	}
}

/// Interprets a [`Query`] against variable bindings and a directory handle.
pub(crate) struct Evaluator<'a, D: Directory> {
	config: &'a Config,
	vars: &'a Vars,
	directory: &'a mut D,
}

impl<'a, D: Directory> Evaluator<'a, D> {
	pub(crate) fn new(config: &'a Config, vars: &'a Vars, directory: &'a mut D) -> Self {
		Evaluator { config, vars, directory }
	}

	/// Evaluate `query` left to right with the documented short-circuit
	/// rules. Only transport faults surface as `Err`.
	pub(crate) fn eval<'b>(
		&'b mut self,
		query: &'b Query,
	) -> Pin<Box<dyn Future<Output = Result<Value, Error>> + Send + 'b>> {
		Box::pin(async move {
			match query {
				Query::Constant(b) => Ok(Value::Bool(*b)),
				Query::String(pattern) => Ok(Value::Str(fill(pattern, self.vars))),
				Query::For(arms) => {
					for arm in arms {
						match self.vars.get(&arm.key) {
							None => {
								return Ok(Value::Error(EvalError::ArgsDoNotContain(
									arm.key.clone(),
								)))
							}
							Some(bound) if bound == arm.value => {
								return self.eval(&arm.query).await
							}
							Some(_) => {}
						}
					}
					let key = arms.first().map(|arm| arm.key.clone()).unwrap_or_default();
					Ok(Value::Error(EvalError::ArgsDoNotContain(key)))
				}
				Query::Not(child) => {
					let value = self.eval(child).await?;
					Ok(Value::Bool(!matches!(value, Value::Bool(true))))
				}
				Query::And(children) => {
					for child in children {
						if self.eval(child).await? != Value::Bool(true) {
							return Ok(Value::Bool(false));
						}
					}
					Ok(Value::Bool(true))
				}
				Query::Or(children) => {
					for child in children {
						if self.eval(child).await? == Value::Bool(true) {
							return Ok(Value::Bool(true));
						}
					}
					Ok(Value::Bool(false))
				}
				Query::Equals(a, b) => {
					let left = self.eval(a).await?;
					let right = self.eval(b).await?;
					Ok(Value::Bool(intersects(&left, &right)))
				}
				Query::Match { subject, pattern } => {
					let subject = self.eval(subject).await?;
					let pattern = self.eval(pattern).await?;
					Ok(Value::Bool(regex_match(&subject, &pattern)))
				}
				Query::Exists { dn } => self.exists(dn).await,
				Query::Attribute { dn, name } => self.attribute(dn, name).await,
				Query::InGroup { dn, attribute } => self.in_group(dn, attribute).await,
				Query::InGroupNested { dn, attribute, scope } => {
					self.in_group_nested(dn, attribute, *scope).await
				}
			}
		})
	}

	/// The current `user_dn` binding, or the error marker group predicates
	/// report without it.
	fn user_dn(&self) -> Result<&str, Value> {
		self.vars
			.get("user_dn")
			.ok_or_else(|| Value::Error(EvalError::ArgsDoNotContain("user_dn".to_owned())))
	}

	async fn exists(&mut self, dn_pattern: &str) -> Result<Value, Error> {
		let dn = fill(dn_pattern, self.vars);
		match self.directory.search(&dn, Scope::Base, PRESENCE, vec![NO_ATTRS.to_owned()]).await? {
			SearchOutcome::Entries(entries) => Ok(Value::Bool(!entries.is_empty())),
			SearchOutcome::Failed => Ok(Value::Error(EvalError::Search)),
		}
	}

	async fn attribute(&mut self, dn_pattern: &str, name: &str) -> Result<Value, Error> {
		let dn = fill(dn_pattern, self.vars);
		match self.directory.search(&dn, Scope::Base, PRESENCE, vec![name.to_owned()]).await? {
			SearchOutcome::Failed => Ok(Value::Error(EvalError::Search)),
			SearchOutcome::Entries(entries) => {
				let mut values: Vec<String> = entries
					.iter()
					.flat_map(|entry| entry.attr_values(name))
					.cloned()
					.collect();
				match values.len() {
					0 => Ok(Value::Error(EvalError::NotFound)),
					1 => Ok(Value::Str(values.remove(0))),
					_ => Ok(Value::List(values)),
				}
			}
		}
	}

	async fn in_group(&mut self, dn_pattern: &str, attribute: &str) -> Result<Value, Error> {
		let user_dn = match self.user_dn() {
			Ok(dn) => dn.to_owned(),
			Err(marker) => return Ok(marker),
		};
		let group_dn = fill(dn_pattern, self.vars);
		let filter = format!("({}={})", attribute, ldap_escape(user_dn.as_str()));
		match self
			.directory
			.search(&group_dn, Scope::Base, &filter, vec![NO_ATTRS.to_owned()])
			.await?
		{
			SearchOutcome::Entries(entries) => Ok(Value::Bool(!entries.is_empty())),
			SearchOutcome::Failed => Ok(Value::Error(EvalError::Search)),
		}
	}

	/// Walk membership edges from `user_dn` towards the target group.
	///
	/// The visited set only grows, so a membership cycle terminates in time
	/// linear in the number of distinct reachable DNs. Failures of single
	/// searches contribute an empty successor set.
	async fn in_group_nested(
		&mut self,
		dn_pattern: &str,
		attribute: &str,
		scope: NestedScope,
	) -> Result<Value, Error> {
		let user_dn = match self.user_dn() {
			Ok(dn) => dn.to_owned(),
			Err(marker) => return Ok(marker),
		};
		let Some(base) = self.config.group_base().map(str::to_owned) else {
			warn!("nested group query without group_lookup_base or dn_lookup_base");
			return Ok(Value::Error(EvalError::Search));
		};
		let target = fill(dn_pattern, self.vars);

		let mut visited: HashSet<String> = HashSet::from([user_dn.clone()]);
		let mut pending = vec![user_dn];
		while let Some(current) = pending.pop() {
			let filter = format!("({}={})", attribute, ldap_escape(current.as_str()));
			match self
				.directory
				.search(&base, scope.to_ldap(), &filter, vec![NO_ATTRS.to_owned()])
				.await?
			{
				SearchOutcome::Failed => {}
				SearchOutcome::Entries(groups) => {
					for group in groups {
						if group.dn == target {
							return Ok(Value::Bool(true));
						}
						if visited.insert(group.dn.clone()) {
							pending.push(group.dn);
						} else {
							warn!(
								group = %self.config.log.dn(&group.dn),
								"membership cycle in nested group search"
							);
						}
					}
				}
			}
		}
		Ok(Value::Bool(false))
	}
}

/// The list form of a string-valued result; `None` for booleans and errors.
fn list_form(value: &Value) -> Option<Vec<&str>> {
	match value {
		Value::Str(s) => Some(vec![s.as_str()]),
		Value::List(items) => Some(items.iter().map(String::as_str).collect()),
		Value::Bool(_) | Value::Error(_) => None,
	}
}

/// Equality with multi-valued-attribute semantics: the operands' list forms
/// intersect. Errors on either side yield false.
fn intersects(a: &Value, b: &Value) -> bool {
	match (list_form(a), list_form(b)) {
		(Some(left), Some(right)) => left.iter().any(|value| right.contains(value)),
		_ => false,
	}
}

/// Any subject matched by any pattern.
fn regex_any(subjects: &[&str], patterns: &[&str]) -> bool {
	patterns.iter().any(|pattern| match Regex::new(pattern) {
		Ok(re) => subjects.iter().any(|subject| re.is_match(subject)),
		Err(err) => {
			warn!(error = %err, "invalid regex in match query");
			false
		}
	})
}

/// Regex match with the documented bidirectional rule: when both operands
/// are multi-valued, a miss in the forward direction retries with the
/// operands swapped. Errors on either side yield false.
fn regex_match(subject: &Value, pattern: &Value) -> bool {
	let (Some(subjects), Some(patterns)) = (list_form(subject), list_form(pattern)) else {
		return false;
	};
	if regex_any(&subjects, &patterns) {
		return true;
	}
	subjects.len() > 1 && patterns.len() > 1 && regex_any(&patterns, &subjects)
}
