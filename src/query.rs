//! The declarative access-query language.
//!
//! Queries are configuration-owned and immutable at runtime. The sum type
//! accepts configuration literally and rejects unknown shapes at
//! deserialization time; a bare string deserializes as a template leaf.

use ldap3::Scope;
use serde::{Deserialize, Deserializer, Serialize};

/// Default membership attribute for group predicates.
fn member_attribute() -> String {
	"member".to_owned()
}

/// Search scope for nested-group traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestedScope {
	/// Search the whole subtree under the group base.
	#[default]
	Subtree,
	/// Search only the level directly under the group base.
	OneLevel,
}

impl NestedScope {
	pub(crate) fn to_ldap(self) -> Scope {
		match self {
			NestedScope::Subtree => Scope::Subtree,
			NestedScope::OneLevel => Scope::OneLevel,
		}
	}
}

/// One arm of a [`Query::For`] dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForArm {
	/// The variable the arm dispatches on.
	pub key: String,
	/// The value the variable must be bound to for this arm to match.
	pub value: String,
	/// The query evaluated when the arm matches.
	pub query: Query,
}

/// An access query.
///
/// Leaves evaluate to booleans, strings, string lists or error markers;
/// combinators fold child results with the short-circuit rules documented on
/// the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
	/// A literal boolean.
	Constant(bool),
	/// Dispatch on the value of a binding; the first matching arm wins.
	For(Vec<ForArm>),
	/// True iff the filled DN resolves to at least one object.
	Exists {
		/// DN pattern, filled from the variable map.
		dn: String,
	},
	/// True iff the group at the filled DN lists the current `user_dn` in
	/// its membership attribute.
	InGroup {
		/// Group DN pattern.
		dn: String,
		/// Membership attribute, `member` when omitted.
		#[serde(default = "member_attribute")]
		attribute: String,
	},
	/// True iff a chain of membership edges leads from `user_dn` to the
	/// group at the filled DN.
	InGroupNested {
		/// Target group DN pattern.
		dn: String,
		/// Membership attribute, `member` when omitted.
		#[serde(default = "member_attribute")]
		attribute: String,
		/// Traversal scope, whole-subtree when omitted.
		#[serde(default)]
		scope: NestedScope,
	},
	/// Negation; a non-boolean child negates to `true`.
	Not(Box<Query>),
	/// Conjunction with left-to-right short-circuit.
	And(Vec<Query>),
	/// Disjunction with left-to-right short-circuit.
	Or(Vec<Query>),
	/// String equality with multi-valued-attribute semantics.
	Equals(Box<Query>, Box<Query>),
	/// Regex match, bidirectional when both operands are multi-valued.
	Match {
		/// The string(s) matched against.
		subject: Box<Query>,
		/// The regex pattern(s).
		pattern: Box<Query>,
	},
	/// A template evaluated against the variable map.
	String(String),
	/// The value(s) of an attribute on the object at the filled DN.
	Attribute {
		/// DN pattern of the object.
		dn: String,
		/// Attribute name.
		name: String,
	},
}

impl Default for Query {
	fn default() -> Self {
		Query::Constant(true)
	}
}

impl From<&str> for Query {
	fn from(pattern: &str) -> Self {
		Query::String(pattern.to_owned())
	}
}

impl From<bool> for Query {
	fn from(value: bool) -> Self {
		Query::Constant(value)
	}
}

impl Query {
	/// Whether evaluating this query would read the `user_dn` binding,
	/// either through a group predicate or through template interpolation.
	#[must_use]
	pub fn reads_user_dn(&self) -> bool {
		const USER_DN: &str = "${user_dn}";
		match self {
			Query::Constant(_) => false,
			Query::For(arms) => arms.iter().any(|arm| arm.query.reads_user_dn()),
			Query::Exists { dn } => dn.contains(USER_DN),
			Query::InGroup { .. } | Query::InGroupNested { .. } => true,
			Query::Not(child) => child.reads_user_dn(),
			Query::And(children) | Query::Or(children) => {
				children.iter().any(Query::reads_user_dn)
			}
			Query::Equals(a, b) => a.reads_user_dn() || b.reads_user_dn(),
			Query::Match { subject, pattern } => {
				subject.reads_user_dn() || pattern.reads_user_dn()
			}
			Query::String(pattern) => pattern.contains(USER_DN),
			Query::Attribute { dn, .. } => dn.contains(USER_DN),
		}
	}
}

/// Mirror of [`Query`] carrying only the tagged shapes, so that the manual
/// deserializer can accept a bare string first and fall back to these.
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaggedQuery {
	Constant(bool),
	For(Vec<ForArm>),
	Exists {
		dn: String,
	},
	InGroup {
		dn: String,
		#[serde(default = "member_attribute")]
		attribute: String,
	},
	InGroupNested {
		dn: String,
		#[serde(default = "member_attribute")]
		attribute: String,
		#[serde(default)]
		scope: NestedScope,
	},
	Not(Box<Query>),
	And(Vec<Query>),
	Or(Vec<Query>),
	Equals(Box<Query>, Box<Query>),
	Match {
		subject: Box<Query>,
		pattern: Box<Query>,
	},
	String(String),
	Attribute {
		dn: String,
		name: String,
	},
}

impl From<TaggedQuery> for Query {
	fn from(tagged: TaggedQuery) -> Self {
		match tagged {
			TaggedQuery::Constant(b) => Query::Constant(b),
			TaggedQuery::For(arms) => Query::For(arms),
			TaggedQuery::Exists { dn } => Query::Exists { dn },
			TaggedQuery::InGroup { dn, attribute } => Query::InGroup { dn, attribute },
			TaggedQuery::InGroupNested { dn, attribute, scope } => {
				Query::InGroupNested { dn, attribute, scope }
			}
			TaggedQuery::Not(child) => Query::Not(child),
			TaggedQuery::And(children) => Query::And(children),
			TaggedQuery::Or(children) => Query::Or(children),
			TaggedQuery::Equals(a, b) => Query::Equals(a, b),
			TaggedQuery::Match { subject, pattern } => Query::Match { subject, pattern },
			TaggedQuery::String(pattern) => Query::String(pattern),
			TaggedQuery::Attribute { dn, name } => Query::Attribute { dn, name },
		}
	}
}

impl<'de> Deserialize<'de> for Query {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Repr {
			Bare(String),
			Tagged(TaggedQuery),
		}

		Ok(match Repr::deserialize(deserializer)? {
			Repr::Bare(pattern) => Query::String(pattern),
			Repr::Tagged(tagged) => tagged.into(),
		})
	}
}
