//! Variable maps and `${var}` template substitution.

use std::sync::OnceLock;

use regex::{Captures, Regex};

/// An ordered association of variable names to values.
///
/// Bindings are looked up front to back, so the first binding of a name wins
/// and later pushes of the same name are shadowed.
#[derive(Debug, Clone, Default)]
pub struct Vars(Vec<(String, String)>);

impl Vars {
	/// Create an empty variable map.
	#[must_use]
	pub fn new() -> Self {
		Vars(Vec::new())
	}

	/// Append a binding.
	pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.0.push((name.into(), value.into()));
	}

	/// Builder-style [`push`](Self::push).
	#[must_use]
	pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.push(name, value);
		self
	}

	/// Look up the first binding of `name`.
	#[must_use]
	pub fn get(&self, name: &str) -> Option<&str> {
		self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
	}

	/// Whether `name` is bound.
	#[must_use]
	pub fn contains(&self, name: &str) -> bool {
		self.get(name).is_some()
	}
}

/// Matches a `${name}` placeholder; the capture is the name.
fn placeholder() -> &'static Regex {
	static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
	PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("placeholder regex is valid"))
}

/// Substitute every `${name}` in `pattern` from `vars`.
///
/// Unbound names fill as the empty string. The filler knows nothing about
/// LDAP syntax; callers escape the result where filter hygiene demands it.
#[must_use]
pub fn fill(pattern: &str, vars: &Vars) -> String {
	placeholder()
		.replace_all(pattern, |caps: &Captures<'_>| {
			vars.get(&caps[1]).unwrap_or_default().to_owned()
		})
		.into_owned()
}
