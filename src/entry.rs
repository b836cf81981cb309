//! Helper methods for extracting data from search results.
use ldap3::SearchEntry;

/// An extension trait for [`SearchEntry`] that provides convenience methods
/// for extracting attribute data.
pub trait SearchEntryExt {
	/// Get every value of an attribute, in directory order. Empty when the
	/// attribute is absent.
	fn attr_values(&self, attr: &str) -> &[String];
}

impl SearchEntryExt for SearchEntry {
	fn attr_values(&self, attr: &str) -> &[String] {
		self.attrs.get(attr).map(Vec::as_slice).unwrap_or_default()
	}
}
