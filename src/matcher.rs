//! Request path matching.
//!
//! Resolves a request path to the mock definition that answers it.

use crate::catalog::MockDefinition;
use std::collections::HashMap;

/// Path matcher built over a catalog's definitions.
///
/// Equivalent to scanning the definitions in load order and returning the
/// first exact match, including for duplicate paths.
#[derive(Debug, Default)]
pub struct Matcher {
    /// Path -> position of the first definition with that path
    index: HashMap<String, usize>,
}

impl Matcher {
    /// Create a new matcher from definitions in load order.
    pub fn new(definitions: &[MockDefinition]) -> Self {
        let mut index = HashMap::with_capacity(definitions.len());
        for (idx, def) in definitions.iter().enumerate() {
            index.entry(def.path.clone()).or_insert(idx);
        }
        Self { index }
    }

    /// Find the definition answering `path`.
    ///
    /// `definitions` must be the slice the matcher was built from.
    pub fn find_match<'a>(
        &self,
        definitions: &'a [MockDefinition],
        path: &str,
    ) -> Option<&'a MockDefinition> {
        self.index.get(path).and_then(|&idx| definitions.get(idx))
    }
}

/// Decode a percent-encoded request path.
///
/// Paths that do not decode to UTF-8 are matched verbatim.
pub fn decode_path(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}
