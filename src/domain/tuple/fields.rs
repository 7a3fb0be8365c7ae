use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Ordered field names of a stream. Cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Fields {
    names: Arc<[String]>,
}

impl Fields {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { names: names.into_iter().map(Into::into).collect() }
    }

    pub fn empty() -> Self {
        Self { names: Arc::from(Vec::new()) }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Pool key: tuples with the same signature are interchangeable.
    pub fn signature(&self) -> String {
        self.names.join(",")
    }
}

impl From<Vec<String>> for Fields {
    fn from(names: Vec<String>) -> Self {
        Self { names: names.into() }
    }
}

impl From<Fields> for Vec<String> {
    fn from(fields: Fields) -> Self {
        fields.names.to_vec()
    }
}

impl Default for Fields {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_and_lookup() {
        let fields = Fields::new(["word", "count"]);
        assert_eq!(fields.signature(), "word,count");
        assert_eq!(fields.index_of("count"), Some(1));
        assert!(!fields.contains("missing"));
        assert_ne!(fields.signature(), Fields::new(["count", "word"]).signature());
    }
}
