use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// String identifier tagged with the kind of thing it names, so a stream id
/// can never be passed where a component id is expected.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct Id<T> {
    pub id: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Id { id: id.into(), _marker: PhantomData }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

// Derived Clone would require `T: Clone` on the tag.
impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        Id::new(self.id.clone())
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl<T> From<Id<T>> for String {
    fn from(id_wrapper: Id<T>) -> Self {
        id_wrapper.id
    }
}

impl<T> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Id::new(value)
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full_name = std::any::type_name::<T>();
        let clean_name = full_name.split("::").last().unwrap_or(full_name);
        let display_name = clean_name.replace("Tag", "Id");

        write!(f, "{}: {:?}", display_name, self.id)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct ComponentTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct StreamTag;
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Copy)]
pub struct TopologyTag;

pub type ComponentId = Id<ComponentTag>;
pub type StreamId = Id<StreamTag>;
pub type TopologyId = Id<TopologyTag>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_names_the_id_kind() {
        let id = StreamId::new("default");
        assert_eq!(format!("{:?}", id), "StreamId: \"default\"");
        assert_eq!(id.to_string(), "default");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = TopologyId::new("wordcount");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"wordcount\"");

        let back: TopologyId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
