use serde::{Deserialize, Serialize};

use crate::domain::recycle::Recyclable;
use crate::domain::tuple::fields::Fields;
use crate::domain::tuple::value::Value;
use crate::domain::utils::id::{ComponentId, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TupleKind {
    #[default]
    Application,
    Terminate,
    Freeze,
    Checkpoint,
    Precycle,
    Tick,
}

/// A stream record: named fields plus provenance.
///
/// Tuples are pooled per field signature, so `fields` stays fixed for the
/// lifetime of the allocation and only values and provenance are cleared.
#[derive(Debug, Clone)]
pub struct Tuple {
    fields: Fields,
    values: Vec<Value>,
    source_component: Option<ComponentId>,
    source_stream: Option<StreamId>,
    source_task: Option<usize>,
    kind: TupleKind,
}

impl Tuple {
    pub fn new(fields: Fields) -> Self {
        let values = vec![Value::Null; fields.len()];
        Self { fields, values, source_component: None, source_stream: None, source_task: None, kind: TupleKind::Application }
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_field(&self, name: &str) -> Option<&Value> {
        self.fields.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Copies `values` in field order; missing trailing values stay `Null`
    /// and surplus ones are ignored.
    pub fn set_values(&mut self, values: impl IntoIterator<Item = Value>) {
        for (slot, value) in self.values.iter_mut().zip(values) {
            *slot = value;
        }
    }

    pub fn set_source(&mut self, component: ComponentId, stream: StreamId, task: usize) {
        self.source_component = Some(component);
        self.source_stream = Some(stream);
        self.source_task = Some(task);
    }

    pub fn source_component(&self) -> Option<&ComponentId> {
        self.source_component.as_ref()
    }

    pub fn source_stream(&self) -> Option<&StreamId> {
        self.source_stream.as_ref()
    }

    pub fn source_task(&self) -> Option<usize> {
        self.source_task
    }

    pub fn kind(&self) -> TupleKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: TupleKind) {
        self.kind = kind;
    }

    pub fn is_tick(&self) -> bool {
        self.kind == TupleKind::Tick
    }

    pub fn to_wire(&self) -> WireTuple {
        WireTuple {
            fields: self.fields.clone(),
            values: self.values.clone(),
            source_component: self.source_component.clone(),
            source_stream: self.source_stream.clone(),
            source_task: self.source_task,
            kind: self.kind,
        }
    }

    /// Overwrites this tuple with a received one of the same shape.
    pub fn fill_from_wire(&mut self, wire: WireTuple) {
        self.set_values(wire.values);
        self.source_component = wire.source_component;
        self.source_stream = wire.source_stream;
        self.source_task = wire.source_task;
        self.kind = wire.kind;
    }
}

impl Recyclable for Tuple {
    fn recycle(&mut self) {
        for value in self.values.iter_mut() {
            *value = Value::Null;
        }
        self.source_component = None;
        self.source_stream = None;
        self.source_task = None;
        self.kind = TupleKind::Application;
    }
}

/// Owned copy of a tuple as it travels between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTuple {
    pub fields: Fields,
    pub values: Vec<Value>,
    pub source_component: Option<ComponentId>,
    pub source_stream: Option<StreamId>,
    pub source_task: Option<usize>,
    pub kind: TupleKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values;

    #[test]
    fn test_recycle_clears_values_and_provenance() {
        let mut tuple = Tuple::new(Fields::new(["word", "count"]));
        tuple.set_values(values!["storm", 3]);
        tuple.set_source(ComponentId::new("split"), StreamId::new("default"), 2);
        tuple.set_kind(TupleKind::Tick);

        tuple.recycle();

        assert!(tuple.values().iter().all(Value::is_null));
        assert_eq!(tuple.source_component(), None);
        assert_eq!(tuple.source_task(), None);
        assert_eq!(tuple.kind(), TupleKind::Application);
        assert_eq!(tuple.fields().len(), 2);
    }

    #[test]
    fn test_lookup_by_field_name() {
        let mut tuple = Tuple::new(Fields::new(["word", "count"]));
        tuple.set_values(values!["storm", 3, "ignored"]);
        assert_eq!(tuple.get_by_field("count"), Some(&Value::Integer(3)));
        assert_eq!(tuple.values().len(), 2);
    }
}
