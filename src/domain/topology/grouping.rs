use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::domain::tuple::{Fields, Tuple, Value};

/// Chooses which tasks of the subscribing component receive a tuple.
///
/// Each source task owns its own prepared copy, obtained through `clone_box`.
pub trait Grouping: Send + Sync + fmt::Debug {
    /// Called once per source task before the first tuple is routed.
    /// `source_fields` is the schema of the subscribed stream and
    /// `target_tasks` every task index of the subscribing component.
    fn prepare(&mut self, source_fields: &Fields, target_tasks: &[usize]);

    fn choose_destinations(&self, tuple: &Tuple) -> Vec<usize>;

    fn clone_box(&self) -> Box<dyn Grouping>;
}

/// Spreads tuples evenly by cycling through the targets from a random start.
#[derive(Debug, Default)]
pub struct ShuffleGrouping {
    targets: Vec<usize>,
    next: AtomicUsize,
}

impl ShuffleGrouping {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Grouping for ShuffleGrouping {
    fn prepare(&mut self, _source_fields: &Fields, target_tasks: &[usize]) {
        self.targets = target_tasks.to_vec();
        let start = if self.targets.is_empty() { 0 } else { rand::rng().random_range(0..self.targets.len()) };
        self.next = AtomicUsize::new(start);
    }

    fn choose_destinations(&self, _tuple: &Tuple) -> Vec<usize> {
        if self.targets.is_empty() {
            return Vec::new();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        vec![self.targets[i]]
    }

    fn clone_box(&self) -> Box<dyn Grouping> {
        Box::new(ShuffleGrouping { targets: self.targets.clone(), next: AtomicUsize::new(self.next.load(Ordering::Relaxed)) })
    }
}

/// Routes equal key values to the same task.
#[derive(Debug, Clone)]
pub struct FieldsGrouping {
    keys: Fields,
    key_indices: Vec<usize>,
    targets: Vec<usize>,
}

impl FieldsGrouping {
    pub fn new(keys: Fields) -> Self {
        Self { keys, key_indices: Vec::new(), targets: Vec::new() }
    }
}

impl Grouping for FieldsGrouping {
    fn prepare(&mut self, source_fields: &Fields, target_tasks: &[usize]) {
        self.key_indices = self.keys.names().iter().filter_map(|k| source_fields.index_of(k)).collect();
        if self.key_indices.len() != self.keys.len() {
            log::warn!("Fields grouping on {:?} but stream only declares {:?}", self.keys, source_fields);
        }
        self.targets = target_tasks.to_vec();
    }

    fn choose_destinations(&self, tuple: &Tuple) -> Vec<usize> {
        if self.targets.is_empty() {
            return Vec::new();
        }
        let mut hasher = DefaultHasher::new();
        for &i in &self.key_indices {
            if let Some(value) = tuple.get(i) {
                hash_value(value, &mut hasher);
            }
        }
        let i = (hasher.finish() % self.targets.len() as u64) as usize;
        vec![self.targets[i]]
    }

    fn clone_box(&self) -> Box<dyn Grouping> {
        Box::new(self.clone())
    }
}

fn hash_value(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => b.hash(hasher),
        Value::Integer(i) => i.hash(hasher),
        Value::Float(f) => f.to_bits().hash(hasher),
        Value::Text(t) => t.hash(hasher),
        Value::Bytes(b) => b.hash(hasher),
    }
}

/// Replicates every tuple to every target task.
#[derive(Debug, Clone, Default)]
pub struct AllGrouping {
    targets: Vec<usize>,
}

impl AllGrouping {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Grouping for AllGrouping {
    fn prepare(&mut self, _source_fields: &Fields, target_tasks: &[usize]) {
        self.targets = target_tasks.to_vec();
    }

    fn choose_destinations(&self, _tuple: &Tuple) -> Vec<usize> {
        self.targets.clone()
    }

    fn clone_box(&self) -> Box<dyn Grouping> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values;

    fn tuple(word: &str) -> Tuple {
        let mut t = Tuple::new(Fields::new(["word", "n"]));
        t.set_values(values![word, 1]);
        t
    }

    #[test]
    fn test_shuffle_cycles_through_all_targets() {
        let mut grouping = ShuffleGrouping::new();
        grouping.prepare(&Fields::new(["word", "n"]), &[0, 1, 2]);

        let mut counts = [0; 3];
        for _ in 0..9 {
            let chosen = grouping.choose_destinations(&tuple("a"));
            assert_eq!(chosen.len(), 1);
            counts[chosen[0]] += 1;
        }
        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn test_fields_grouping_is_stable_per_key() {
        let mut grouping = FieldsGrouping::new(Fields::new(["word"]));
        grouping.prepare(&Fields::new(["word", "n"]), &[0, 1, 2, 3]);

        let first = grouping.choose_destinations(&tuple("storm"));
        for _ in 0..10 {
            assert_eq!(grouping.choose_destinations(&tuple("storm")), first);
        }
    }

    #[test]
    fn test_all_grouping_replicates() {
        let mut grouping = AllGrouping::new();
        grouping.prepare(&Fields::empty(), &[0, 1]);
        assert_eq!(grouping.choose_destinations(&tuple("x")), vec![0, 1]);
    }
}
