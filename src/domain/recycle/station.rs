use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::recycle::{PoolStats, RecyclePool};
use crate::domain::tuple::{Envelope, Fields, Tuple};
use crate::domain::utils::sync::{read, write};

/// Registry of the pools a node uses on its data path: one tuple pool per
/// field signature and a single envelope pool.
///
/// Created when a node starts and shared with every local cluster it hosts.
#[derive(Debug)]
pub struct RecycleStation {
    tuples: RwLock<HashMap<String, RecyclePool<Tuple>>>,
    envelopes: RecyclePool<Envelope>,
}

impl RecycleStation {
    pub fn new() -> Self {
        Self { tuples: RwLock::new(HashMap::new()), envelopes: RecyclePool::new("envelope", Envelope::default) }
    }

    /// Returns the pool for `fields`, creating it on first use.
    pub fn tuple_pool(&self, fields: &Fields) -> RecyclePool<Tuple> {
        let signature = fields.signature();
        if let Some(pool) = read(&self.tuples).get(&signature) {
            return pool.clone();
        }

        let mut tuples = write(&self.tuples);
        tuples
            .entry(signature.clone())
            .or_insert_with(|| {
                log::debug!("Creating tuple pool for shape [{}]", signature);
                let fields = fields.clone();
                RecyclePool::new(signature, move || Tuple::new(fields.clone()))
            })
            .clone()
    }

    pub fn envelope_pool(&self) -> &RecyclePool<Envelope> {
        &self.envelopes
    }

    /// Per-shape pool statistics, envelope pool included.
    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<_> = read(&self.tuples).iter().map(|(shape, pool)| (shape.clone(), pool.stats())).collect();
        stats.push(("envelope".to_string(), self.envelopes.stats()));
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

impl Default for RecycleStation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_are_keyed_by_signature() {
        let station = RecycleStation::new();
        let a = station.tuple_pool(&Fields::new(["word"]));
        let b = station.tuple_pool(&Fields::new(["word"]));
        let c = station.tuple_pool(&Fields::new(["word", "count"]));

        let tuple = a.acquire();
        tuple.release(1).unwrap();
        assert_eq!(b.stats().reclaimed, 1, "same signature must share a pool");
        assert_eq!(c.stats().reclaimed, 0);
        assert_eq!(c.acquire().read().fields().len(), 2);
    }
}
