use std::collections::BTreeSet;

use crate::domain::recycle::{Pooled, Recyclable, RecycleError};
use crate::domain::tuple::tuple::Tuple;
use crate::domain::utils::id::{ComponentId, TopologyId};

/// Binds one tuple to the destination tasks that have not accepted it yet.
///
/// The envelope holds one share of its tuple from [`Envelope::bind`] until it
/// is recycled.
#[derive(Debug, Default)]
pub struct Envelope {
    tuple: Option<Pooled<Tuple>>,
    task_ids: BTreeSet<usize>,
    component_id: Option<ComponentId>,
    topology_id: Option<TopologyId>,
}

impl Envelope {
    pub fn bind(&mut self, tuple: &Pooled<Tuple>, task_ids: impl IntoIterator<Item = usize>, component_id: ComponentId, topology_id: TopologyId) -> Result<(), RecycleError> {
        tuple.share(1)?;
        self.tuple = Some(tuple.clone());
        self.task_ids = task_ids.into_iter().collect();
        self.component_id = Some(component_id);
        self.topology_id = Some(topology_id);
        Ok(())
    }

    pub fn tuple(&self) -> Option<&Pooled<Tuple>> {
        self.tuple.as_ref()
    }

    pub fn task_ids(&self) -> &BTreeSet<usize> {
        &self.task_ids
    }

    pub fn remove_task_ids<'a>(&mut self, delivered: impl IntoIterator<Item = &'a usize>) {
        for task in delivered {
            self.task_ids.remove(task);
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.task_ids.is_empty()
    }

    pub fn component_id(&self) -> Option<&ComponentId> {
        self.component_id.as_ref()
    }

    pub fn topology_id(&self) -> Option<&TopologyId> {
        self.topology_id.as_ref()
    }
}

impl Recyclable for Envelope {
    fn recycle(&mut self) {
        if let Some(tuple) = self.tuple.take() {
            if let Err(e) = tuple.release(1) {
                log::error!("Envelope released its tuple twice: {}", e);
            }
        }
        self.task_ids.clear();
        self.component_id = None;
        self.topology_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recycle::RecyclePool;
    use crate::domain::tuple::fields::Fields;

    #[test]
    fn test_envelope_holds_and_returns_one_share() {
        let fields = Fields::new(["n"]);
        let tuples = RecyclePool::new(fields.signature(), move || Tuple::new(fields.clone()));
        let envelopes = RecyclePool::new("envelope", Envelope::default);

        let tuple = tuples.acquire();
        let envelope = envelopes.acquire();
        envelope.write().bind(&tuple, [0, 2], ComponentId::new("sink"), TopologyId::new("t")).unwrap();
        assert_eq!(tuple.ref_count(), 2);

        envelope.write().remove_task_ids(&[0, 2]);
        assert!(envelope.read().is_delivered());

        assert!(envelope.release(1).unwrap());
        assert_eq!(tuple.ref_count(), 1);
        assert!(tuple.release(1).unwrap());
        assert_eq!(tuples.stats().reclaimed, 1);
    }
}
