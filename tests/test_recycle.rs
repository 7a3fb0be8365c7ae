use stream_node::domain::recycle::{RecycleError, RecycleStation};
use stream_node::domain::tuple::{Fields, Value};
use stream_node::domain::utils::id::{ComponentId, TopologyId};
use stream_node::values;

#[test]
fn test_station_reuses_pools_by_field_signature() {
    let station = RecycleStation::new();
    let words = station.tuple_pool(&Fields::new(["word", "count"]));
    let again = station.tuple_pool(&Fields::new(["word", "count"]));
    let other = station.tuple_pool(&Fields::new(["n"]));

    assert_eq!(words.shape(), again.shape());
    assert_ne!(words.shape(), other.shape());

    let first = words.acquire();
    first.write().set_values(values!["a", 1]);
    assert!(first.release(1).unwrap());

    let second = again.acquire();
    assert!(second.ptr_eq(&first));
    assert!(second.read().values().iter().all(Value::is_null));
    assert_eq!(words.stats().reused, 1);
}

#[test]
fn test_recycled_envelope_returns_its_tuple_share() {
    let station = RecycleStation::new();
    let tuple = station.tuple_pool(&Fields::new(["n"])).acquire();
    tuple.write().set_values(values![7]);

    let envelope = station.envelope_pool().acquire();
    envelope.write().bind(&tuple, [0, 1, 2], ComponentId::new("sink"), TopologyId::new("t")).unwrap();
    assert_eq!(tuple.ref_count(), 2);

    // Two local deliveries each take a share, the emitter drops its own.
    tuple.share(2).unwrap();
    envelope.write().remove_task_ids(&[0, 1]);
    assert!(!envelope.read().is_delivered());
    envelope.write().remove_task_ids(&[2]);
    assert!(envelope.read().is_delivered());
    assert!(!tuple.release(1).unwrap());

    assert!(envelope.release(1).unwrap());
    assert_eq!(tuple.ref_count(), 2);
    assert!(envelope.read().tuple().is_none());

    assert!(!tuple.release(1).unwrap());
    assert!(tuple.release(1).unwrap());
    assert_eq!(tuple.ref_count(), 0);

    assert!(matches!(tuple.share(1), Err(RecycleError::Reclaimed { .. })));
    assert!(matches!(tuple.release(1), Err(RecycleError::Underflow { .. })));
}
