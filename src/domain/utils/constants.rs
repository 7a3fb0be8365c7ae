use lazy_static::lazy_static;

use crate::domain::tuple::fields::Fields;
use crate::domain::utils::id::{ComponentId, StreamId};

/// Log target for structured analytics events (metrics samples).
pub const ANALYTICS_TARGET: &str = "analytics";

lazy_static! {
    /// Source component of runtime-generated tuples (ticks).
    pub static ref SYSTEM_COMPONENT_ID: ComponentId = ComponentId::new("__system");

    /// Stream on which tick tuples are delivered.
    pub static ref SYSTEM_TICK_STREAM_ID: StreamId = StreamId::new("__tick");

    /// Stream used when a component declares outputs without naming a stream.
    pub static ref DEFAULT_STREAM_ID: StreamId = StreamId::new("default");

    pub static ref TICK_FIELDS: Fields = Fields::new(["tick"]);

    /// Shape of the TERMINATE markers that drain a topology on shutdown.
    pub static ref TERMINATE_FIELDS: Fields = Fields::new(["__terminate"]);
}
