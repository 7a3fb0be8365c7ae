pub mod envelope;
pub mod fields;
pub mod tuple;
pub mod value;

pub use envelope::Envelope;
pub use fields::Fields;
pub use tuple::{Tuple, TupleKind, WireTuple};
pub use value::Value;
