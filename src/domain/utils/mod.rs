pub mod constants;
pub mod id;
pub mod sync;
