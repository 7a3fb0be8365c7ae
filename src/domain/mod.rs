pub mod cluster;
pub mod coordination;
pub mod metrics;
pub mod network;
pub mod node;
pub mod recycle;
pub mod topology;
pub mod tuple;
pub mod utils;
