use std::collections::BTreeMap;

use crate::domain::tuple::Fields;
use crate::domain::utils::constants::DEFAULT_STREAM_ID;
use crate::domain::utils::id::StreamId;

/// Collects the output schema a component declares.
#[derive(Debug, Default)]
pub struct OutputFieldsDeclarer {
    streams: BTreeMap<StreamId, Fields>,
}

impl OutputFieldsDeclarer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, fields: Fields) {
        self.declare_stream(DEFAULT_STREAM_ID.clone(), fields);
    }

    pub fn declare_stream(&mut self, stream: impl Into<StreamId>, fields: Fields) {
        self.streams.insert(stream.into(), fields);
    }

    pub fn into_streams(self) -> BTreeMap<StreamId, Fields> {
        self.streams
    }
}
