use bytes::BytesMut;
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::domain::network::messages::NodeMessage;

/// Length-delimited framing with bincode payloads.
pub struct NodeCodec {
    codec: LengthDelimitedCodec,
}

impl NodeCodec {
    pub fn new() -> Self {
        Self { codec: LengthDelimitedCodec::new() }
    }
}

impl Default for NodeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<NodeMessage> for NodeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: NodeMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::serialize(&item).map_err(io::Error::other)?;
        self.codec.encode(bytes::Bytes::from(bytes), dst)
    }
}

impl Decoder for NodeCodec {
    type Item = NodeMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(bytes) => {
                let item = bincode::deserialize(&bytes).map_err(io::Error::other)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::coordination::node_descriptor::NodeDescriptor;
    use crate::domain::network::messages::{NodeBody, TupleBatch};
    use crate::domain::tuple::{Fields, Tuple};
    use crate::domain::utils::id::{ComponentId, TopologyId};
    use crate::values;

    #[test]
    fn test_decodes_frames_split_across_reads() {
        let mut tuple = Tuple::new(Fields::new(["word", "count"]));
        tuple.set_values(values!["storm", 2]);
        let message = NodeMessage::new(
            NodeDescriptor::new("a", 1, 2),
            NodeBody::Tuples(TupleBatch { topology_id: TopologyId::new("t"), component_id: ComponentId::new("count"), task_ids: vec![1, 3], tuple: tuple.to_wire() }),
        );

        let mut codec = NodeCodec::new();
        let mut encoded = BytesMut::new();
        codec.encode(message, &mut encoded).unwrap();

        let mut partial = encoded.split_to(encoded.len() / 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(encoded);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        match decoded.body {
            NodeBody::Tuples(batch) => {
                assert_eq!(batch.task_ids, vec![1, 3]);
                assert_eq!(batch.tuple.values, values!["storm", 2]);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }
}
