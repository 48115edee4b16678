use crate::bucket::{BucketChain, PacketRef};
use crate::keys::{KeyType, IP_VERS_4, IP_VERS_6};
use crate::packet::packet_parse;
use crate::splay::SplayTree;

/// The in-memory indices for one bucket chain: the flow tree plus the six
/// five-tuple projection trees. Built by the indexer, consumed by the
/// writer.
#[derive(Debug, Default)]
pub struct IndexSet {
    pub packet_cnt: u64,
    /// Keyed by full five-tuple; each node owns the flow's packet list
    /// (the key packet itself is not in the list).
    pub flows: SplayTree<Vec<PacketRef>>,
    /// Projection trees hold flow-node ids in first-appearance order.
    pub srcv4: SplayTree<Vec<u32>>,
    pub dstv4: SplayTree<Vec<u32>>,
    pub srcv6: SplayTree<Vec<u32>>,
    pub dstv6: SplayTree<Vec<u32>>,
    pub srcport: SplayTree<Vec<u32>>,
    pub dstport: SplayTree<Vec<u32>>,
    /// Flow node ids in the order their first packet arrived.
    pub timeorder: Vec<u32>,
}

impl IndexSet {
    pub fn flow_cnt(&self) -> u64 {
        self.flows.len()
    }

    pub fn projection(&self, kt: KeyType) -> &SplayTree<Vec<u32>> {
        match kt {
            KeyType::SrcV4 => &self.srcv4,
            KeyType::DstV4 => &self.dstv4,
            KeyType::SrcV6 => &self.srcv6,
            KeyType::DstV6 => &self.dstv6,
            KeyType::SrcPort => &self.srcport,
            KeyType::DstPort => &self.dstport,
            KeyType::Flow => unreachable!("the flow tree is not a projection"),
        }
    }

    pub fn projection_mut(&mut self, kt: KeyType) -> &mut SplayTree<Vec<u32>> {
        match kt {
            KeyType::SrcV4 => &mut self.srcv4,
            KeyType::DstV4 => &mut self.dstv4,
            KeyType::SrcV6 => &mut self.srcv6,
            KeyType::DstV6 => &mut self.dstv6,
            KeyType::SrcPort => &mut self.srcport,
            KeyType::DstPort => &mut self.dstport,
            KeyType::Flow => unreachable!("the flow tree is not a projection"),
        }
    }
}

/// Parse and index every packet in the chain. On return the chain carries
/// a populated `IndexSet` and updated parse stats.
pub fn index_chain(chain: &mut BucketChain) {
    let mut idxs = IndexSet::default();
    let mut stats = std::mem::take(&mut chain.stats);

    let refs: Vec<PacketRef> = chain.refs().collect();
    for r in refs {
        let tuple = packet_parse(chain.packet_bytes(r), &mut stats);
        chain.buckets[r.bucket as usize].records_mut()[r.rec as usize].tuple = tuple;

        idxs.packet_cnt += 1;

        // Find (or create) the flow this packet belongs to. The insert
        // leaves the flow node at the tree root.
        let (flow_id, new_flow) = idxs
            .flows
            .insert(r, |a, b| chain.tuple(a).cmp_flow(chain.tuple(b)));

        if !new_flow {
            idxs.flows.node_mut(flow_id).payload.push(r);
            continue;
        }

        // First packet of a new flow: register it with every projection.
        idxs.timeorder.push(flow_id);

        match tuple.src.vers {
            IP_VERS_4 => project(&mut idxs.srcv4, chain, r, flow_id, KeyType::SrcV4),
            IP_VERS_6 => project(&mut idxs.srcv6, chain, r, flow_id, KeyType::SrcV6),
            // Non-IP flows are only reachable through the flow and port
            // indexes.
            _ => {}
        }
        match tuple.dst.vers {
            IP_VERS_4 => project(&mut idxs.dstv4, chain, r, flow_id, KeyType::DstV4),
            IP_VERS_6 => project(&mut idxs.dstv6, chain, r, flow_id, KeyType::DstV6),
            _ => {}
        }
        project(&mut idxs.srcport, chain, r, flow_id, KeyType::SrcPort);
        project(&mut idxs.dstport, chain, r, flow_id, KeyType::DstPort);
    }

    chain.stats = stats;
    chain.indexes = Some(idxs);
}

fn project(
    tree: &mut SplayTree<Vec<u32>>,
    chain: &BucketChain,
    key: PacketRef,
    flow_id: u32,
    kt: KeyType,
) {
    let (node, _) = tree.insert(key, |a, b| chain.tuple(a).cmp_key(chain.tuple(b), kt));
    tree.node_mut(node).payload.push(flow_id);
}
