//! Device scan: every mapped logical address is tried as a tree node, and
//! everything that decodes is registered in the node graph together with its
//! outgoing edges. Runs strictly before any rebuild work; the returned graph
//! has already passed its final check and is immutable.

use log::{debug, info};

use crate::cancel::CancelToken;
use crate::config::SalvageConfiguration;
use crate::graph::Graph;
use crate::node_source::{ByteReader, NodeExpectations, NodeSource};
use crate::Result;

/// Scan the whole mapped space and build the checked node graph. Candidate
/// addresses advance by the configured scan chunk size, defaulting to one
/// node size.
pub fn scan_device<R: ByteReader>(
    source: &NodeSource<R>,
    config: &SalvageConfiguration,
    cancel: &CancelToken,
) -> Result<Graph> {
    let node_size = source.node_size() as u64;
    let step = match config.scan_chunk_size {
        0 => node_size,
        step => step,
    };
    let mut graph = Graph::new(source.superblock());
    let mut candidates = 0u64;

    for region in source.reader().mapped_regions() {
        let mut addr = region.start;
        while addr + node_size <= region.end {
            cancel.check()?;
            candidates += 1;
            let exp = NodeExpectations { addr: Some(addr), ..Default::default() };
            match source.node(addr, &exp) {
                Ok(node) => graph.insert_node(&node),
                // Most candidate addresses are data, free space or garbage;
                // only blocks something points at get remembered as bad, in
                // the final check below.
                Err(err) => debug!("scan: {:#x} is not a node: {}", addr, err),
            }
            addr += step;
        }
    }

    info!(
        "scan: {} nodes in {} candidate blocks",
        graph.node_count(),
        candidates
    );
    graph.final_check(|addr| source.probe(addr))?;
    Ok(graph)
}
