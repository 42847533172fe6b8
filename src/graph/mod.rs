//! Directed multigraph of every discovered node and its outgoing
//! key-pointers, plus tree-ownership edges from ROOT_ITEMs and the
//! superblock.
//!
//! The graph is populated once during the scan and is immutable after
//! [`Graph::final_check`]; the rebuild layer leans on both properties (it
//! shares the graph freely between readers and assumes a DAG).

use log::debug;
use rustc_hash::FxHashMap;

use crate::format::{ItemBody, Key, Node, NodeBody, Superblock};
use crate::{Error, Result};

/// What the graph remembers about one decodable node. Item keys carry their
/// stored body sizes so the rebuild layer can reason about coverage without
/// re-reading leaves.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub addr: u64,
    pub level: u8,
    pub generation: u64,
    pub owner: u64,
    pub num_items: u32,
    pub min_item: Key,
    pub max_item: Key,
    /// Leaf item keys with their body sizes; empty for interior nodes.
    pub items: Vec<(Key, u32)>,
}

/// One key-pointer, ROOT_ITEM or superblock edge. Exactly one of
/// `from_node` / `from_root` is nonzero, except for superblock edges where
/// both are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Leaf holding the ROOT_ITEM this edge came from, or zero.
    pub from_root: u64,
    /// Interior node holding the key-pointer this edge came from, or zero.
    pub from_node: u64,
    /// Slot of the originating key-pointer or item.
    pub from_item: usize,
    /// Tree the edge claims the target belongs to.
    pub from_tree: u64,
    pub to_node: u64,
    pub to_level: u8,
    /// Key-pointer key; zero key for root and superblock edges.
    pub to_key: Key,
    pub to_generation: u64,
}

impl Edge {
    /// Address of the node containing the originating pointer; zero for
    /// superblock edges.
    pub fn from_addr(&self) -> u64 {
        self.from_node | self.from_root
    }

    /// Whether this is a tree-internal key-pointer edge, as opposed to a
    /// tree-ownership edge from a ROOT_ITEM or the superblock.
    pub fn is_key_pointer(&self) -> bool {
        self.from_node != 0
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: FxHashMap<u64, GraphNode>,
    bad_nodes: FxHashMap<u64, Error>,
    /// Shared edge pool; the from/to indexes point into it.
    edges: Vec<Edge>,
    edges_from: FxHashMap<u64, Vec<u32>>,
    edges_to: FxHashMap<u64, Vec<u32>>,
    checked: bool,
}

impl Graph {
    /// Start a graph seeded with the superblock's four well-known tree
    /// edges.
    pub fn new(sb: &Superblock) -> Graph {
        let mut graph = Graph::default();
        for slot in sb.root_slots() {
            if slot.addr == 0 {
                continue;
            }
            graph.add_edge(Edge {
                from_root: 0,
                from_node: 0,
                from_item: 0,
                from_tree: slot.tree_id,
                to_node: slot.addr,
                to_level: slot.level,
                to_key: Key::ZERO,
                to_generation: slot.generation,
            });
        }
        graph
    }

    /// Register a decoded node and its outgoing edges.
    pub fn insert_node(&mut self, node: &Node) {
        assert!(!self.checked, "graph is immutable after final_check");
        let (min_item, max_item) = (node.min_key(), node.max_key());
        let items = match &node.body {
            NodeBody::Leaf(items) => items.iter().map(|it| (it.key, it.body_size)).collect(),
            NodeBody::Interior(_) => Vec::new(),
        };
        self.nodes.insert(
            node.addr(),
            GraphNode {
                addr: node.addr(),
                level: node.level(),
                generation: node.generation(),
                owner: node.owner(),
                num_items: node.num_items(),
                min_item,
                max_item,
                items,
            },
        );

        match &node.body {
            NodeBody::Interior(kps) => {
                for (slot, kp) in kps.iter().enumerate() {
                    if kp.block_ptr == 0 {
                        continue;
                    }
                    self.add_edge(Edge {
                        from_root: 0,
                        from_node: node.addr(),
                        from_item: slot,
                        from_tree: node.owner(),
                        to_node: kp.block_ptr,
                        to_level: node.level() - 1,
                        to_key: kp.key,
                        to_generation: kp.generation,
                    });
                }
            }
            NodeBody::Leaf(items) => {
                for (slot, item) in items.iter().enumerate() {
                    if let ItemBody::Root(ri) = &item.body {
                        if ri.byte_nr == 0 {
                            continue;
                        }
                        self.add_edge(Edge {
                            from_root: node.addr(),
                            from_node: 0,
                            from_item: slot,
                            from_tree: item.key.object_id,
                            to_node: ri.byte_nr,
                            to_level: ri.level,
                            to_key: Key::ZERO,
                            to_generation: ri.generation,
                        });
                    }
                }
            }
        }
    }

    /// Record a block that was pointed at but does not read as a node.
    pub fn insert_bad_node(&mut self, addr: u64, err: Error) {
        assert!(!self.checked, "graph is immutable after final_check");
        self.bad_nodes.entry(addr).or_insert(err);
    }

    fn add_edge(&mut self, edge: Edge) {
        assert!(!self.checked, "graph is immutable after final_check");
        assert_ne!(edge.to_node, 0, "edges must have a target");
        let idx = self.edges.len() as u32;
        self.edges.push(edge);
        self.edges_from.entry(edge.from_addr()).or_default().push(idx);
        self.edges_to.entry(edge.to_node).or_default().push(idx);
    }

    pub fn node(&self, addr: u64) -> Option<&GraphNode> {
        self.nodes.get(&addr)
    }

    pub fn bad_node(&self, addr: u64) -> Option<&Error> {
        self.bad_nodes.get(&addr)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    /// Edges leaving the node at `addr` (key-pointers and ROOT_ITEMs it
    /// contains). Superblock edges live under address zero.
    pub fn edges_from(&self, addr: u64) -> impl Iterator<Item = &Edge> {
        self.edges_from
            .get(&addr)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.edges[idx as usize])
    }

    pub fn edges_to(&self, addr: u64) -> impl Iterator<Item = &Edge> {
        self.edges_to
            .get(&addr)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.edges[idx as usize])
    }

    pub fn all_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// Validate the finished graph: every edge target must be a known node
    /// or classifiable as a read failure via `probe`, and the key-pointer
    /// structure must be acyclic. Succeeding marks the graph immutable.
    ///
    /// `probe` returns the read error for an address, or `None` if the block
    /// reads fine; a readable target the scan never registered means the
    /// scan itself is broken, which is fatal.
    pub fn final_check<F>(&mut self, mut probe: F) -> Result<()>
    where
        F: FnMut(u64) -> Option<Error>,
    {
        let dangling: Vec<u64> = self
            .edges
            .iter()
            .map(|e| e.to_node)
            .filter(|to| !self.nodes.contains_key(to) && !self.bad_nodes.contains_key(to))
            .collect();
        for addr in dangling {
            if self.bad_nodes.contains_key(&addr) {
                continue;
            }
            match probe(addr) {
                Some(err) => {
                    debug!("graph: edge target {:#x} is unreadable: {}", addr, err);
                    self.bad_nodes.insert(addr, err);
                }
                None => panic!(
                    "graph: edge target {:#x} reads as a node but was never scanned",
                    addr
                ),
            }
        }

        self.check_acyclic()?;
        self.checked = true;
        Ok(())
    }

    /// Three-color depth-first search over key-pointer and root edges.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color: FxHashMap<u64, Color> = FxHashMap::default();

        for &start in self.nodes.keys() {
            if color.get(&start).copied().unwrap_or(Color::White) != Color::White {
                continue;
            }
            // Iterative DFS; each frame is (addr, next edge cursor).
            let mut stack: Vec<(u64, usize)> = vec![(start, 0)];
            color.insert(start, Color::Gray);
            while let Some(&(addr, cursor)) = stack.last() {
                match self.edges_from(addr).map(|e| e.to_node).nth(cursor) {
                    None => {
                        color.insert(addr, Color::Black);
                        stack.pop();
                    }
                    Some(to) => {
                        stack.last_mut().unwrap().1 += 1;
                        if !self.nodes.contains_key(&to) {
                            continue;
                        }
                        match color.get(&to).copied().unwrap_or(Color::White) {
                            Color::Gray => return Err(Error::Loop { addr: to }),
                            Color::Black => {}
                            Color::White => {
                                color.insert(to, Color::Gray);
                                stack.push((to, 0));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
