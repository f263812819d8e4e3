use std::ops::Range;

use crate::Map;
use crate::bitmap::Bitmap;
use crate::error::invalid_input;
use crate::hostlist;

/// Hardware geometry of one node as known by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub sockets: u16,
    /// Cores per socket
    pub cores: u16,
    /// Threads per core
    pub threads: u16,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>, sockets: u16, cores: u16, threads: u16) -> Self {
        NodeRecord {
            name: name.into(),
            sockets,
            cores,
            threads,
        }
    }

    #[inline]
    pub fn total_cores(&self) -> u32 {
        self.sockets as u32 * self.cores as u32
    }

    #[inline]
    pub fn cpus(&self) -> u32 {
        self.total_cores() * self.threads.max(1) as u32
    }
}

/// Node table owned by the controller; bit positions of node bitmaps index into it.
#[derive(Debug, Clone, Default)]
pub struct NodeTable {
    nodes: Vec<NodeRecord>,
    index: Map<String, usize>,
}

impl NodeTable {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.name.clone(), i))
            .collect();
        NodeTable { nodes, index }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&NodeRecord> {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(index)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }

    /// Resolves a hostlist expression into a bitmap sized to the table.
    pub fn names_to_bitmap(&self, expression: &str) -> crate::Result<Bitmap> {
        let mut bitmap = Bitmap::new(self.len());
        for name in hostlist::expand(expression)? {
            match self.find(&name) {
                Some(index) => bitmap.set(index),
                None => return invalid_input(format!("node `{name}` does not exist")),
            }
        }
        Ok(bitmap)
    }

    pub fn bitmap_to_names(&self, bitmap: &Bitmap) -> String {
        let names: Vec<&str> = bitmap
            .ones()
            .filter_map(|index| self.get(index).map(|node| node.name.as_str()))
            .collect();
        hostlist::compress(&names)
    }

    pub fn core_layout(&self) -> CoreLayout {
        CoreLayout::new(self)
    }
}

/// Position of every node's cores inside a cluster-wide core bitmap.
#[derive(Debug, Clone, Default)]
pub struct CoreLayout {
    offsets: Vec<usize>,
    total: usize,
}

impl CoreLayout {
    pub fn new(table: &NodeTable) -> Self {
        let mut offsets = Vec::with_capacity(table.len() + 1);
        let mut total = 0;
        for node in table.iter() {
            offsets.push(total);
            total += node.total_cores() as usize;
        }
        offsets.push(total);
        CoreLayout { offsets, total }
    }

    #[inline]
    pub fn total_cores(&self) -> usize {
        self.total
    }

    /// Core bits of the given node; empty for unknown nodes.
    pub fn node_range(&self, node: usize) -> Range<usize> {
        match (self.offsets.get(node), self.offsets.get(node + 1)) {
            (Some(start), Some(end)) => *start..*end,
            _ => self.total..self.total,
        }
    }

    #[inline]
    pub fn bits_per_node(&self, node: usize) -> usize {
        self.node_range(node).len()
    }

    pub fn new_bitmap(&self) -> Bitmap {
        Bitmap::new(self.total)
    }
}
