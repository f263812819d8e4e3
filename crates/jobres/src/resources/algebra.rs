//! Set algebra over the core bitmaps of two job resources.
use crate::bitmap::Bitmap;
use crate::error::inconsistency;
use crate::resources::JobResources;

fn cores_of(geometry: &[(u16, u16)], index: usize) -> usize {
    geometry
        .get(index)
        .map(|(sockets, cores)| *sockets as usize * *cores as usize)
        .unwrap_or(0)
}

struct UnionNode {
    geometry: (u16, u16),
    /// Offset of the node in the first operand's core bitmap
    first: Option<usize>,
    /// Offset and core count of the node in the second operand's core bitmap
    second: Option<(usize, usize)>,
}

impl JobResources {
    /// Masks our cores with the cores of `other`.
    ///
    /// Cores of nodes that are allocated only to us are cleared; `node_bitmap` itself is not
    /// narrowed. On a core count mismatch of a shared node the common prefix is masked and an
    /// error is returned after the whole walk.
    pub fn and(&mut self, other: &JobResources) -> crate::Result<()> {
        let empty = Bitmap::default();
        let nodes1 = self.node_bitmap.clone().unwrap_or_default();
        let nodes2 = other.node_bitmap.as_ref().unwrap_or(&empty);
        let geometry1: Vec<(u16, u16)> = self.geometry().collect();
        let geometry2: Vec<(u16, u16)> = other.geometry().collect();
        let cores2 = other.core_bitmap.as_ref().unwrap_or(&empty);

        let mut mismatch = None;
        let (mut offset1, mut offset2) = (0usize, 0usize);
        let (mut index1, mut index2) = (0usize, 0usize);
        let last = nodes1.len().max(nodes2.len());

        for node in 0..last {
            let (in1, in2) = (nodes1.test(node), nodes2.test(node));
            match (in1, in2) {
                (true, true) => {
                    let count1 = cores_of(&geometry1, index1);
                    let count2 = cores_of(&geometry2, index2);
                    if count1 != count2 {
                        log::error!(
                            "Core count mismatch for node {node} in job resources AND ({count1} != {count2})"
                        );
                        mismatch.get_or_insert(format!(
                            "node {node} has {count1} cores in the first operand and {count2} in the second"
                        ));
                    }
                    if let Some(cores1) = self.core_bitmap.as_mut() {
                        for i in 0..count1.min(count2) {
                            if cores1.test(offset1 + i) && !cores2.test(offset2 + i) {
                                cores1.clear(offset1 + i);
                            }
                        }
                    }
                    offset1 += count1;
                    offset2 += count2;
                    index1 += 1;
                    index2 += 1;
                }
                (true, false) => {
                    let count1 = cores_of(&geometry1, index1);
                    if let Some(cores1) = self.core_bitmap.as_mut() {
                        cores1.clear_range(offset1..offset1 + count1);
                    }
                    offset1 += count1;
                    index1 += 1;
                }
                (false, true) => {
                    offset2 += cores_of(&geometry2, index2);
                    index2 += 1;
                }
                (false, false) => {}
            }
        }

        match mismatch {
            Some(message) => inconsistency(message),
            None => Ok(()),
        }
    }

    /// Replaces our node set, geometry and core bitmap with the union of both operands.
    ///
    /// `core_bitmap_used`, `cpus`, `cpus_used`, `memory_*`, `cpu_array_*` and `nhosts` are left
    /// untouched and are stale afterwards; callers have to regenerate them.
    pub fn or(&mut self, other: &JobResources) -> crate::Result<()> {
        let empty = Bitmap::default();
        let nodes1 = self.node_bitmap.as_ref().unwrap_or(&empty);
        let nodes2 = other.node_bitmap.as_ref().unwrap_or(&empty);
        let geometry1: Vec<(u16, u16)> = self.geometry().collect();
        let geometry2: Vec<(u16, u16)> = other.geometry().collect();

        let node_count = nodes1.len().max(nodes2.len());
        let mut new_nodes = Bitmap::new(node_count);
        let mut union: Vec<UnionNode> = Vec::new();
        let mut mismatch = None;
        let (mut offset1, mut offset2) = (0usize, 0usize);
        let (mut index1, mut index2) = (0usize, 0usize);

        for node in 0..node_count {
            let (in1, in2) = (nodes1.test(node), nodes2.test(node));
            if !in1 && !in2 {
                continue;
            }
            new_nodes.set(node);
            let mut entry = UnionNode {
                geometry: (0, 0),
                first: None,
                second: None,
            };
            if in2 {
                let count2 = cores_of(&geometry2, index2);
                entry.geometry = geometry2.get(index2).copied().unwrap_or((0, 0));
                entry.second = Some((offset2, count2));
                offset2 += count2;
                index2 += 1;
            }
            if in1 {
                let count1 = cores_of(&geometry1, index1);
                entry.geometry = geometry1.get(index1).copied().unwrap_or((0, 0));
                entry.first = Some(offset1);
                if let Some((_, count2)) = entry.second {
                    if count1 != count2 {
                        log::error!(
                            "Core count mismatch for node {node} in job resources OR ({count1} != {count2})"
                        );
                        mismatch.get_or_insert(format!(
                            "node {node} has {count1} cores in the first operand and {count2} in the second"
                        ));
                    }
                }
                offset1 += count1;
                index1 += 1;
            }
            union.push(entry);
        }

        let mut result = JobResources::default();
        for entry in &union {
            result.push_geometry(entry.geometry.0, entry.geometry.1);
        }
        let mut new_cores = Bitmap::new(result.geometry_core_count());
        let cores1 = self.core_bitmap.as_ref().unwrap_or(&empty);
        let cores2 = other.core_bitmap.as_ref().unwrap_or(&empty);
        let mut offset = 0usize;
        for entry in &union {
            let count = entry.geometry.0 as usize * entry.geometry.1 as usize;
            if let Some(start) = entry.first {
                for i in (0..count).filter(|i| cores1.test(start + i)) {
                    new_cores.set(offset + i);
                }
            }
            if let Some((start, count2)) = entry.second {
                for i in (0..count.min(count2)).filter(|i| cores2.test(start + i)) {
                    new_cores.set(offset + i);
                }
            }
            offset += count;
        }

        self.node_bitmap = Some(new_nodes);
        self.core_bitmap = Some(new_cores);
        self.sockets_per_node = result.sockets_per_node;
        self.cores_per_socket = result.cores_per_socket;
        self.sock_core_rep_count = result.sock_core_rep_count;

        match mismatch {
            Some(message) => inconsistency(message),
            None => Ok(()),
        }
    }
}
