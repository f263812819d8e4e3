//! Point and per-node operations on the core bitmap.
use std::ops::Range;

use crate::bitmap::Bitmap;
use crate::error::{inconsistency, invalid_input, out_of_range};
use crate::node::NodeTable;
use crate::resources::JobResources;

impl JobResources {
    /// Bits of the `node_id`-th allocated node inside `core_bitmap`.
    pub(crate) fn node_core_range(&self, node_id: usize) -> crate::Result<Range<usize>> {
        let mut offset = 0usize;
        let mut node = node_id;
        for ((sockets, cores), reps) in self
            .sockets_per_node
            .iter()
            .zip(&self.cores_per_socket)
            .zip(&self.sock_core_rep_count)
        {
            let per_node = *sockets as usize * *cores as usize;
            if (*reps as usize) <= node {
                offset += per_node * *reps as usize;
                node -= *reps as usize;
            } else {
                let start = offset + per_node * node;
                return Ok(start..start + per_node);
            }
        }
        out_of_range(format!("node {node_id} is not part of the allocation"))
    }

    fn core_bitmap_len(&self) -> usize {
        self.core_bitmap.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Number of core bits belonging to the `node_id`-th allocated node.
    pub fn node_cores(&self, node_id: usize) -> crate::Result<usize> {
        self.node_core_range(node_id).map(|r| r.len())
    }

    /// Index into `core_bitmap` of core `core_id` on socket `socket_id` of node `node_id`.
    pub fn get_offset(
        &self,
        node_id: usize,
        socket_id: usize,
        core_id: usize,
    ) -> crate::Result<usize> {
        let (sockets, cores) = self.get_cnt(node_id)?;
        if socket_id >= sockets as usize {
            return out_of_range(format!(
                "socket {socket_id} is invalid for node {node_id} ({sockets} sockets)"
            ));
        }
        if core_id >= cores as usize {
            return out_of_range(format!(
                "core {core_id} is invalid for node {node_id} ({cores} cores per socket)"
            ));
        }
        let offset = self.node_core_range(node_id)?.start + socket_id * cores as usize + core_id;
        let len = self.core_bitmap_len();
        if offset >= len {
            return out_of_range(format!("offset {offset} exceeds core bitmap size {len}"));
        }
        Ok(offset)
    }

    pub fn get_bit(
        &self,
        node_id: usize,
        socket_id: usize,
        core_id: usize,
    ) -> crate::Result<bool> {
        let offset = self.get_offset(node_id, socket_id, core_id)?;
        Ok(self.core_bitmap.as_ref().is_some_and(|b| b.test(offset)))
    }

    pub fn set_bit(
        &mut self,
        node_id: usize,
        socket_id: usize,
        core_id: usize,
    ) -> crate::Result<()> {
        let offset = self.get_offset(node_id, socket_id, core_id)?;
        if let Some(bitmap) = self.core_bitmap.as_mut() {
            bitmap.set(offset);
        }
        Ok(())
    }

    fn checked_node_range(&self, node_id: usize) -> crate::Result<Range<usize>> {
        let range = self.node_core_range(node_id)?;
        let len = self.core_bitmap_len();
        if range.end > len {
            return out_of_range(format!(
                "cores {}..{} of node {node_id} exceed core bitmap size {len}",
                range.start, range.end
            ));
        }
        Ok(range)
    }

    /// Whether any core of the `node_id`-th allocated node is set.
    pub fn get_node(&self, node_id: usize) -> crate::Result<bool> {
        let range = self.checked_node_range(node_id)?;
        Ok(self
            .core_bitmap
            .as_ref()
            .is_some_and(|b| b.any_in_range(range)))
    }

    pub fn set_node(&mut self, node_id: usize) -> crate::Result<()> {
        let range = self.checked_node_range(node_id)?;
        if let Some(bitmap) = self.core_bitmap.as_mut() {
            bitmap.set_range(range);
        }
        Ok(())
    }

    pub fn clear_node(&mut self, node_id: usize) -> crate::Result<()> {
        let range = self.checked_node_range(node_id)?;
        if let Some(bitmap) = self.core_bitmap.as_mut() {
            bitmap.clear_range(range);
        }
        Ok(())
    }

    pub fn count_node(&self, node_id: usize) -> crate::Result<usize> {
        let range = self.checked_node_range(node_id)?;
        Ok(self
            .core_bitmap
            .as_ref()
            .map(|b| b.count_range(range))
            .unwrap_or(0))
    }

    /// Fresh bitmap with the cores of the `node_id`-th allocated node.
    pub fn copy_node(&self, node_id: usize) -> crate::Result<Bitmap> {
        let range = self.checked_node_range(node_id)?;
        Ok(match self.core_bitmap.as_ref() {
            Some(bitmap) => bitmap.copy_range(range),
            None => Bitmap::new(range.len()),
        })
    }

    /// Removes the `node_id`-th allocated node from the structure.
    ///
    /// Geometry runs, per-node arrays and both core bitmaps are contracted, the node is removed
    /// from `node_bitmap` and the node list and the CPU array are regenerated.
    pub fn extract_node(&mut self, node_id: usize, table: &NodeTable) -> crate::Result<()> {
        let Some(global_inx) = self
            .node_bitmap
            .as_ref()
            .and_then(|b| b.ones().nth(node_id))
        else {
            return out_of_range(format!("node {node_id} is not in node_bitmap"));
        };

        let mut node = node_id;
        let mut run = None;
        for (k, reps) in self.sock_core_rep_count.iter().enumerate() {
            if (*reps as usize) <= node {
                node -= *reps as usize;
            } else {
                run = Some(k);
                break;
            }
        }
        let Some(run) = run else {
            return out_of_range(format!("node {node_id} is not part of the geometry"));
        };
        let range = self.node_core_range(node_id)?;
        if range.is_empty() {
            log::error!("Node {node_id} of job resources has no cores");
            return inconsistency(format!("node {node_id} has no cores"));
        }

        self.sock_core_rep_count[run] -= 1;
        if self.sock_core_rep_count[run] == 0 {
            self.sock_core_rep_count.remove(run);
            self.sockets_per_node.remove(run);
            self.cores_per_socket.remove(run);
        }

        for bitmap in [self.core_bitmap.as_mut(), self.core_bitmap_used.as_mut()]
            .into_iter()
            .flatten()
        {
            bitmap.remove_range(range.clone());
        }

        if node_id < self.cpus.len() {
            self.cpus.remove(node_id);
        }
        if node_id < self.cpus_used.len() {
            self.cpus_used.remove(node_id);
        }
        if node_id < self.memory_allocated.len() {
            self.memory_allocated.remove(node_id);
        }
        if node_id < self.memory_used.len() {
            self.memory_used.remove(node_id);
        }

        self.nhosts = self.nhosts.saturating_sub(1);
        if let Some(node_bitmap) = self.node_bitmap.as_mut() {
            node_bitmap.clear(global_inx);
            self.nodes = Some(table.bitmap_to_names(node_bitmap));
        }
        self.ncpus = self.build_cpu_array(table)?;
        Ok(())
    }

    /// ORs the cores of `src_node` of `src` into the cores of `dst_node`, in both the allocated
    /// and the used core bitmaps.
    ///
    /// When the nodes have a different number of cores, the common prefix is still copied and an
    /// error is returned.
    pub fn bits_copy(
        &mut self,
        dst_node: usize,
        src: &JobResources,
        src_node: usize,
    ) -> crate::Result<()> {
        let dst_range = self.node_core_range(dst_node)?;
        let src_range = src.node_core_range(src_node)?;
        if self.core_bitmap.is_none() || src.core_bitmap.is_none() {
            return invalid_input("bits_copy without core_bitmap");
        }
        let count = dst_range.len().min(src_range.len());
        for (dst, src) in [
            (self.core_bitmap.as_mut(), src.core_bitmap.as_ref()),
            (self.core_bitmap_used.as_mut(), src.core_bitmap_used.as_ref()),
        ] {
            if let (Some(dst), Some(src)) = (dst, src) {
                for i in 0..count {
                    if src.test(src_range.start + i) && dst_range.start + i < dst.len() {
                        dst.set(dst_range.start + i);
                    }
                }
            }
        }
        if dst_range.len() != src_range.len() {
            log::error!(
                "Core count mismatch in bits_copy ({} != {})",
                dst_range.len(),
                src_range.len()
            );
            return inconsistency(format!(
                "node {dst_node} has {} cores, source node {src_node} has {}",
                dst_range.len(),
                src_range.len()
            ));
        }
        Ok(())
    }
}
