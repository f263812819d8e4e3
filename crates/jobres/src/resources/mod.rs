//! Bitmap based description of the cores allocated to a job or a step.
//!
//! The core bitmap stores the cores of all allocated nodes contiguously, node by node, and
//! within a node socket by socket:
//!
//! ```text
//! | Node_0                        | Node_1          |
//! | Sock_0        | Sock_1        | Sock_0  | ...   |
//! | Co_0 | Co_1 | | Co_0 | Co_1 | | ...             |
//! ```
//!
//! Socket/core geometry is run length encoded in `sockets_per_node`, `cores_per_socket` and
//! `sock_core_rep_count`, so the offset of node `n` is the sum of `sockets * cores` over all
//! allocated nodes before it.
mod algebra;
mod bits;
mod codec;
mod cores;

use bitflags::bitflags;

use crate::bitmap::Bitmap;
use crate::error::{inconsistency, invalid_input, out_of_range};
use crate::node::{NodeRecord, NodeTable};

bitflags! {
    /// Consumable resource selection of the cluster.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CrType: u16 {
        const CPU = 0x0001;
        const SOCKET = 0x0002;
        const CORE = 0x0004;
        const BOARD = 0x0008;
        const MEMORY = 0x0010;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeReq {
    #[default]
    Available,
    OneRow,
    Reserved,
}

impl NodeReq {
    pub fn as_u32(self) -> u32 {
        match self {
            NodeReq::Available => 0,
            NodeReq::OneRow => 1,
            NodeReq::Reserved => 64000,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(NodeReq::Available),
            1 => Some(NodeReq::OneRow),
            64000 => Some(NodeReq::Reserved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResources {
    /// Number of allocated nodes, equals the popcount of `node_bitmap`
    pub nhosts: u32,
    /// CPUs reserved before thread folding
    pub ncpus: u32,
    pub node_req: NodeReq,
    /// Hostlist expression of the allocated nodes
    pub nodes: Option<String>,
    /// Allocated nodes, indexed by the controller node table
    pub node_bitmap: Option<Bitmap>,

    pub cpus: Vec<u16>,
    pub cpus_used: Vec<u16>,
    pub memory_allocated: Vec<u64>,
    pub memory_used: Vec<u64>,

    pub sockets_per_node: Vec<u16>,
    pub cores_per_socket: Vec<u16>,
    pub sock_core_rep_count: Vec<u32>,

    pub core_bitmap: Option<Bitmap>,
    pub core_bitmap_used: Option<Bitmap>,

    /// Run length encoding of the thread folded `cpus`
    pub cpu_array_value: Vec<u16>,
    pub cpu_array_reps: Vec<u32>,

    /// The job owns every core of each of its nodes
    pub whole_node: bool,
    pub threads_per_core: u16,
    pub cr_type: CrType,
}

impl JobResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_bitmap(node_bitmap: Bitmap) -> Self {
        JobResources {
            nhosts: node_bitmap.count() as u32,
            node_bitmap: Some(node_bitmap),
            ..Default::default()
        }
    }

    #[inline]
    pub fn cpu_array_cnt(&self) -> usize {
        self.cpu_array_value.len()
    }

    /// Per-node `(sockets, cores_per_socket)` in allocation order, decoded from the RLE triple.
    pub fn geometry(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.sockets_per_node
            .iter()
            .zip(&self.cores_per_socket)
            .zip(&self.sock_core_rep_count)
            .flat_map(|((sockets, cores), reps)| {
                std::iter::repeat_n((*sockets, *cores), *reps as usize)
            })
    }

    /// Length the core bitmap must have according to the RLE geometry.
    pub fn geometry_core_count(&self) -> usize {
        self.sockets_per_node
            .iter()
            .zip(&self.cores_per_socket)
            .zip(&self.sock_core_rep_count)
            .map(|((s, c), r)| *s as usize * *c as usize * *r as usize)
            .sum()
    }

    /// Number of allocated cores.
    pub fn core_count(&self) -> usize {
        self.core_bitmap.as_ref().map(|b| b.count()).unwrap_or(0)
    }

    fn push_geometry(&mut self, sockets: u16, cores: u16) {
        match (self.sockets_per_node.last(), self.cores_per_socket.last()) {
            (Some(s), Some(c)) if *s == sockets && *c == cores => {
                if let Some(reps) = self.sock_core_rep_count.last_mut() {
                    *reps += 1;
                }
            }
            _ => {
                self.sockets_per_node.push(sockets);
                self.cores_per_socket.push(cores);
                self.sock_core_rep_count.push(1);
            }
        }
    }

    /// Fills the socket/core geometry from the node table and allocates empty core bitmaps of
    /// the matching size.
    pub fn build(&mut self, table: &NodeTable) -> crate::Result<()> {
        let Some(node_bitmap) = self.node_bitmap.take() else {
            return invalid_input("build of job resources without node_bitmap");
        };
        self.sockets_per_node.clear();
        self.cores_per_socket.clear();
        self.sock_core_rep_count.clear();

        let mut core_cnt = 0usize;
        let mut result = Ok(());
        for index in node_bitmap.ones() {
            let Some(node) = table.get(index) else {
                result = out_of_range(format!("node index {index} is not in the node table"));
                break;
            };
            self.push_geometry(node.sockets, node.cores);
            core_cnt += node.total_cores() as usize;
        }
        self.nhosts = node_bitmap.count() as u32;
        self.node_bitmap = Some(node_bitmap);
        result?;
        self.core_bitmap = Some(Bitmap::new(core_cnt));
        self.core_bitmap_used = Some(Bitmap::new(core_cnt));
        Ok(())
    }

    /// CPUs of one allocated node as reported to users, folded to the job's threads per core
    /// when cores or sockets are the consumable resource.
    pub fn get_node_cpu_cnt(&self, job_node_inx: usize, node: &NodeRecord) -> u16 {
        let cpus = self.cpus.get(job_node_inx).copied().unwrap_or(0);
        let node_tpc = node.threads;
        if self.cr_type.intersects(CrType::CORE | CrType::SOCKET)
            && self.threads_per_core != 0
            && self.threads_per_core < node_tpc
        {
            cpus / node_tpc * self.threads_per_core
        } else {
            cpus
        }
    }

    /// Regenerates the CPU RLE from `cpus` and returns the raw CPU total.
    pub fn build_cpu_array(&mut self, table: &NodeTable) -> crate::Result<u32> {
        if self.nhosts == 0 {
            self.cpu_array_value.clear();
            self.cpu_array_reps.clear();
            return Ok(0);
        }
        let Some(node_bitmap) = self.node_bitmap.as_ref() else {
            return invalid_input("build_cpu_array without node_bitmap");
        };
        if self.cpus.len() < self.nhosts as usize {
            return inconsistency(format!(
                "cpus array has {} entries for {} hosts",
                self.cpus.len(),
                self.nhosts
            ));
        }

        let mut values: Vec<u16> = Vec::new();
        let mut reps: Vec<u32> = Vec::new();
        let mut cpu_count = 0u32;
        for (job_node_inx, node_inx) in node_bitmap.ones().take(self.nhosts as usize).enumerate()
        {
            let Some(node) = table.get(node_inx) else {
                return out_of_range(format!("node index {node_inx} is not in the node table"));
            };
            let folded = self.get_node_cpu_cnt(job_node_inx, node);
            match values.last() {
                Some(last) if *last == folded => {
                    if let Some(r) = reps.last_mut() {
                        *r += 1;
                    }
                }
                _ => {
                    values.push(folded);
                    reps.push(1);
                }
            }
            cpu_count += self.cpus[job_node_inx] as u32;
        }
        self.cpu_array_value = values;
        self.cpu_array_reps = reps;
        Ok(cpu_count)
    }

    /// Checks that every allocated node still has the number of cores recorded in the job.
    ///
    /// Socket and core counts may change (e.g. after a reboot), as long as the total is kept.
    pub fn validate(&self, table: &NodeTable) -> crate::Result<()> {
        let Some(node_bitmap) = self.node_bitmap.as_ref() else {
            return invalid_input("validation of job resources without node_bitmap");
        };
        let mut geometry = self.geometry();
        for index in node_bitmap.ones() {
            let Some(node) = table.get(index) else {
                return out_of_range(format!("node index {index} is not in the node table"));
            };
            let Some((sockets, cores)) = geometry.next() else {
                return inconsistency("node_bitmap has more nodes than the socket/core geometry");
            };
            let job_cores = sockets as u32 * cores as u32;
            if job_cores != node.total_cores() {
                log::error!(
                    "Socket and core count mismatch on node {}: job has {} cores, node has {}",
                    node.name,
                    job_cores,
                    node.total_cores()
                );
                return inconsistency(format!(
                    "node {} has {} cores, job expects {}",
                    node.name,
                    node.total_cores(),
                    job_cores
                ));
            }
        }
        Ok(())
    }

    /// Rebuilds `node_bitmap` from the textual node list, e.g. after a controller restart.
    pub fn reset_node_bitmap(&mut self, table: &NodeTable) -> crate::Result<()> {
        let bitmap = match self.nodes.as_deref() {
            Some(nodes) => table.names_to_bitmap(nodes)?,
            None => Bitmap::new(table.len()),
        };
        let count = bitmap.count();
        if count != self.nhosts as usize {
            log::error!(
                "Node count mismatch for job resources ({} != {})",
                count,
                self.nhosts
            );
            return inconsistency(format!(
                "node list `{}` has {} nodes, job has {}",
                self.nodes.as_deref().unwrap_or(""),
                count,
                self.nhosts
            ));
        }
        self.node_bitmap = Some(bitmap);
        Ok(())
    }

    /// Position of a global node index among the allocated nodes.
    pub fn node_inx_to_cpu_inx(&self, node_inx: usize) -> Option<usize> {
        let node_bitmap = self.node_bitmap.as_ref()?;
        if !node_bitmap.test(node_inx) {
            log::error!("Job resources do not contain node index {node_inx}");
            return None;
        }
        let offset = node_bitmap.count_range(0..node_inx);
        if offset >= self.nhosts as usize {
            log::error!(
                "Node offset {offset} is larger than the node count {}",
                self.nhosts
            );
            return None;
        }
        Some(offset)
    }

    /// Socket count and cores per socket of the `node_id`-th allocated node.
    pub fn get_cnt(&self, node_id: usize) -> crate::Result<(u16, u16)> {
        match self.geometry().nth(node_id) {
            Some(geometry) => Ok(geometry),
            None => out_of_range(format!("node {node_id} is not part of the allocation")),
        }
    }

    /// Writes a human readable dump of the structure into the debug log.
    pub fn log_details(&self, job_id: u32) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        log::debug!("====================");
        log::debug!(
            "JobId={job_id} nhosts:{} ncpus:{} node_req:{:?} nodes={}",
            self.nhosts,
            self.ncpus,
            self.node_req,
            self.nodes.as_deref().unwrap_or("")
        );
        if self.cpus.is_empty() {
            log::debug!("cpus array is empty");
            return;
        }
        let Some(core_bitmap) = self.core_bitmap.as_ref() else {
            log::debug!("core_bitmap is empty");
            return;
        };

        let mut offset = 0usize;
        for (i, (sockets, cores)) in self.geometry().enumerate() {
            log::debug!(
                "Node[{i}]: Mem(MB):{}:{} Sockets:{sockets} Cores:{cores} CPUs:{}:{}",
                self.memory_used.get(i).copied().unwrap_or(0),
                self.memory_allocated.get(i).copied().unwrap_or(0),
                self.cpus_used.get(i).copied().unwrap_or(0),
                self.cpus.get(i).copied().unwrap_or(0),
            );
            for socket in 0..sockets as usize {
                let mut line = String::with_capacity(cores as usize);
                for core in 0..cores as usize {
                    let bit = offset + socket * cores as usize + core;
                    let used = self
                        .core_bitmap_used
                        .as_ref()
                        .map(|b| b.test(bit))
                        .unwrap_or(false);
                    line.push(match (core_bitmap.test(bit), used) {
                        (true, true) => 'U',
                        (true, false) => 'A',
                        _ => '.',
                    });
                }
                log::debug!("  Socket[{socket}] Cores:{line}");
            }
            offset += sockets as usize * cores as usize;
        }
        log::debug!("--------------------");
    }
}
