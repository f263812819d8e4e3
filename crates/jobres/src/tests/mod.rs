use crate::bitmap::Bitmap;
use crate::node::{NodeRecord, NodeTable};
use crate::resources::JobResources;

/// Node table with `count` identical nodes named `tux0`, `tux1`, ...
pub(crate) fn uniform_table(count: usize, sockets: u16, cores: u16, threads: u16) -> NodeTable {
    NodeTable::new(
        (0..count)
            .map(|i| NodeRecord::new(format!("tux{i}"), sockets, cores, threads))
            .collect(),
    )
}

/// Built job resources on the given node indices with no cores set.
pub(crate) fn build_jr(table: &NodeTable, nodes: &[usize], cpus: u16) -> JobResources {
    let node_bitmap = Bitmap::from_indices(table.len(), nodes.iter().copied());
    let mut jr = JobResources::with_node_bitmap(node_bitmap);
    jr.build(table).unwrap();
    jr.nodes = Some(table.bitmap_to_names(jr.node_bitmap.as_ref().unwrap()));
    let n = nodes.len();
    jr.cpus = vec![cpus; n];
    jr.cpus_used = vec![0; n];
    jr.memory_allocated = vec![1024; n];
    jr.memory_used = vec![0; n];
    jr.ncpus = jr.build_cpu_array(table).unwrap();
    jr
}

/// Asserts the structural invariants every built `JobResources` must hold.
pub(crate) fn check_invariants(jr: &JobResources) {
    let nhosts = jr.nhosts as usize;
    if let Some(node_bitmap) = jr.node_bitmap.as_ref() {
        assert_eq!(node_bitmap.count(), nhosts);
    }
    let reps: u32 = jr.sock_core_rep_count.iter().sum();
    assert_eq!(reps as usize, nhosts);
    assert_eq!(jr.sockets_per_node.len(), jr.sock_core_rep_count.len());
    assert_eq!(jr.cores_per_socket.len(), jr.sock_core_rep_count.len());

    let cores = jr.geometry_core_count();
    if let Some(core_bitmap) = jr.core_bitmap.as_ref() {
        assert_eq!(core_bitmap.len(), cores);
        if let Some(used) = jr.core_bitmap_used.as_ref() {
            assert_eq!(used.len(), cores);
            assert!(used.is_subset_of(core_bitmap));
        }
    }

    assert_eq!(jr.cpus.len(), nhosts);
    for (used, cpus) in jr.cpus_used.iter().zip(&jr.cpus) {
        assert!(used <= cpus);
    }
    for (used, allocated) in jr.memory_used.iter().zip(&jr.memory_allocated) {
        assert!(used <= allocated);
    }
    let cpu_reps: u32 = jr.cpu_array_reps.iter().sum();
    assert_eq!(cpu_reps as usize, nhosts);
}
