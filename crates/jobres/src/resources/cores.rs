//! Placement of a job's cores into a cluster-wide core bitmap.
use std::ops::Range;

use crate::bitmap::Bitmap;
use crate::node::CoreLayout;
use crate::resources::JobResources;

impl JobResources {
    /// Pairs of (cluster-wide core range, job core range) for every allocated node.
    fn node_slices<'a>(
        &'a self,
        layout: &'a CoreLayout,
    ) -> impl Iterator<Item = (Range<usize>, Range<usize>)> + 'a {
        let mut job_offset = 0usize;
        self.node_bitmap
            .iter()
            .flat_map(|bitmap| bitmap.ones())
            .zip(self.geometry())
            .map(move |(node, (sockets, cores))| {
                let job_cores = sockets as usize * cores as usize;
                let job_range = job_offset..job_offset + job_cores;
                job_offset += job_cores;
                (layout.node_range(node), job_range)
            })
    }

    /// Whether none of our cores is already taken in `full`.
    ///
    /// A whole-node job conflicts with any taken core of its nodes.
    pub fn job_fits_into_cores(&self, full: &Bitmap, layout: &CoreLayout) -> bool {
        for (full_range, job_range) in self.node_slices(layout) {
            if self.whole_node {
                if full.any_in_range(full_range) {
                    return false;
                }
                continue;
            }
            let Some(cores) = self.core_bitmap.as_ref() else {
                continue;
            };
            let count = full_range.len().min(job_range.len());
            for i in 0..count {
                if full.test(full_range.start + i) && cores.test(job_range.start + i) {
                    return false;
                }
            }
        }
        true
    }

    /// Marks our cores as taken in `full`; whole-node jobs take every core of their nodes.
    pub fn add_job_to_cores(&self, full: &mut Bitmap, layout: &CoreLayout) {
        if full.len() < layout.total_cores() {
            full.resize(layout.total_cores());
        }
        for (full_range, job_range) in self.node_slices(layout) {
            if self.whole_node {
                full.set_range(full_range);
                continue;
            }
            let Some(cores) = self.core_bitmap.as_ref() else {
                continue;
            };
            let count = full_range.len().min(job_range.len());
            for i in (0..count).filter(|i| cores.test(job_range.start + i)) {
                full.set(full_range.start + i);
            }
        }
    }

    /// Releases our cores in `full`.
    pub fn remove_job_from_cores(&self, full: &mut Bitmap, layout: &CoreLayout) {
        for (full_range, job_range) in self.node_slices(layout) {
            if self.whole_node {
                full.clear_range(full_range);
                continue;
            }
            let Some(cores) = self.core_bitmap.as_ref() else {
                continue;
            };
            let count = full_range.len().min(job_range.len());
            for i in (0..count).filter(|i| cores.test(job_range.start + i)) {
                if full_range.start + i < full.len() {
                    full.clear(full_range.start + i);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::{build_jr, uniform_table};

    #[test]
    fn add_and_remove_cores() {
        let table = uniform_table(4, 2, 2, 1);
        let layout = table.core_layout();
        let mut full = layout.new_bitmap();

        let mut job = build_jr(&table, &[1, 3], 0);
        job.set_bit(0, 1, 0).unwrap();
        job.set_bit(1, 0, 1).unwrap();
        assert!(job.job_fits_into_cores(&full, &layout));
        job.add_job_to_cores(&mut full, &layout);
        assert_eq!(full.ones().collect::<Vec<_>>(), vec![6, 13]);
        assert!(!job.job_fits_into_cores(&full, &layout));

        let mut other = build_jr(&table, &[1], 0);
        other.set_bit(0, 0, 0).unwrap();
        assert!(other.job_fits_into_cores(&full, &layout));

        job.remove_job_from_cores(&mut full, &layout);
        assert_eq!(full.count(), 0);
    }

    #[test]
    fn whole_node_blocks_and_takes_everything() {
        let table = uniform_table(4, 2, 2, 1);
        let layout = table.core_layout();
        let mut full = layout.new_bitmap();
        full.set(5);

        let mut job = build_jr(&table, &[1], 0);
        job.whole_node = true;
        assert!(!job.job_fits_into_cores(&full, &layout));

        full.clear_all();
        assert!(job.job_fits_into_cores(&full, &layout));
        job.add_job_to_cores(&mut full, &layout);
        assert_eq!(full.ones().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        job.remove_job_from_cores(&mut full, &layout);
        assert_eq!(full.count(), 0);
    }
}
