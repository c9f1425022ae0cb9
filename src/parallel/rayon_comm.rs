// rayon-backed shared-memory communicator

/// One process, many threads. Collectives are identities; the thread pool is used by
/// the assembler to evaluate regions concurrently.
pub struct RayonComm {
    threads: usize,
}

impl RayonComm {
    pub fn new() -> Self {
        let threads = num_cpus::get();
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .ok();
        RayonComm { threads }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Default for RayonComm {
    fn default() -> Self {
        Self::new()
    }
}

impl super::Comm for RayonComm {
    fn rank(&self) -> usize { 0 }
    fn size(&self) -> usize { 1 }
    fn barrier(&self) { rayon::scope(|_| {}); }
    fn all_reduce(&self, x: f64) -> f64 { x }
    fn all_reduce_max(&self, x: f64) -> f64 { x }
    fn all_reduce_sum_vec(&self, _data: &mut [f64]) {}
    fn all_gather_indices(&self, local: &[usize]) -> Vec<usize> {
        local.to_vec()
    }
    fn broadcast(&self, value: f64, _root: usize) -> f64 { value }
}
