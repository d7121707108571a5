/// Resource limits and switches for one [`crate::Vm`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum frames per coroutine.
    pub max_frames: usize,
    /// Maximum coroutines alive in the arena, including the root.
    pub max_coroutines: usize,
    /// Maximum simultaneously open backtracking regions.
    pub max_open_regions: usize,
    pub collect_metrics: bool,
    /// Run the bytecode verifier before execution.
    pub verify: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frames: 4096,
            max_coroutines: 65_536,
            max_open_regions: 1024,
            collect_metrics: false,
            verify: true,
        }
    }
}

impl VmConfig {
    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn with_max_coroutines(mut self, max_coroutines: usize) -> Self {
        self.max_coroutines = max_coroutines;
        self
    }

    pub fn with_max_open_regions(mut self, max_open_regions: usize) -> Self {
        self.max_open_regions = max_open_regions;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.collect_metrics = enabled;
        self
    }

    pub fn without_verification(mut self) -> Self {
        self.verify = false;
        self
    }
}
