/// Progress bar color; tells the front end what a worker is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarColor {
    /// Calibrating events
    #[default]
    CYAN,
    /// Run finished with every event calibrated
    GREEN,
    /// Run finished but some events were skipped
    MAGENTA,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub run_number: i32,
    pub worker_id: usize,
    pub color: BarColor,
}

impl WorkerStatus {
    pub fn new(progress: f32, run_number: i32, worker_id: usize, color: BarColor) -> Self {
        Self {
            progress,
            run_number,
            worker_id,
            color,
        }
    }
}
