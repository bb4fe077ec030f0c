//! Runs a unit of work repeatedly, resizing each chunk so that it takes
//! roughly a goal duration. Large chunks make progress, small chunks keep
//! transactions and locks short.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Chunks that finish faster than this are timed as taking this long.
const MIN_ELAPSED: Duration = Duration::from_millis(1);

#[async_trait]
pub trait TunableLoop: Send {
    type Error: Send;

    fn is_done(&self) -> bool;

    async fn run_chunk(&mut self, chunk_size: usize) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone)]
pub struct LoopTuner {
    goal: Duration,
    initial: usize,
    min: usize,
    max: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub chunks: usize,
    pub elapsed: Duration,
    pub last_chunk_size: usize,
}

impl LoopTuner {
    pub fn new(goal: Duration, initial: usize, min: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        LoopTuner {
            goal: goal.max(MIN_ELAPSED),
            initial: initial.clamp(min, max),
            min,
            max,
        }
    }

    /// The geometric mean of `size` and the size that would have taken
    /// exactly the goal duration, so the size converges without oscillating.
    pub fn next_chunk_size(&self, size: usize, elapsed: Duration) -> usize {
        let elapsed = elapsed.max(MIN_ELAPSED).as_secs_f64();
        let next = size as f64 * (self.goal.as_secs_f64() / elapsed).sqrt();
        if next >= self.max as f64 {
            return self.max;
        }
        (next.round() as usize).clamp(self.min, self.max)
    }

    pub async fn run<L: TunableLoop>(&self, work: &mut L) -> Result<LoopSummary, L::Error> {
        let start = Instant::now();
        let mut size = self.initial;
        let mut summary = LoopSummary::default();
        while !work.is_done() {
            let chunk_start = Instant::now();
            work.run_chunk(size).await?;
            let elapsed = chunk_start.elapsed();
            summary.chunks += 1;
            summary.last_chunk_size = size;
            let next = self.next_chunk_size(size, elapsed);
            tracing::debug!(
                chunk = summary.chunks,
                chunk_size = size,
                elapsed_ms = elapsed.as_millis() as u64,
                next_chunk_size = next,
                "Ran loop chunk"
            );
            size = next;
        }
        summary.elapsed = start.elapsed();
        Ok(summary)
    }
}
