use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use crate::utils::{formatted_duration, formatted_size};

/// Named splits of one collection. Splits nest: a split started while another one is open is
/// recorded as its child.
pub struct TimingLogger {
    name: &'static str,
    verbose: bool,
    splits: Vec<(&'static str, Duration)>,
    depths: Vec<usize>,
    open: Vec<(&'static str, Instant)>,
}

impl TimingLogger {
    pub fn new(name: &'static str, verbose: bool) -> Self {
        Self {
            name,
            verbose,
            splits: vec![],
            depths: vec![],
            open: vec![],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn reset(&mut self) {
        self.splits.clear();
        self.depths.clear();
        self.open.clear();
    }

    pub fn start_split(&mut self, label: &'static str) {
        self.open.push((label, Instant::now()));
    }

    /// Ends the innermost split and starts `label` at the same depth.
    pub fn new_split(&mut self, label: &'static str) {
        self.end_split();
        self.start_split(label);
    }

    pub fn end_split(&mut self) {
        if let Some((label, start)) = self.open.pop() {
            let elapsed = start.elapsed();
            if self.verbose {
                log::debug!("{}: {} took {}", self.name, label, formatted_duration(elapsed));
            }
            self.splits.push((label, elapsed));
            self.depths.push(self.open.len());
        }
    }

    /// Every finished split, in the order they ended.
    pub fn splits(&self) -> &[(&'static str, Duration)] {
        &self.splits
    }

    /// Sum of the outermost splits.
    pub fn total(&self) -> Duration {
        self.splits
            .iter()
            .zip(self.depths.iter())
            .filter(|(_, depth)| **depth == 0)
            .map(|((_, d), _)| *d)
            .sum()
    }
}

impl fmt::Display for TimingLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: begin", self.name)?;
        for (label, duration) in self.splits.iter() {
            writeln!(f, "{}: {} {}", self.name, formatted_duration(*duration), label)?;
        }
        writeln!(f, "{}: end, {}", self.name, formatted_duration(self.total()))
    }
}

#[derive(Default, Clone, Copy)]
struct SplitHistogram {
    count: usize,
    total: Duration,
    max: Duration,
}

/// Split timings accumulated over many collections.
#[derive(Default)]
pub struct CumulativeLogger {
    iterations: usize,
    splits: BTreeMap<&'static str, SplitHistogram>,
}

impl CumulativeLogger {
    pub fn add_logger(&mut self, logger: &TimingLogger) {
        self.iterations += 1;
        for (label, duration) in logger.splits() {
            let entry = self.splits.entry(*label).or_default();
            entry.count += 1;
            entry.total += *duration;
            entry.max = entry.max.max(*duration);
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn total_time(&self) -> Duration {
        self.splits.values().map(|h| h.total).sum()
    }

    pub fn reset(&mut self) {
        self.iterations = 0;
        self.splits.clear();
    }
}

impl fmt::Display for CumulativeLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, histogram) in self.splits.iter() {
            writeln!(
                f,
                "  {}: sum {} avg {} max {}",
                label,
                formatted_duration(histogram.total),
                formatted_duration(histogram.total / histogram.count.max(1) as u32),
                formatted_duration(histogram.max)
            )?;
        }
        Ok(())
    }
}

/// Running totals of one collector configuration (scope plus concurrency).
#[derive(Default)]
pub struct CollectorTotals {
    pub runs: usize,
    pub total_time: Duration,
    pub total_paused_time: Duration,
    pub max_pause: Duration,
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub cumulative_timings: CumulativeLogger,
}

impl CollectorTotals {
    pub fn dump(&self, name: &str, f: &mut dyn fmt::Write) -> fmt::Result {
        if self.runs == 0 {
            return Ok(());
        }
        writeln!(f, "{}:", name)?;
        write!(f, "{}", self.cumulative_timings)?;
        let seconds = self.total_time.as_secs_f64();
        writeln!(
            f,
            "{} runs, total time {}, paused {} (max {}), freed {} objects ({}), throughput {:.1} objects/s",
            self.runs,
            formatted_duration(self.total_time),
            formatted_duration(self.total_paused_time),
            formatted_duration(self.max_pause),
            self.freed_objects,
            formatted_size(self.freed_bytes),
            if seconds > 0.0 {
                self.freed_objects as f64 / seconds
            } else {
                0.0
            }
        )
    }
}

/// Point-in-time view of the heap counters.
pub struct HeapStatistics {
    pub bytes_allocated: usize,
    pub objects_allocated: usize,
    pub max_allowed_footprint: usize,
    pub concurrent_start_bytes: usize,
    pub growth_limit: usize,
    pub total_gc_cycles_count: usize,
    pub total_objects_freed: usize,
    pub total_bytes_freed: usize,
    pub total_wait_time: Duration,
    pub allocation_rate: usize,
    pub large_objects: usize,
}

impl fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Bytes allocated: {} ({} objects)",
            formatted_size(self.bytes_allocated),
            self.objects_allocated
        )?;
        writeln!(
            f,
            "  Footprint limit: {} of {}",
            formatted_size(self.max_allowed_footprint),
            formatted_size(self.growth_limit)
        )?;
        writeln!(
            f,
            "  Concurrent start: {}",
            formatted_size(self.concurrent_start_bytes)
        )?;
        writeln!(f, "  Large objects: {}", self.large_objects)?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(
            f,
            "  Total freed: {} objects ({})",
            self.total_objects_freed,
            formatted_size(self.total_bytes_freed)
        )?;
        writeln!(
            f,
            "  Allocation rate: {}/s",
            formatted_size(self.allocation_rate)
        )?;
        writeln!(
            f,
            "  Total time waiting for GC to complete: {}",
            formatted_duration(self.total_wait_time)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_splits_accumulate() {
        let mut timings = TimingLogger::new("test", false);
        timings.start_split("A");
        timings.new_split("B");
        timings.end_split();
        assert_eq!(
            timings.splits().iter().map(|(l, _)| *l).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        timings.start_split("Outer");
        timings.start_split("Inner");
        timings.end_split();
        timings.end_split();
        let labels = timings.splits().iter().map(|(l, _)| *l).collect::<Vec<_>>();
        assert_eq!(&labels[2..], &["Inner", "Outer"]);
        let outer = timings.splits()[3].1;
        assert!(timings.total() >= outer);

        let mut cumulative = CumulativeLogger::default();
        cumulative.add_logger(&timings);
        cumulative.add_logger(&timings);
        assert_eq!(cumulative.iterations(), 2);
        let dump = cumulative.to_string();
        assert!(dump.contains("A: sum"));
        assert!(timings.to_string().contains("test: end"));
    }
}
