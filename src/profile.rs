//! Collection profiler.
//!
//! When enabled, every collection appends one record with timing and
//! heap occupancy. Rendering mirrors the host-visible report: a table of
//! invoke time, heap use and per-cycle cost.

use std::io::{self, Write};

use crate::objspace::ObjectSpace;
use crate::pages::{CELLS_PER_PAGE, CELL_SIZE};
use crate::util::rusage_time;

#[derive(Clone, Copy, Debug, Default)]
pub struct GcProfileRecord {
    /// Seconds of user time this collection took.
    pub gc_time: f64,
    /// Seconds since profiler initialization when it started.
    pub gc_invoke_time: f64,
    pub heap_use_slots: usize,
    pub heap_live_objects: usize,
    pub heap_free_objects: usize,
    pub heap_total_objects: usize,
    pub heap_use_size: usize,
    pub heap_total_size: usize,
    pub have_finalize: bool,
    /// False for cycles that only swept (lazy path), true when a mark
    /// phase ran.
    pub is_marked: bool,
    pub allocate_increase: usize,
    pub allocate_limit: usize,
}

pub struct Profiler {
    pub(crate) run: bool,
    pub(crate) records: Vec<GcProfileRecord>,
    pub(crate) invoke_time: f64,
}

impl Profiler {
    pub fn new() -> Profiler {
        Profiler {
            run: false,
            records: Vec::new(),
            invoke_time: 0.0,
        }
    }

    pub fn enable(&mut self) {
        self.run = true;
    }

    pub fn disable(&mut self) {
        self.run = false;
    }

    pub fn enabled(&self) -> bool {
        self.run
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn raw_data(&self) -> &[GcProfileRecord] {
        &self.records
    }

    /// Sum of per-cycle times, in seconds.
    pub fn total_time(&self) -> f64 {
        self.records.iter().map(|r| r.gc_time).sum()
    }

    /// Plain-text report of the marked cycles.
    pub fn result(&self) -> String {
        if !self.run || self.records.is_empty() {
            return String::new();
        }
        let mut out = format!("GC {} invokes.\n", self.records.len());
        out.push_str(
            "Index    Invoke Time(sec)       Use Size(byte)     Total Size(byte)         Total Object                    GC Time(ms)\n",
        );
        let mut index = 1;
        for record in &self.records {
            if !record.is_marked {
                continue;
            }
            out.push_str(&format!(
                "{:5} {:19.3} {:20} {:20} {:20} {:30.20}\n",
                index,
                record.gc_invoke_time,
                record.heap_use_size,
                record.heap_total_size,
                record.heap_total_objects,
                record.gc_time * 1000.0,
            ));
            index += 1;
        }
        out
    }

    /// Write `result` to the given sink.
    pub fn report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.result().as_bytes())
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Profiler::new()
    }
}

/// In-flight measurement handed between timer start and stop.
pub(crate) struct ProfSample {
    start: f64,
    invoke: f64,
}

impl ObjectSpace {
    pub(crate) fn prof_timer_start(&mut self) -> Option<ProfSample> {
        if !self.profiler.run {
            return None;
        }
        let now = rusage_time();
        Some(ProfSample {
            start: now,
            invoke: now - self.profiler.invoke_time,
        })
    }

    pub(crate) fn prof_timer_stop(&mut self, sample: Option<ProfSample>, marked: bool) {
        let Some(sample) = sample else { return };
        let gc_time = (rusage_time() - sample.start).max(0.0);
        let live = self.heap.live_num;
        let total = self.heap.used() * CELLS_PER_PAGE;
        let have_finalize = !self
            .deferred_final_list
            .load(std::sync::atomic::Ordering::Relaxed)
            .is_null();
        self.profiler.records.push(GcProfileRecord {
            gc_time,
            gc_invoke_time: sample.invoke,
            heap_use_slots: self.heap.used(),
            heap_live_objects: live,
            heap_free_objects: total - live.min(total),
            heap_total_objects: total,
            heap_use_size: live * CELL_SIZE,
            heap_total_size: total * CELL_SIZE,
            have_finalize,
            is_marked: marked,
            allocate_increase: self.malloc_params.increase,
            allocate_limit: self.malloc_params.limit,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_profiler_produces_nothing() {
        let prof = Profiler::new();
        assert!(!prof.enabled());
        assert_eq!(prof.result(), "");
        assert_eq!(prof.total_time(), 0.0);
        assert!(prof.raw_data().is_empty());
    }

    #[test]
    fn records_accumulate_and_clear() {
        let mut prof = Profiler::new();
        prof.enable();
        prof.records.push(GcProfileRecord {
            gc_time: 0.5,
            is_marked: true,
            ..GcProfileRecord::default()
        });
        prof.records.push(GcProfileRecord {
            gc_time: 0.25,
            is_marked: false,
            ..GcProfileRecord::default()
        });
        assert_eq!(prof.count(), 2);
        assert!((prof.total_time() - 0.75).abs() < 1e-9);

        let text = prof.result();
        assert!(text.starts_with("GC 2 invokes."));
        // only the marked cycle is listed
        assert_eq!(text.lines().count(), 3);

        prof.clear();
        assert_eq!(prof.count(), 0);
    }

    #[test]
    fn report_writes_result_bytes() {
        let mut prof = Profiler::new();
        prof.enable();
        prof.records.push(GcProfileRecord {
            gc_time: 0.1,
            is_marked: true,
            ..GcProfileRecord::default()
        });
        let mut sink = Vec::new();
        prof.report(&mut sink).unwrap();
        assert_eq!(sink, prof.result().as_bytes());
    }
}
