// Aggregates per-file byte deltas into one monotonic 0–100 percentage.
//
// Preference order for the denominator: manifest byte total, then file
// count with a fractional in-flight file, then the active file alone.
// Whatever the source, the emitted percent never decreases and never
// exceeds 100.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

type EmitFn = Box<dyn Fn(&str, u8) + Send + Sync>;

struct AggState {
    total_bytes: u64,
    total_files: u64,
    downloaded_bytes: u64,
    file_sizes: HashMap<String, u64>,
    file_downloaded: HashMap<String, u64>,
    finished_files: HashSet<String>,
    last_percent: i16,
}

pub struct ProgressAggregator {
    emit: EmitFn,
    state: Mutex<AggState>,
}

impl ProgressAggregator {
    pub fn new(emit: EmitFn, total_bytes: u64, total_files: u64) -> Self {
        ProgressAggregator {
            emit,
            state: Mutex::new(AggState {
                total_bytes,
                total_files,
                downloaded_bytes: 0,
                file_sizes: HashMap::new(),
                file_downloaded: HashMap::new(),
                finished_files: HashSet::new(),
                last_percent: -1,
            }),
        }
    }

    /// Announce a file before its first byte arrives. With no manifest
    /// total, announced sizes grow the denominator instead.
    pub fn register_file(&self, filename: &str, file_size: u64) {
        if filename.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if !state.file_sizes.contains_key(filename) {
            state.file_sizes.insert(filename.to_string(), file_size);
            state.file_downloaded.entry(filename.to_string()).or_insert(0);
            if state.total_bytes == 0 && file_size > 0 {
                state.total_bytes += file_size;
            }
        }
    }

    /// Apply a byte delta for one file. Deltas are clamped to the file's
    /// announced size; non-positive deltas are ignored.
    pub fn update(&self, filename: &str, delta: u64) {
        if filename.is_empty() || delta == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let current = state.file_downloaded.get(filename).copied().unwrap_or(0);
        let file_size = state.file_sizes.get(filename).copied().unwrap_or(0);
        let mut new_value = current + delta;
        if file_size > 0 && new_value > file_size {
            new_value = file_size;
        }
        let applied = new_value.saturating_sub(current);
        if applied == 0 {
            return;
        }
        state.file_downloaded.insert(filename.to_string(), new_value);
        state.downloaded_bytes += applied;
        self.emit_progress(&mut state, filename);
    }

    /// Mark a file complete, crediting any bytes the callback missed.
    pub fn end(&self, filename: &str) {
        if filename.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.finished_files.insert(filename.to_string());
        let file_size = state.file_sizes.get(filename).copied().unwrap_or(0);
        let current = state.file_downloaded.get(filename).copied().unwrap_or(0);
        if file_size > 0 && current < file_size {
            state.downloaded_bytes += file_size - current;
            state.file_downloaded.insert(filename.to_string(), file_size);
        }
        self.emit_progress(&mut state, filename);
    }

    /// Offer a raw percent for the active file; regressions from the
    /// computation are suppressed here, not at the callers.
    fn offer(&self, state: &mut AggState, filename: &str, raw_percent: i64) {
        let mut percent = raw_percent.clamp(0, 100) as i16;
        if percent < state.last_percent {
            percent = state.last_percent;
        }
        if percent == state.last_percent {
            return;
        }
        state.last_percent = percent;
        (self.emit)(filename, percent as u8);
    }

    fn emit_progress(&self, state: &mut AggState, filename: &str) {
        let raw = compute_percent(state, filename);
        self.offer(state, filename, raw);
    }

    #[cfg(test)]
    fn offer_raw(&self, filename: &str, raw_percent: i64) {
        let mut state = self.state.lock().unwrap();
        self.offer(&mut state, filename, raw_percent);
    }
}

fn compute_percent(state: &AggState, filename: &str) -> i64 {
    if state.total_bytes > 0 {
        return (state.downloaded_bytes * 100 / state.total_bytes) as i64;
    }
    if state.total_files > 0 {
        let completed = state.finished_files.len() as f64;
        let size = state.file_sizes.get(filename).copied().unwrap_or(0);
        let file_progress = if size > 0 {
            state.file_downloaded.get(filename).copied().unwrap_or(0) as f64 / size as f64
        } else {
            0.0
        };
        return ((completed + file_progress) * 100.0 / state.total_files as f64) as i64;
    }
    let size = state.file_sizes.get(filename).copied().unwrap_or(0);
    if size > 0 {
        (state.file_downloaded.get(filename).copied().unwrap_or(0) * 100 / size) as i64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn collector() -> (Arc<Mutex<Vec<(String, u8)>>>, EmitFn) {
        let sink: Arc<Mutex<Vec<(String, u8)>>> = Arc::new(Mutex::new(Vec::new()));
        let emit_sink = sink.clone();
        let emit: EmitFn = Box::new(move |file, percent| {
            emit_sink.lock().unwrap().push((file.to_string(), percent));
        });
        (sink, emit)
    }

    fn percents(sink: &Arc<Mutex<Vec<(String, u8)>>>) -> Vec<u8> {
        sink.lock().unwrap().iter().map(|(_, p)| *p).collect()
    }

    #[test]
    fn test_byte_total_progress() {
        let (sink, emit) = collector();
        let agg = ProgressAggregator::new(emit, 1000, 2);
        agg.register_file("a.bin", 600);
        agg.register_file("b.bin", 400);

        agg.update("a.bin", 300); // 30%
        agg.update("a.bin", 300); // 60%
        agg.end("a.bin"); // no change, suppressed
        agg.update("b.bin", 400); // 100%
        agg.end("b.bin");

        assert_eq!(percents(&sink), vec![30, 60, 100]);
    }

    #[test]
    fn test_raw_regressions_suppressed() {
        // Raw candidates [10,30,20,45,100] must come out [10,30,30,45,100]
        let (sink, emit) = collector();
        let agg = ProgressAggregator::new(emit, 1_000_000, 3);
        for raw in [10, 30, 20, 45, 100] {
            agg.offer_raw("model.safetensors", raw);
        }
        assert_eq!(percents(&sink), vec![10, 30, 30, 45, 100]);
    }

    #[test]
    fn test_file_count_mode_when_sizes_unknown() {
        let (sink, emit) = collector();
        // No byte manifest and no per-file sizes: count mode
        let agg = ProgressAggregator::new(emit, 0, 2);
        agg.register_file("a.bin", 0);
        agg.register_file("b.bin", 0);

        agg.update("a.bin", 50); // fraction unknown → 0%
        agg.end("a.bin"); // 1 of 2 files → 50%
        agg.update("b.bin", 10); // still 50%, suppressed
        agg.end("b.bin"); // 100%

        assert_eq!(percents(&sink), vec![0, 50, 100]);
    }

    #[test]
    fn test_no_totals_falls_back_to_registered_sizes() {
        let (sink, emit) = collector();
        let agg = ProgressAggregator::new(emit, 0, 0);
        // register grows the byte denominator when no manifest exists
        agg.register_file("solo.bin", 200);
        agg.update("solo.bin", 100);
        agg.update("solo.bin", 100);
        assert_eq!(percents(&sink), vec![50, 100]);
    }

    #[test]
    fn test_percent_capped_at_100() {
        let (sink, emit) = collector();
        let agg = ProgressAggregator::new(emit, 100, 1);
        agg.register_file("a.bin", 0);
        // Deltas past the total cannot push the percent over 100
        agg.update("a.bin", 250);
        assert_eq!(percents(&sink), vec![100]);
    }

    #[test]
    fn test_duplicate_percent_not_emitted() {
        let (sink, emit) = collector();
        let agg = ProgressAggregator::new(emit, 1000, 1);
        agg.register_file("a.bin", 1000);
        agg.update("a.bin", 5); // 0%, same as nothing? 0 > -1 → emitted once
        agg.update("a.bin", 4); // still 0%
        agg.update("a.bin", 1); // 1%
        assert_eq!(percents(&sink), vec![0, 1]);
    }
}
