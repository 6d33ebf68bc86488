//! Per-stage completion grids.
//!
//! A [`CounterGrid`] tallies task completions for one pipeline stage over the
//! live frame window, indexed by (frame slot, symbol id). The master thread
//! is the single writer; no synchronization is used or needed.
//!
//! Closure semantics (contract):
//! - `complete_task` returns true exactly when `tasks_done` reaches the
//!   symbol's task limit, the "symbol done" signal, emitted once.
//! - `complete_symbol` returns true exactly when `symbols_done` reaches the
//!   stage's symbol limit, the "stage done for frame" signal, emitted once.
//! - `reset` clears the frame's column and must run exactly once per frame,
//!   in the retirement path. Any later event for that frame asserts.
//!
//! Misuse (a task completion on an already-closed symbol, or any event after
//! reset) is a scheduler bug, not a runtime condition: both panic.

/// 2-D completion tally for one stage over the frame window.
#[derive(Debug)]
pub struct CounterGrid {
    window: usize,
    /// Columns per slot; symbol ids index into this stride.
    stride: usize,
    task_limit: usize,
    symbol_limit: usize,
    tasks_done: Vec<usize>,
    symbols_done: Vec<usize>,
    /// Highest frame id reset in each slot; events at or below it assert.
    last_reset: Vec<Option<u32>>,
}

impl CounterGrid {
    /// Grid with a uniform per-symbol task limit.
    ///
    /// `stride` is the number of symbol columns per slot (usually the frame
    /// length; 1 for per-frame stages such as beam).
    pub fn new(window: usize, stride: usize, task_limit: usize, symbol_limit: usize) -> Self {
        assert!(window > 0 && stride > 0);
        assert!(symbol_limit <= stride);
        Self {
            window,
            stride,
            task_limit,
            symbol_limit,
            tasks_done: vec![0; window * stride],
            symbols_done: vec![0; window],
            last_reset: vec![None; window],
        }
    }

    fn slot(&self, frame_id: u32) -> usize {
        frame_id as usize % self.window
    }

    fn cell(&self, frame_id: u32, symbol_id: u16) -> usize {
        let sym = symbol_id as usize;
        assert!(sym < self.stride, "symbol {sym} outside stride {}", self.stride);
        self.slot(frame_id) * self.stride + sym
    }

    fn assert_not_reset(&self, frame_id: u32) {
        let slot = self.slot(frame_id);
        assert!(
            self.last_reset[slot].is_none_or(|r| frame_id > r),
            "counter event for frame {frame_id} after reset"
        );
    }

    /// Record one task completion. True exactly when the symbol closes.
    pub fn complete_task(&mut self, frame_id: u32, symbol_id: u16) -> bool {
        self.assert_not_reset(frame_id);
        let cell = self.cell(frame_id, symbol_id);
        assert!(
            self.tasks_done[cell] < self.task_limit,
            "task completion on closed symbol (frame {frame_id}, symbol {symbol_id})"
        );
        self.tasks_done[cell] += 1;
        self.tasks_done[cell] == self.task_limit
    }

    /// Record one symbol closure. True exactly when the stage closes for the
    /// frame.
    pub fn complete_symbol(&mut self, frame_id: u32) -> bool {
        self.assert_not_reset(frame_id);
        let slot = self.slot(frame_id);
        assert!(
            self.symbols_done[slot] < self.symbol_limit,
            "symbol completion on closed stage (frame {frame_id})"
        );
        self.symbols_done[slot] += 1;
        self.symbols_done[slot] == self.symbol_limit
    }

    /// A stage with zero symbols is vacuously complete.
    pub fn is_vacuous(&self) -> bool {
        self.symbol_limit == 0
    }

    pub fn symbol_done(&self, frame_id: u32, symbol_id: u16) -> bool {
        self.tasks_done[self.cell(frame_id, symbol_id)] == self.task_limit
    }

    pub fn frame_done(&self, frame_id: u32) -> bool {
        self.symbols_done[self.slot(frame_id)] == self.symbol_limit
    }

    pub fn tasks_done(&self, frame_id: u32, symbol_id: u16) -> usize {
        self.tasks_done[self.cell(frame_id, symbol_id)]
    }

    pub fn symbols_done(&self, frame_id: u32) -> usize {
        self.symbols_done[self.slot(frame_id)]
    }

    /// Clear the frame's column for slot reuse. Exactly once per frame.
    pub fn reset(&mut self, frame_id: u32) {
        let slot = self.slot(frame_id);
        assert!(
            self.last_reset[slot].is_none_or(|r| frame_id > r),
            "double reset for frame {frame_id}"
        );
        let base = slot * self.stride;
        self.tasks_done[base..base + self.stride].fill(0);
        self.symbols_done[slot] = 0;
        self.last_reset[slot] = Some(frame_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_closes_exactly_once() {
        let mut g = CounterGrid::new(4, 8, 3, 2);
        assert!(!g.complete_task(0, 1));
        assert!(!g.complete_task(0, 1));
        assert!(g.complete_task(0, 1));
        assert!(g.symbol_done(0, 1));
        assert!(!g.symbol_done(0, 2));
    }

    #[test]
    fn frame_closes_after_symbol_limit() {
        let mut g = CounterGrid::new(4, 8, 1, 2);
        assert!(g.complete_task(5, 0));
        assert!(!g.complete_symbol(5));
        assert!(g.complete_task(5, 3));
        assert!(g.complete_symbol(5));
        assert!(g.frame_done(5));
    }

    #[test]
    #[should_panic(expected = "closed symbol")]
    fn over_completion_asserts() {
        let mut g = CounterGrid::new(2, 4, 1, 1);
        let _ = g.complete_task(0, 0);
        let _ = g.complete_task(0, 0);
    }

    #[test]
    fn reset_clears_and_slot_is_reusable() {
        let mut g = CounterGrid::new(2, 4, 2, 1);
        let _ = g.complete_task(1, 0);
        g.reset(1);
        assert_eq!(g.tasks_done(3, 0), 0);
        // Frame 3 shares slot 1; it may now count from zero.
        assert!(!g.complete_task(3, 0));
        assert!(g.complete_task(3, 0));
    }

    #[test]
    #[should_panic(expected = "after reset")]
    fn events_after_reset_assert() {
        let mut g = CounterGrid::new(2, 4, 2, 1);
        g.reset(0);
        let _ = g.complete_task(0, 0);
    }

    #[test]
    #[should_panic(expected = "double reset")]
    fn double_reset_asserts() {
        let mut g = CounterGrid::new(2, 4, 2, 1);
        g.reset(0);
        g.reset(0);
    }

    #[test]
    fn monotonic_symbols_done_until_reset() {
        let mut g = CounterGrid::new(4, 4, 1, 3);
        let mut last = 0;
        for sym in [0u16, 1, 2] {
            let _ = g.complete_task(2, sym);
            let _ = g.complete_symbol(2);
            assert!(g.symbols_done(2) > last);
            last = g.symbols_done(2);
        }
        g.reset(2);
        assert_eq!(g.symbols_done(6), 0);
    }
}
