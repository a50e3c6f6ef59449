//! Bounded ring of recently broadcast frames.
//!
//! Written by the hub's broadcast path, read by the HTTP history endpoint.
//! JOIN and QUIT never enter the ring.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct History {
    capacity: usize,
    frames: RwLock<VecDeque<Arc<String>>>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a marshalled frame, evicting the oldest on overflow.
    /// A zero-capacity ring discards everything.
    pub fn push(&self, frame: Arc<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut frames = self.frames.write().unwrap_or_else(|e| e.into_inner());
        if frames.len() >= self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// The retained frames, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<String>> {
        self.frames
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Arc<String> {
        Arc::new(s.to_string())
    }

    #[test]
    fn fifo_eviction() {
        // S6: ring of 3, pushed M1..M4, retains [M2, M3, M4]
        let history = History::new(3);
        for m in ["M1", "M2", "M3", "M4"] {
            history.push(frame(m));
        }
        let got: Vec<String> = history.snapshot().iter().map(|f| f.to_string()).collect();
        assert_eq!(got, vec!["M2", "M3", "M4"]);
    }

    #[test]
    fn zero_capacity_discards() {
        let history = History::new(0);
        history.push(frame("M1"));
        assert!(history.is_empty());
    }

    #[test]
    fn under_capacity_keeps_order() {
        let history = History::new(10);
        history.push(frame("A"));
        history.push(frame("B"));
        let got: Vec<String> = history.snapshot().iter().map(|f| f.to_string()).collect();
        assert_eq!(got, vec!["A", "B"]);
    }
}
