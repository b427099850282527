//! Priority-ordered write scheduling.
//!
//! Eight urgency levels; level 0 drains first. Within a level, incremental
//! streams round-robin while non-incremental streams replay in insertion
//! order. Membership mirrors the manager's priority map.

#![forbid(unsafe_code)]

use crate::stream::StreamPriority;
use crate::types::{StreamId, DEFAULT_MAX_PRIORITY};

#[derive(Debug, Default, Clone)]
struct Level {
    streams: Vec<StreamId>,
    /// Round-robin cursor for incremental scheduling.
    next: usize,
    incremental: bool,
}

impl Level {
    fn insert(&mut self, id: StreamId) {
        if !self.streams.contains(&id) {
            self.streams.push(id);
        }
    }

    fn erase(&mut self, id: StreamId) -> bool {
        if let Some(pos) = self.streams.iter().position(|&s| s == id) {
            self.streams.remove(pos);
            if self.next > pos {
                self.next -= 1;
            }
            if !self.streams.is_empty() {
                self.next %= self.streams.len();
            } else {
                self.next = 0;
            }
            true
        } else {
            false
        }
    }
}

/// Write-scheduling queue across priority levels.
#[derive(Debug, Clone)]
pub struct PriorityQueue {
    levels: Vec<Level>,
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            levels: vec![Level::default(); DEFAULT_MAX_PRIORITY as usize + 1],
        }
    }

    fn level_index(priority: StreamPriority) -> usize {
        priority.level.min(DEFAULT_MAX_PRIORITY) as usize
    }

    /// Insert a stream, or move it when its priority changed.
    pub fn insert_or_update(&mut self, id: StreamId, priority: StreamPriority) {
        let target = Self::level_index(priority);
        for (index, level) in self.levels.iter_mut().enumerate() {
            if index != target {
                level.erase(id);
            }
        }
        let level = &mut self.levels[target];
        level.incremental = priority.incremental;
        level.insert(id);
    }

    /// Re-level the stream only if it is already queued. A same-priority
    /// update leaves its position untouched.
    pub fn update_if_exist(&mut self, id: StreamId, priority: StreamPriority) {
        let target = Self::level_index(priority);
        if self.levels[target].streams.contains(&id) {
            self.levels[target].incremental = priority.incremental;
            return;
        }
        if self.contains(id) {
            self.insert_or_update(id, priority);
        }
    }

    pub fn erase(&mut self, id: StreamId) -> bool {
        self.levels.iter_mut().any(|level| level.erase(id))
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.levels.iter().any(|level| level.streams.contains(&id))
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|level| level.streams.is_empty())
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(|level| level.streams.len()).sum()
    }

    /// Position of a stream within its level, for position-stability checks.
    pub fn position(&self, id: StreamId) -> Option<(u8, usize)> {
        for (index, level) in self.levels.iter().enumerate() {
            if let Some(pos) = level.streams.iter().position(|&s| s == id) {
                return Some((index as u8, pos));
            }
        }
        None
    }

    /// Next stream to write: the front of the most urgent non-empty level.
    /// Incremental levels advance their round-robin cursor on consume.
    pub fn peek_next_scheduled_stream(&self) -> Option<StreamId> {
        self.levels
            .iter()
            .find(|level| !level.streams.is_empty())
            .map(|level| level.streams[level.next % level.streams.len()])
    }

    /// Advance scheduling past the given stream after it was serviced.
    pub fn consume(&mut self, id: StreamId) {
        for level in &mut self.levels {
            if level.streams.is_empty() {
                continue;
            }
            if level.streams[level.next % level.streams.len()] == id {
                if level.incremental {
                    level.next = (level.next + 1) % level.streams.len();
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pri(level: u8, incremental: bool) -> StreamPriority {
        StreamPriority { level, incremental }
    }

    #[test]
    fn test_urgency_ordering() {
        let mut queue = PriorityQueue::new();
        queue.insert_or_update(StreamId(0), pri(5, false));
        queue.insert_or_update(StreamId(4), pri(1, false));
        queue.insert_or_update(StreamId(8), pri(7, false));
        assert_eq!(queue.peek_next_scheduled_stream(), Some(StreamId(4)));
        queue.erase(StreamId(4));
        assert_eq!(queue.peek_next_scheduled_stream(), Some(StreamId(0)));
    }

    #[test]
    fn test_incremental_round_robin() {
        let mut queue = PriorityQueue::new();
        queue.insert_or_update(StreamId(0), pri(3, true));
        queue.insert_or_update(StreamId(4), pri(3, true));
        let first = queue.peek_next_scheduled_stream().unwrap();
        queue.consume(first);
        let second = queue.peek_next_scheduled_stream().unwrap();
        assert_ne!(first, second);
        queue.consume(second);
        assert_eq!(queue.peek_next_scheduled_stream(), Some(first));
    }

    #[test]
    fn test_non_incremental_stays_at_front() {
        let mut queue = PriorityQueue::new();
        queue.insert_or_update(StreamId(0), pri(3, false));
        queue.insert_or_update(StreamId(4), pri(3, false));
        let first = queue.peek_next_scheduled_stream().unwrap();
        queue.consume(first);
        assert_eq!(queue.peek_next_scheduled_stream(), Some(first));
    }

    #[test]
    fn test_update_if_exist_same_priority_keeps_position() {
        let mut queue = PriorityQueue::new();
        queue.insert_or_update(StreamId(0), pri(3, false));
        queue.insert_or_update(StreamId(4), pri(3, false));
        let before = queue.position(StreamId(0));
        queue.update_if_exist(StreamId(0), pri(3, false));
        assert_eq!(queue.position(StreamId(0)), before);
    }

    #[test]
    fn test_update_if_exist_moves_levels() {
        let mut queue = PriorityQueue::new();
        queue.insert_or_update(StreamId(0), pri(3, false));
        queue.update_if_exist(StreamId(0), pri(1, false));
        assert_eq!(queue.position(StreamId(0)).unwrap().0, 1);
        // Absent streams stay absent.
        queue.update_if_exist(StreamId(4), pri(2, false));
        assert!(!queue.contains(StreamId(4)));
    }

    #[test]
    fn test_erase_unknown_is_noop() {
        let mut queue = PriorityQueue::new();
        assert!(!queue.erase(StreamId(0)));
        assert!(queue.is_empty());
    }
}
