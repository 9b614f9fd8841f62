//! Bounded best-first candidate queue for greedy search.
//!
//! Holds `(vertex, distance, pq-estimate flag)` tuples sorted ascending by
//! distance, capped at the beam width. On top of the usual bounded-insert
//! operation it tracks which candidates have already been *checked*
//! (returned for expansion or precise re-scoring) and supports re-keying a
//! candidate in place when its PQ estimate is replaced by a precise distance.
//!
//! Positions returned by [`BoundedGreedyVertexQueue::next_not_checked`] and
//! [`BoundedGreedyVertexQueue::resort`] are plain indexes into the sorted
//! array; an insert or resort shifts later elements, and callers holding
//! positions across such calls must repair them (see the beam search in
//! `disk.rs`).

const FLAG_PQ: u8 = 1;
const FLAG_CHECKED: u8 = 2;

/// Bounded priority queue of search candidates, closest first.
pub(crate) struct BoundedGreedyVertexQueue {
    capacity: usize,
    ids: Vec<u32>,
    distances: Vec<f32>,
    flags: Vec<u8>,
    /// Every element below this index is checked.
    first_unchecked: usize,
}

impl BoundedGreedyVertexQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            capacity,
            ids: Vec::with_capacity(capacity + 1),
            distances: Vec::with_capacity(capacity + 1),
            flags: Vec::with_capacity(capacity + 1),
            first_unchecked: 0,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.ids.clear();
        self.distances.clear();
        self.flags.clear();
        self.first_unchecked = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Distance of the worst candidate currently held, or infinity when
    /// empty.
    pub(crate) fn max_distance(&self) -> f32 {
        self.distances.last().copied().unwrap_or(f32::INFINITY)
    }

    pub(crate) fn id_at(&self, position: usize) -> u32 {
        self.ids[position]
    }

    pub(crate) fn distance_at(&self, position: usize) -> f32 {
        self.distances[position]
    }

    pub(crate) fn is_pq(&self, position: usize) -> bool {
        self.flags[position] & FLAG_PQ != 0
    }

    /// Insert a candidate at its sorted position.
    ///
    /// A candidate no closer than the current worst is dropped when the queue
    /// is full; otherwise the worst element falls off the end.
    pub(crate) fn push(&mut self, id: u32, distance: f32, is_pq: bool) {
        let position = self.distances.partition_point(|&d| d <= distance);
        if position == self.capacity {
            return;
        }

        self.ids.insert(position, id);
        self.distances.insert(position, distance);
        self.flags.insert(position, if is_pq { FLAG_PQ } else { 0 });

        if self.ids.len() > self.capacity {
            self.ids.truncate(self.capacity);
            self.distances.truncate(self.capacity);
            self.flags.truncate(self.capacity);
        }

        self.first_unchecked = self.first_unchecked.min(position);
    }

    /// Position of the closest not-yet-checked candidate, marking it checked.
    pub(crate) fn next_not_checked(&mut self) -> Option<usize> {
        let mut position = self.first_unchecked;
        while position < self.flags.len() && self.flags[position] & FLAG_CHECKED != 0 {
            position += 1;
        }
        if position >= self.flags.len() {
            self.first_unchecked = self.flags.len();
            return None;
        }

        self.flags[position] |= FLAG_CHECKED;

        // Advance the hint past the checked prefix.
        let mut hint = self.first_unchecked;
        while hint < self.flags.len() && self.flags[hint] & FLAG_CHECKED != 0 {
            hint += 1;
        }
        self.first_unchecked = hint;

        Some(position)
    }

    /// Return the candidate at `position` to the not-checked pool so a later
    /// [`Self::next_not_checked`] offers it again.
    pub(crate) fn uncheck(&mut self, position: usize) {
        self.flags[position] &= !FLAG_CHECKED;
        self.first_unchecked = self.first_unchecked.min(position);
    }

    /// Replace the distance of the candidate at `position` (typically a PQ
    /// estimate superseded by a precise value) and move it to its new sorted
    /// position, which is returned.
    ///
    /// The candidate becomes not-checked and loses its PQ flag, so it will be
    /// offered again by [`Self::next_not_checked`], now eligible for
    /// expansion.
    pub(crate) fn resort(&mut self, position: usize, distance: f32) -> usize {
        let id = self.ids.remove(position);
        self.distances.remove(position);
        self.flags.remove(position);
        if position < self.first_unchecked {
            self.first_unchecked -= 1;
        }

        let new_position = self.distances.partition_point(|&d| d <= distance);
        self.ids.insert(new_position, id);
        self.distances.insert(new_position, distance);
        self.flags.insert(new_position, 0);

        self.first_unchecked = self.first_unchecked.min(new_position);
        new_position
    }

    /// Copy the closest candidate ids into `out`, returning how many were
    /// written.
    pub(crate) fn fill_results(&self, out: &mut [u32]) -> usize {
        let n = self.ids.len().min(out.len());
        out[..n].copy_from_slice(&self.ids[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_keeps_sorted_order_and_bound() {
        let mut queue = BoundedGreedyVertexQueue::new(4);
        for (id, distance) in [(1, 5.0), (2, 1.0), (3, 3.0), (4, 4.0), (5, 2.0)] {
            queue.push(id, distance, false);
        }

        assert_eq!(queue.len(), 4);
        let ids: Vec<u32> = (0..4).map(|i| queue.id_at(i)).collect();
        assert_eq!(ids, vec![2, 5, 3, 4]);
        assert_eq!(queue.max_distance(), 4.0);

        // Worse than the current maximum: dropped.
        queue.push(6, 9.0, false);
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.max_distance(), 4.0);
    }

    #[test]
    fn test_cursor_walks_in_distance_order() {
        let mut queue = BoundedGreedyVertexQueue::new(8);
        queue.push(10, 3.0, false);
        queue.push(11, 1.0, false);
        queue.push(12, 2.0, false);

        let a = queue.next_not_checked().unwrap();
        assert_eq!(queue.id_at(a), 11);
        let b = queue.next_not_checked().unwrap();
        assert_eq!(queue.id_at(b), 12);

        // A closer insert rewinds the cursor.
        queue.push(13, 0.5, false);
        let c = queue.next_not_checked().unwrap();
        assert_eq!(queue.id_at(c), 13);

        let d = queue.next_not_checked().unwrap();
        assert_eq!(queue.id_at(d), 10);
        assert!(queue.next_not_checked().is_none());
    }

    #[test]
    fn test_resort_rekeys_and_reoffers() {
        let mut queue = BoundedGreedyVertexQueue::new(8);
        queue.push(1, 1.0, false);
        queue.push(2, 2.0, true);
        queue.push(3, 3.0, false);

        let first = queue.next_not_checked().unwrap();
        assert_eq!(queue.id_at(first), 1);

        let position = queue.next_not_checked().unwrap();
        assert_eq!(queue.id_at(position), 2);
        assert!(queue.is_pq(position));

        // Precise distance pushes the candidate behind id 3.
        let new_position = queue.resort(position, 4.0);
        assert_eq!(queue.id_at(new_position), 2);
        assert!(!queue.is_pq(new_position));

        // It is offered again at its new rank, after id 3.
        let next = queue.next_not_checked().unwrap();
        assert_eq!(queue.id_at(next), 3);
        let next = queue.next_not_checked().unwrap();
        assert_eq!(queue.id_at(next), 2);
    }

    #[test]
    fn test_resort_toward_front() {
        let mut queue = BoundedGreedyVertexQueue::new(8);
        queue.push(1, 1.0, false);
        queue.push(2, 2.0, false);
        queue.push(3, 3.0, true);

        queue.next_not_checked();
        queue.next_not_checked();
        let position = queue.next_not_checked().unwrap();
        assert_eq!(queue.id_at(position), 3);

        let new_position = queue.resort(position, 0.5);
        assert_eq!(new_position, 0);
        assert_eq!(queue.id_at(0), 3);

        // Re-offered from the front.
        let next = queue.next_not_checked().unwrap();
        assert_eq!(next, 0);
    }

    #[test]
    fn test_fill_results_handles_short_output() {
        let mut queue = BoundedGreedyVertexQueue::new(8);
        queue.push(7, 1.0, false);
        queue.push(8, 2.0, false);

        let mut out = [0u32; 5];
        assert_eq!(queue.fill_results(&mut out), 2);
        assert_eq!(&out[..2], &[7, 8]);

        let mut short = [0u32; 1];
        assert_eq!(queue.fill_results(&mut short), 1);
        assert_eq!(short[0], 7);
    }

    proptest! {
        /// Arbitrary interleavings of pushes and cursor pulls keep the array
        /// sorted, bounded, and never offer a position twice without a
        /// rewinding insert below it.
        #[test]
        fn prop_queue_stays_sorted_and_bounded(
            ops in prop::collection::vec((0u32..64, 0u32..1000, any::<bool>()), 1..200)
        ) {
            let mut queue = BoundedGreedyVertexQueue::new(16);
            for (i, (id, milli, is_pq)) in ops.into_iter().enumerate() {
                queue.push(id, milli as f32 / 10.0, is_pq);
                if i % 3 == 0 {
                    queue.next_not_checked();
                }

                prop_assert!(queue.len() <= 16);
                for w in 1..queue.len() {
                    prop_assert!(queue.distance_at(w - 1) <= queue.distance_at(w));
                }
            }
        }
    }
}
