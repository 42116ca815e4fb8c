//! This module contains utility structures for managing k-best elements using a binary heap.
//!
//! `NeighborHeap` is the per-point candidate structure of the approximate search.
//! `KBestNeighbors` is the simpler structure used by the brute-force path.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use ordered_float::OrderedFloat; // For using f32 in BinaryHeap

/// Lifecycle of a candidate slot during refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Placed by tree or random seeding, neighbors not examined yet.
    Unseen,
    /// Discovered while refining, neighbors not examined yet.
    Frontier,
    /// Its own neighbors have been examined.
    Expanded,
}

impl CandidateState {
    /// Whether the candidate still waits to be expanded.
    pub fn is_flagged(self) -> bool {
        !matches!(self, CandidateState::Expanded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub distance: f32,
    pub state: CandidateState,
}

/// Bounded candidate set for one query point.
///
/// The slots form a binary max-heap on distance, so the current worst candidate sits
/// at position 0 and a strictly closer one replaces it in O(log k). A neighbor index
/// is held at most once.
#[derive(Debug, Clone)]
pub struct NeighborHeap {
    capacity: usize,
    slots: Vec<Candidate>,
}

impl NeighborHeap {
    pub fn new(capacity: usize) -> Self {
        NeighborHeap {
            capacity,
            slots: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Largest distance held, or infinity while the heap still has room.
    pub fn worst_distance(&self) -> f32 {
        if self.is_full() {
            self.slots.first().map_or(f32::INFINITY, |c| c.distance)
        } else {
            f32::INFINITY
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.slots.iter().any(|c| c.index == index)
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.slots
    }

    pub fn neighbor_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().map(|c| c.index)
    }

    /// Offers a candidate. Returns `true` if it was stored.
    ///
    /// Rejected without error: non-finite distances, an index already held, and,
    /// once full, anything not strictly closer than the current worst entry.
    pub fn push(&mut self, index: usize, distance: f32, state: CandidateState) -> bool {
        if self.capacity == 0 || !distance.is_finite() {
            return false;
        }
        if self.is_full() && distance >= self.slots[0].distance {
            return false;
        }
        if self.contains(index) {
            return false;
        }

        let candidate = Candidate { index, distance, state };
        if self.slots.len() < self.capacity {
            self.slots.push(candidate);
            self.sift_up(self.slots.len() - 1);
        } else {
            // Replace the root (worst) and restore the heap below it
            self.slots[0] = candidate;
            self.sift_down(0);
        }
        true
    }

    pub fn has_flagged(&self) -> bool {
        self.slots.iter().any(|c| c.state.is_flagged())
    }

    /// Picks the closest candidate still waiting for expansion, marks it
    /// `Expanded` and returns its index. `None` means this point has converged.
    pub fn take_smallest_flagged(&mut self) -> Option<usize> {
        let position = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state.is_flagged())
            .min_by(|(_, a), (_, b)| a.distance.total_cmp(&b.distance).then(a.index.cmp(&b.index)))
            .map(|(pos, _)| pos)?;

        let slot = &mut self.slots[position];
        slot.state = CandidateState::Expanded;
        Some(slot.index)
    }

    /// Moves expanded candidates back to the frontier when `needs_revisit` holds
    /// for their index. Returns how many were re-flagged.
    pub fn reflag<P>(&mut self, needs_revisit: P) -> usize
    where
        P: Fn(usize) -> bool,
    {
        let mut count = 0;
        for slot in self.slots.iter_mut() {
            if slot.state == CandidateState::Expanded && needs_revisit(slot.index) {
                slot.state = CandidateState::Frontier;
                count += 1;
            }
        }
        count
    }

    /// Consumes the heap into parallel index/distance lists, closest first.
    pub fn into_sorted(mut self) -> (Vec<usize>, Vec<f32>) {
        self.slots
            .sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.index.cmp(&b.index)));
        self.slots.into_iter().map(|c| (c.index, c.distance)).unzip()
    }

    // --- binary max-heap maintenance ---

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.slots[idx].distance > self.slots[parent].distance {
                self.slots.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.slots.len();
        loop {
            let mut largest = idx;
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            if left < len && self.slots[left].distance > self.slots[largest].distance {
                largest = left;
            }
            if right < len && self.slots[right].distance > self.slots[largest].distance {
                largest = right;
            }
            if largest == idx {
                break;
            }
            self.slots.swap(idx, largest);
            idx = largest;
        }
    }
}

/// Represents an element in the KBestNeighbors heap, pairing a distance with data.
#[derive(Debug)]
pub struct HeapElement<P> {
    pub distance: OrderedFloat<f32>, // Max-heap stores by distance
    pub data: P,
}

impl<P> PartialEq for HeapElement<P> {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}
impl<P> Eq for HeapElement<P> {}

impl<P> PartialOrd for HeapElement<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for HeapElement<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the largest kept distance sits on top.
        self.distance.cmp(&other.distance)
    }
}

/// Manages a collection of the K "best" (smallest distance) items seen so far.
#[derive(Debug)]
pub struct KBestNeighbors<P> {
    capacity: usize,
    heap: BinaryHeap<HeapElement<P>>,
}

impl<P> KBestNeighbors<P> {
    pub fn new(capacity: usize) -> Self {
        KBestNeighbors {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1), // +1 for easier logic
        }
    }

    pub fn add(&mut self, distance: f32, point_data: P) {
        if self.capacity == 0 {
            return;
        }
        let item = HeapElement { distance: OrderedFloat(distance), data: point_data };
        if self.heap.len() < self.capacity {
            self.heap.push(item);
        } else if self.heap.peek().is_some_and(|top| item.distance < top.distance) {
            self.heap.pop();
            self.heap.push(item);
        }
    }

    pub fn current_farthest_distance(&self) -> Option<f32> {
        if self.heap.len() == self.capacity {
            self.heap.peek().map(|heap_elem| heap_elem.distance.0)
        } else {
            None // Not full yet, effectively infinite radius for pruning
        }
    }

    /// Consumes the collection into `(distance, data)` pairs, closest first.
    pub fn into_sorted_pairs(self) -> Vec<(f32, P)> {
        self.heap.into_sorted_vec().into_iter().map(|elem| (elem.distance.0, elem.data)).collect()
    }

    /// Returns the current number of neighbors stored.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
