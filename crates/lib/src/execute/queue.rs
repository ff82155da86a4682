use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Ready steps, most expensive first, then by declaration order.
#[derive(Debug, Default)]
pub struct ReadyQueue {
  heap: BinaryHeap<Entry>,
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
  cost: u64,
  index: usize,
}

impl Ord for Entry {
  fn cmp(&self, other: &Self) -> Ordering {
    self.cost.cmp(&other.cost).then_with(|| other.index.cmp(&self.index))
  }
}

impl PartialOrd for Entry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl ReadyQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, index: usize, cost: u64) {
    self.heap.push(Entry { cost, index });
  }

  pub fn pop(&mut self) -> Option<usize> {
    self.heap.pop().map(|e| e.index)
  }

  pub fn is_empty(&self) -> bool {
    self.heap.is_empty()
  }
}
