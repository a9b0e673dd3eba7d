//! A priority list to help with node selection

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A value ranked by a score; ties are broken by the value itself.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct WeightedValue<S, T> {
    /// A lower score makes this value more likely to be chosen.
    pub score: S,
    pub value: T,
}

/// A priority queue of weighted values.
///
/// Acts as a "min heap", returning values with a lower score first.
pub struct PriorityList<S, T> {
    priority_list: BinaryHeap<Reverse<WeightedValue<S, T>>>,
}

impl<S: Ord, T: Ord> Default for PriorityList<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Ord, T: Ord> PriorityList<S, T> {
    pub fn new() -> Self {
        Self {
            priority_list: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, value: WeightedValue<S, T>) {
        self.priority_list.push(Reverse(value));
    }

    pub fn pop(&mut self) -> Option<WeightedValue<S, T>> {
        self.priority_list.pop().map(|Reverse(value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.priority_list.is_empty()
    }
}

impl<S: Ord, T: Ord> Extend<WeightedValue<S, T>> for PriorityList<S, T> {
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = WeightedValue<S, T>>,
    {
        self.priority_list.extend(iter.into_iter().map(Reverse))
    }
}
