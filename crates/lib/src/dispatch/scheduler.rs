//! Work queue shared by a job's workers.
//!
//! Hands out plan items in plan-index order, except that a recipient with an unfinished
//! item is held back until that item completes. Unrelated recipients interleave freely.

use super::plan::SendPlan;
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    /// Plan index to send now.
    Item(usize),
    /// Work remains but every remaining recipient is busy.
    Wait,
    /// Nothing left to hand out and nothing in flight.
    Done,
}

#[derive(Debug)]
pub(crate) struct Scheduler {
    /// Remaining plan indices per recipient, in sequence order.
    queues: Vec<VecDeque<usize>>,
    /// (head plan index, recipient index) of every recipient that may be served now.
    ready: BTreeSet<(usize, usize)>,
    in_flight: usize,
}

impl Scheduler {
    pub(crate) fn new(plan: &SendPlan) -> Self {
        let mut queues = vec![VecDeque::new(); plan.recipient_count()];
        for item in plan.items() {
            queues[item.recipient_index].push_back(item.index);
        }
        let ready = queues
            .iter()
            .enumerate()
            .filter_map(|(r, q)| q.front().map(|&head| (head, r)))
            .collect();
        Self {
            queues,
            ready,
            in_flight: 0,
        }
    }

    pub(crate) fn next(&mut self) -> Next {
        match self.ready.pop_first() {
            Some((_, recipient)) => match self.queues[recipient].pop_front() {
                Some(index) => {
                    self.in_flight += 1;
                    Next::Item(index)
                }
                None => self.next(),
            },
            None if self.in_flight > 0 => Next::Wait,
            None => Next::Done,
        }
    }

    /// The recipient's in-flight item is terminal; its next item becomes eligible.
    pub(crate) fn complete(&mut self, recipient_index: usize) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let Some(&head) = self.queues.get(recipient_index).and_then(|q| q.front()) {
            self.ready.insert((head, recipient_index));
        }
    }

    /// Remove every item not yet handed out; returned in plan order.
    pub(crate) fn drain(&mut self) -> Vec<usize> {
        self.ready.clear();
        let mut rest: Vec<usize> = self.queues.iter_mut().flat_map(|q| q.drain(..)).collect();
        rest.sort_unstable();
        rest
    }
}
