use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use engine_executor::RequestId;

use crate::request::RequestStatus;

/// FIFO of waiting request ids. Preempted requests re-enter at the front.
#[derive(Debug, Default)]
pub struct WaitingQueue {
    ids: VecDeque<RequestId>,
}

impl WaitingQueue {
    pub fn push_back(&mut self, id: RequestId) {
        self.ids.push_back(id);
    }

    pub fn push_front(&mut self, id: RequestId) {
        self.ids.push_front(id);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.ids.iter().position(|x| x == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|x| x == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestId> {
        self.ids.iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Recently finished request ids with their final status, bounded by count
/// and age.
#[derive(Debug)]
pub struct FinishedHistory {
    capacity: usize,
    ttl: Duration,
    order: VecDeque<RequestId>,
    entries: HashMap<RequestId, (RequestStatus, Instant)>,
}

impl FinishedHistory {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity: capacity.max(1), ttl, order: VecDeque::new(), entries: HashMap::new() }
    }

    pub fn insert(&mut self, id: RequestId, status: RequestStatus) {
        self.prune();
        if self.entries.insert(id.clone(), (status, Instant::now())).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<RequestStatus> {
        let (status, at) = self.entries.get(id)?;
        (at.elapsed() <= self.ttl).then_some(*status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self) {
        while let Some(front) = self.order.front() {
            let expired = self.entries.get(front).map_or(true, |(_, at)| at.elapsed() > self.ttl);
            if !expired {
                break;
            }
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}
