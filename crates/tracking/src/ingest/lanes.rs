//! Bounded per-lane ping queues.
//!
//! A vehicle always hashes to the same lane, and each lane has exactly one
//! consumer, so one vehicle's pings are processed in order by a single
//! writer. A full lane never blocks the producer: it sheds an older ping to
//! make room for the new one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use twox_hash::XxHash64;

use crate::identifiers::*;
use crate::models::vehicle::PositionPing;

const LANE_HASH_SEED: u64 = 0;

#[derive(Debug, PartialEq)]
pub enum Enqueued {
    Queued,
    /// Queued after evicting this older ping.
    Shed(PositionPing),
}

pub struct Lane {
    queue: Mutex<VecDeque<PositionPing>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl Lane {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue `ping`, shedding when full. Hands the ping back once the lane
    /// is closed.
    pub fn push(&self, ping: PositionPing) -> Result<Enqueued, PositionPing> {
        let mut queue = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(ping);
        }
        let shed = if queue.len() >= self.capacity {
            shed_index(&queue, &ping.vehicle_id).and_then(|i| queue.remove(i))
        } else {
            None
        };
        queue.push_back(ping);
        drop(queue);
        self.notify.notify_one();

        Ok(shed.map_or(Enqueued::Queued, Enqueued::Shed))
    }

    /// Next ping in arrival order. Returns `None` once the lane is closed and
    /// drained.
    pub async fn pop(&self) -> Option<PositionPing> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.lock();
                if let Some(ping) = queue.pop_front() {
                    return Some(ping);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting pings. Queued pings are still handed out.
    pub fn close(&self) {
        let _queue = self.lock();
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PositionPing>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Which queued ping to drop for one from `incoming`: that vehicle's oldest,
/// else the oldest ping of any vehicle with a newer one queued, else the
/// front of the lane.
fn shed_index(queue: &VecDeque<PositionPing>, incoming: &VehicleIdentifier) -> Option<usize> {
    if let Some(i) = queue.iter().position(|p| &p.vehicle_id == incoming) {
        return Some(i);
    }

    let mut queued: HashMap<&VehicleIdentifier, usize> = HashMap::new();
    for ping in queue {
        *queued.entry(&ping.vehicle_id).or_default() += 1;
    }
    queue
        .iter()
        .position(|p| queued.get(&p.vehicle_id).is_some_and(|n| *n > 1))
        .or_else(|| (!queue.is_empty()).then_some(0))
}

/// Fixed set of lanes, addressed by vehicle id.
pub struct Lanes {
    lanes: Vec<Lane>,
}

impl Lanes {
    pub fn new(count: usize, capacity: usize) -> Self {
        Self {
            lanes: (0..count.max(1)).map(|_| Lane::new(capacity)).collect(),
        }
    }

    pub fn lane_index(&self, vehicle_id: &VehicleIdentifier) -> usize {
        let hash = XxHash64::oneshot(LANE_HASH_SEED, vehicle_id.as_str().as_bytes());
        (hash % self.lanes.len() as u64) as usize
    }

    pub fn lane_for(&self, vehicle_id: &VehicleIdentifier) -> &Lane {
        &self.lanes[self.lane_index(vehicle_id)]
    }

    pub fn lane(&self, index: usize) -> Option<&Lane> {
        self.lanes.get(index)
    }

    pub fn count(&self) -> usize {
        self.lanes.len()
    }

    pub fn close_all(&self) {
        for lane in &self.lanes {
            lane.close();
        }
    }

    /// Pings queued across all lanes.
    pub fn backlog(&self) -> usize {
        self.lanes.iter().map(Lane::len).sum()
    }
}
