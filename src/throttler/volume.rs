use std::collections::{BTreeMap, VecDeque};

use crate::config::VolumeTriggeredEvent;

// 按累计字节数排好序的事件表：key 是触发（或到期）时的累计字节偏移，
// 同一偏移上的多个事件按插入顺序处理。
#[derive(Debug, Default)]
pub struct VolumeSchedule {
    pending: BTreeMap<u64, VecDeque<VolumeTriggeredEvent>>,
    active: BTreeMap<u64, VecDeque<VolumeTriggeredEvent>>,
}

impl VolumeSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, offset: u64, event: VolumeTriggeredEvent) {
        self.pending.entry(offset).or_default().push_back(event);
    }

    pub fn activate(&mut self, expires_at: u64, event: VolumeTriggeredEvent) {
        self.active.entry(expires_at).or_default().push_back(event);
    }

    pub fn pop_due_pending(&mut self, bytes: u64) -> Option<(u64, VolumeTriggeredEvent)> {
        pop_due(&mut self.pending, bytes)
    }

    pub fn pop_due_active(&mut self, bytes: u64) -> Option<(u64, VolumeTriggeredEvent)> {
        pop_due(&mut self.active, bytes)
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    #[cfg(test)]
    pub fn active_len(&self) -> usize {
        self.active.values().map(VecDeque::len).sum()
    }
}

fn pop_due(
    events: &mut BTreeMap<u64, VecDeque<VolumeTriggeredEvent>>,
    bytes: u64,
) -> Option<(u64, VolumeTriggeredEvent)> {
    let mut entry = events.first_entry()?;
    let offset = *entry.key();
    if offset > bytes {
        return None;
    }
    let event = entry.get_mut().pop_front();
    if entry.get().is_empty() {
        entry.remove();
    }
    event.map(|e| (offset, e))
}
