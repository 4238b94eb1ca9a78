use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

// ==========================================
// 单线程协作式事件循环里的定时器
// ==========================================
//
// 每个定时器注册时绑定一个动作 `A`（一般是个小枚举），到期时由外层统一分发。
// 这样定时器和它要改的对象之间没有闭包，也就没有隐含的生命周期耦合。

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// 定时器句柄。一次 `reschedule` 最多触发一次；想要周期性就在回调里再 reschedule。
///
/// 句柄不能复制；不用了要交还给 `EventLoop::release`。
#[derive(Debug, PartialEq, Eq)]
pub struct Timer {
    id: TimerId,
}

struct Slot<A> {
    action: A,
    armed: Option<(Duration, u64)>,
}

pub struct EventLoop<A> {
    origin: Instant,
    now: Duration,
    next_id: u64,
    // 同一时刻到期的按上弦顺序触发
    arm_seq: u64,
    slots: HashMap<TimerId, Slot<A>>,
    deadlines: BTreeMap<(Duration, u64), TimerId>,
}

impl<A: Copy> Default for EventLoop<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Copy> EventLoop<A> {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            now: Duration::ZERO,
            next_id: 0,
            arm_seq: 0,
            slots: HashMap::new(),
            deadlines: BTreeMap::new(),
        }
    }

    /// 循环的当前时间（秒，从循环创建开始算）。一轮处理中保持不变。
    pub fn now(&self) -> f64 {
        self.now.as_secs_f64()
    }

    /// 用真实时钟刷新 `now`
    pub fn update_now(&mut self) {
        self.now = self.now.max(self.origin.elapsed());
    }

    pub fn timer(&mut self, action: A) -> Timer {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.slots.insert(id, Slot { action, armed: None });
        Timer { id }
    }

    /// 注销定时器；还挂着的到期也一并取消
    pub fn release(&mut self, timer: Timer) {
        if let Some(slot) = self.slots.remove(&timer.id) {
            if let Some(key) = slot.armed {
                self.deadlines.remove(&key);
            }
        }
    }

    fn arm(&mut self, id: TimerId, delay: f64) {
        self.disarm(id);
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let deadline = self.now.saturating_add(secs_to_duration(delay));
        self.arm_seq += 1;
        let key = (deadline, self.arm_seq);
        slot.armed = Some(key);
        self.deadlines.insert(key, id);
    }

    fn disarm(&mut self, id: TimerId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            if let Some(key) = slot.armed.take() {
                self.deadlines.remove(&key);
            }
        }
    }

    /// 离下一个到期还有多久，给 poll 当超时用
    pub fn time_until_next(&self) -> Option<Duration> {
        self.deadlines
            .keys()
            .next()
            .map(|(at, _)| at.saturating_sub(self.now))
    }

    /// 取出一个已经到期的动作（到期时间 <= now），取出即视为已触发
    pub fn pop_due(&mut self) -> Option<A> {
        let (&key, &id) = self.deadlines.iter().next()?;
        if key.0 > self.now {
            return None;
        }
        self.deadlines.remove(&key);
        let slot = self.slots.get_mut(&id)?;
        slot.armed = None;
        Some(slot.action)
    }
}

// 负数按 0 算，大到 Duration 装不下的按“永远”算
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
impl<A: Copy> EventLoop<A> {
    /// 手动拨表，时间只会往前走
    pub fn set_now(&mut self, secs: f64) {
        self.now = self.now.max(secs_to_duration(secs));
    }

    /// 最早的到期时间（秒）
    pub fn next_deadline(&self) -> Option<f64> {
        self.deadlines.keys().next().map(|(at, _)| at.as_secs_f64())
    }

    /// 仿真推进：如果最早的到期点不晚于 `limit`，把时钟拨到那一刻并取出它
    pub fn step_until(&mut self, limit: f64) -> Option<A> {
        let (&(at, _), _) = self.deadlines.iter().next()?;
        if at.as_secs_f64() > limit {
            return None;
        }
        self.now = self.now.max(at);
        self.pop_due()
    }

    pub fn pending(&self) -> usize {
        self.deadlines.len()
    }

    pub fn registered(&self) -> usize {
        self.slots.len()
    }
}

impl Timer {
    /// 取消还没触发的那次，然后从现在起 `delay` 秒后再触发
    pub fn reschedule<A: Copy>(&self, ev: &mut EventLoop<A>, delay: f64) {
        ev.arm(self.id, delay);
    }

    pub fn stop<A: Copy>(&self, ev: &mut EventLoop<A>) {
        ev.disarm(self.id);
    }

    #[cfg(test)]
    pub fn is_active<A: Copy>(&self, ev: &EventLoop<A>) -> bool {
        ev.slots.get(&self.id).is_some_and(|s| s.armed.is_some())
    }
}
