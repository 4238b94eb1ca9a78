use std::collections::VecDeque;

use log::{info, trace};

use crate::config::{LinkEffect, LinkProperties};
use crate::timer::{EventLoop, Timer};

mod token_bucket;
mod volume;

use token_bucket::{TICK_SECS, TokenBucket};
use volume::VolumeSchedule;

// ==========================================
// 单方向的整形器：令牌桶 + 定时/按量触发的效果
// ==========================================
//
// 排队的不是闭包而是条目 `T`（一般就是数据包）；放行时交给调用方传进来的 `admit`。
pub struct Throttler<T> {
    enabled: bool,
    throttle_kbps: i64,
    bucket: TokenBucket,
    tick_timer: Timer,

    queue: VecDeque<(u64, T)>,
    queued_cost: u64,
    max_queue: u64, // 0 = 不限

    bytes_total: u64, // 有史以来进来过的字节
    drop_bytes: i64,  // 强制丢包预算
    volume: VolumeSchedule,
}

impl<T> Throttler<T> {
    pub fn new(tick_timer: Timer) -> Self {
        Self {
            enabled: false,
            throttle_kbps: 0,
            bucket: TokenBucket::new(),
            tick_timer,
            queue: VecDeque::new(),
            queued_cost: 0,
            max_queue: 0,
            bytes_total: 0,
            drop_bytes: 0,
            volume: VolumeSchedule::new(),
        }
    }

    /// 按链路初始属性打开整形；没配吞吐量就只记下丢包预算和按量事件
    pub fn enable<A: Copy>(&mut self, ev: &mut EventLoop<A>, properties: &LinkProperties) {
        if let Some(kbps) = properties.throughput_kbps {
            self.enabled = true;
            self.throttle_kbps = kbps as i64;
            if let Some(max_queue) = properties.max_queue_bytes {
                self.max_queue = max_queue;
            }
        }

        self.drop_bytes += properties.drop_bytes;
        for event in &properties.volume_events {
            self.volume.schedule(event.trigger_at_bytes, event.clone());
        }

        self.recompute();
        if self.enabled {
            self.bucket.fill();
            self.tick_timer.reschedule(ev, TICK_SECS);
        }
    }

    /// 提交 `cost` 字节。可能立刻放行、排队、或者直接丢掉（丢掉时 `admit` 不会被调用）。
    pub fn insert(&mut self, cost: u64, item: T, mut admit: impl FnMut(T)) {
        self.fire_volume_events();
        self.bytes_total += cost;

        if self.drop_bytes > 0 {
            self.drop_bytes = (self.drop_bytes - cost as i64).max(0);
            trace!("forced drop of {} bytes, {} left", cost, self.drop_bytes);
            return;
        }

        if !self.enabled {
            admit(item);
        } else if self.max_queue > 0 && self.queued_cost > self.max_queue {
            // 队列满了，丢
            trace!("queue overflow ({} bytes queued), dropping {} bytes", self.queued_cost, cost);
        } else {
            self.queue.push_back((cost, item));
            self.queued_cost += cost;
            self.transmit(&mut admit);
        }
    }

    /// 节拍回调：补水、放行、续期
    pub fn tick<A: Copy>(&mut self, ev: &mut EventLoop<A>, mut admit: impl FnMut(T)) {
        if !self.enabled {
            return;
        }
        self.bucket.refill();
        self.transmit(&mut admit);
        self.tick_timer.reschedule(ev, TICK_SECS);
    }

    // 严格 FIFO，队头付不起就停，不按大小插队
    fn transmit(&mut self, admit: &mut impl FnMut(T)) {
        while let Some(&(cost, _)) = self.queue.front() {
            if !self.bucket.consume(cost) {
                break;
            }
            if let Some((cost, item)) = self.queue.pop_front() {
                self.queued_cost -= cost;
                admit(item);
            }
        }
    }

    fn fire_volume_events(&mut self) {
        while let Some((offset, event)) = self.volume.pop_due_pending(self.bytes_total) {
            self.apply(&event.effect);
            if let Some(active_for) = event.active_for_bytes {
                self.volume.activate(offset + active_for, event);
            } else if let Some(repeat) = event.repeat_after_bytes.filter(|r| *r > 0) {
                self.volume.schedule(offset + repeat, event);
            }
        }

        while let Some((offset, event)) = self.volume.pop_due_active(self.bytes_total) {
            self.revert(&event.effect);
            if let Some(repeat) = event.repeat_after_bytes.filter(|r| *r > 0) {
                self.volume.schedule(offset + repeat, event);
            }
        }
    }

    fn recompute(&mut self) {
        self.bucket.set_rate(self.throttle_kbps);
    }

    pub fn apply(&mut self, effect: &LinkEffect) {
        let delta = effect.throughput_kbps_change;
        if delta != 0 && self.enabled {
            self.throttle_kbps += delta;
            info!(
                "Applying throughput change of {} kbps (now {} kbps)",
                delta, self.throttle_kbps
            );
            self.recompute();
        }

        // 丢包预算是一次性消耗的，revert 不还
        if effect.drop_bytes != 0 {
            self.drop_bytes += effect.drop_bytes;
            info!("Dropping next {} bytes", self.drop_bytes);
        }
    }

    pub fn revert(&mut self, effect: &LinkEffect) {
        let delta = effect.throughput_kbps_change;
        if delta != 0 && self.enabled {
            self.throttle_kbps -= delta;
            info!(
                "Reverting throughput change of {} kbps (now {} kbps)",
                delta, self.throttle_kbps
            );
            self.recompute();
        }
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// 注销节拍定时器，还没放行的条目一起扔掉
    pub fn release<A: Copy>(self, ev: &mut EventLoop<A>) {
        ev.release(self.tick_timer);
    }
}

#[cfg(test)]
impl<T> Throttler<T> {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn throttle_kbps(&self) -> i64 {
        self.throttle_kbps
    }

    pub fn drop_bytes(&self) -> i64 {
        self.drop_bytes
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    pub fn queued_cost(&self) -> u64 {
        self.queued_cost
    }

    pub fn capacity(&self) -> u64 {
        self.bucket.tokens
    }

    pub fn volume_backlog(&self) -> (usize, usize) {
        (self.volume.pending_len(), self.volume.active_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeTriggeredEvent;

    fn throttler(ev: &mut EventLoop<u8>, props: &LinkProperties) -> Throttler<u32> {
        let timer = ev.timer(0);
        let mut t = Throttler::new(timer);
        t.enable(ev, props);
        t
    }

    fn limited(kbps: u64, max_queue: Option<u64>) -> LinkProperties {
        LinkProperties {
            throughput_kbps: Some(kbps),
            max_queue_bytes: max_queue,
            ..LinkProperties::default()
        }
    }

    #[test]
    fn disabled_admits_before_returning() {
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &LinkProperties::default());
        assert!(!t.is_enabled());
        assert_eq!(ev.pending(), 0);

        let mut got = Vec::new();
        t.insert(1500, 1, |i| got.push(i));
        t.insert(1500, 2, |i| got.push(i));
        assert_eq!(got, vec![1, 2]);
        assert_eq!(t.bytes_total(), 3000);
    }

    #[test]
    fn forced_drop_consumes_budget() {
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &LinkProperties::default());
        t.apply(&LinkEffect {
            throughput_kbps_change: 0,
            drop_bytes: 3000,
        });

        let mut got = Vec::new();
        t.insert(1000, 1, |i| got.push(i));
        assert!(got.is_empty());
        assert_eq!(t.drop_bytes(), 2000);

        t.insert(2500, 2, |i| got.push(i));
        assert!(got.is_empty());
        assert_eq!(t.drop_bytes(), 0);

        t.insert(100, 3, |i| got.push(i));
        assert_eq!(got, vec![3]);
    }

    #[test]
    fn revert_does_not_restore_dropped_budget() {
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &LinkProperties::default());
        let effect = LinkEffect {
            throughput_kbps_change: 0,
            drop_bytes: 500,
        };
        t.apply(&effect);
        t.revert(&effect);
        assert_eq!(t.drop_bytes(), 500);
    }

    #[test]
    fn converges_to_configured_rate() {
        // 800 kbps = 100000 B/s，突发窗口 10000 字节
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &limited(800, None));

        let mut delivered = 0u64;
        for i in 0..400 {
            t.insert(1000, i, |_| delivered += 1000);
        }
        assert_eq!(delivered, 10_000);

        while ev.step_until(1.0).is_some() {
            t.tick(&mut ev, |_| delivered += 1000);
        }

        let expected = 100_000i64;
        assert!(
            (delivered as i64 - expected).abs() <= 10_000 + 1000,
            "delivered {delivered} bytes in one second"
        );
        assert!(t.has_queued());
    }

    #[test]
    fn fifo_never_lets_small_packets_overtake() {
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &limited(80, None));
        // 桶容量 1000
        let mut got = Vec::new();
        t.insert(600, 1, |i| got.push(i));
        t.insert(600, 2, |i| got.push(i));
        t.insert(10, 3, |i| got.push(i));
        assert_eq!(got, vec![1]);

        while ev.step_until(0.2).is_some() {
            t.tick(&mut ev, |i| got.push(i));
        }
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn overflowing_queue_drops() {
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &limited(80, Some(2000)));

        let mut admitted = Vec::new();
        for i in 0..6 {
            t.insert(1000, i, |i| admitted.push(i));
        }
        // 第一个吃掉整桶；之后排队直到队列超过 2000 字节
        assert_eq!(admitted, vec![0]);
        assert_eq!(t.queued_cost(), 3000);
        assert_eq!(t.bytes_total(), 6000);
    }

    #[test]
    fn throughput_change_only_when_enabled() {
        let mut ev = EventLoop::new();
        let change = LinkEffect {
            throughput_kbps_change: -400,
            drop_bytes: 0,
        };

        let mut off = throttler(&mut ev, &LinkProperties::default());
        off.apply(&change);
        assert_eq!(off.throttle_kbps(), 0);

        let mut on = throttler(&mut ev, &limited(800, None));
        assert_eq!(on.capacity(), 10_000);
        on.apply(&change);
        assert_eq!(on.throttle_kbps(), 400);
        assert_eq!(on.capacity(), 5_000);
        on.revert(&change);
        assert_eq!(on.throttle_kbps(), 800);
        assert_eq!(on.capacity(), 5_000);
    }

    #[test]
    fn volume_event_applies_and_reverts_by_bytes() {
        let mut props = limited(800, None);
        props.volume_events.push(VolumeTriggeredEvent {
            trigger_at_bytes: 1000,
            active_for_bytes: Some(500),
            repeat_after_bytes: None,
            effect: LinkEffect {
                throughput_kbps_change: -400,
                drop_bytes: 0,
            },
        });
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &props);

        t.insert(600, 0, |_| {});
        t.insert(600, 1, |_| {});
        // 累计 1200，下一次提交时生效
        assert_eq!(t.throttle_kbps(), 800);
        t.insert(100, 2, |_| {});
        assert_eq!(t.throttle_kbps(), 400);

        t.insert(100, 3, |_| {});
        t.insert(100, 4, |_| {});
        assert_eq!(t.throttle_kbps(), 400);
        // 累计到 1500，到期撤销
        t.insert(100, 5, |_| {});
        assert_eq!(t.throttle_kbps(), 800);
    }

    #[test]
    fn repeating_volume_event_fires_every_interval() {
        let mut props = limited(8000, None);
        props.volume_events.push(VolumeTriggeredEvent {
            trigger_at_bytes: 0,
            active_for_bytes: None,
            repeat_after_bytes: Some(1000),
            effect: LinkEffect {
                throughput_kbps_change: -100,
                drop_bytes: 0,
            },
        });
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &props);

        for i in 0..5 {
            t.insert(1000, i, |_| {});
        }
        // 偏移 0, 1000, 2000, 3000, 4000 各触发一次
        assert_eq!(t.throttle_kbps(), 8000 - 500);
    }

    #[test]
    fn volume_drop_event_discards_traffic() {
        let mut props = LinkProperties::default();
        props.volume_events.push(VolumeTriggeredEvent {
            trigger_at_bytes: 1000,
            active_for_bytes: None,
            repeat_after_bytes: None,
            effect: LinkEffect {
                throughput_kbps_change: 0,
                drop_bytes: 1500,
            },
        });
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &props);

        let mut got = Vec::new();
        for i in 0..5 {
            t.insert(1000, i, |i| got.push(i));
        }
        // 第 2 个包提交时触发，它和下一个包一起吃掉 1500 字节的预算
        assert_eq!(got, vec![0, 3, 4]);
        assert_eq!(t.drop_bytes(), 0);
    }

    #[test]
    fn active_volume_event_repeats_after_revert() {
        let mut props = limited(8000, None);
        props.volume_events.push(VolumeTriggeredEvent {
            trigger_at_bytes: 1000,
            active_for_bytes: Some(500),
            repeat_after_bytes: Some(1000),
            effect: LinkEffect {
                throughput_kbps_change: -2000,
                drop_bytes: 0,
            },
        });
        let mut ev = EventLoop::new();
        let mut t = throttler(&mut ev, &props);

        // 每次提交之前先看累计字节：0, 500, 1000, ...
        let mut seen = Vec::new();
        for i in 0..8 {
            t.insert(500, i, |_| {});
            seen.push((t.throttle_kbps(), t.volume_backlog()));
        }
        assert_eq!(
            seen,
            vec![
                (8000, (1, 0)),
                (8000, (1, 0)),
                // 1000 生效，1500 撤销后挪回 pending，偏移 2500
                (6000, (0, 1)),
                (8000, (1, 0)),
                (8000, (1, 0)),
                (6000, (0, 1)),
                (8000, (1, 0)),
                (8000, (1, 0)),
            ]
        );
    }
}
