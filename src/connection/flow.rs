use std::collections::VecDeque;

use log::trace;

use crate::config::{LinkEffect, LinkProperties};
use crate::io::{Direction, PacketIo};
use crate::packet::{Packet, TcpHeader};
use crate::seq::seq_max;
use crate::throttler::Throttler;
use crate::timer::Timer;

use super::Scheduler;

// 定时器到点时浮点时钟可能差一丁点，小于这个就算到了
const CLOCK_SLACK: f64 = 1e-6;

// ==========================================
// 连接的一个方向：整形 -> 加时延 -> 从 `iface` 发出去
// ==========================================
pub struct TcpFlow {
    iface: Direction,
    // (计划发送时间, 包)。时延对整条流一样，所以入队顺序就是时间顺序
    queue: VecDeque<(f64, Packet)>,
    delay_s: f64,
    throttler: Throttler<Packet>,
    transmit_timer: Timer,

    received_rst: bool,
    received_fin: bool,
    // 只做握手判断、RTT 和关闭检测够用的最少跟踪
    snd_una: u32,
    snd_nxt: u32,
}

impl TcpFlow {
    pub fn new(iface: Direction, transmit_timer: Timer, tick_timer: Timer) -> Self {
        Self {
            iface,
            queue: VecDeque::new(),
            delay_s: 0.0,
            throttler: Throttler::new(tick_timer),
            transmit_timer,
            received_rst: false,
            received_fin: false,
            snd_una: 0,
            snd_nxt: 0,
        }
    }

    pub fn iface(&self) -> Direction {
        self.iface
    }

    pub fn enable_throttling(&mut self, ev: &mut Scheduler, properties: &LinkProperties) {
        self.throttler.enable(ev, properties);
    }

    /// 这条流收到了 `tcp`（也就是它这一端发出的包），更新标志和序号
    pub fn record_packet_rx(&mut self, peer: &mut TcpFlow, tcp: &TcpHeader) {
        self.received_rst |= tcp.rst;
        self.received_fin |= tcp.fin;

        if tcp.syn {
            peer.snd_una = tcp.seq;
            self.snd_nxt = tcp.seq;
        }
        if tcp.ack {
            self.snd_una = seq_max(self.snd_una, tcp.ack_seq);
        }
        if tcp.has_payload() {
            self.snd_nxt = seq_max(self.snd_nxt, tcp.end_seq);
        }
    }

    /// 交给整形器；放行后按当前时延排进发送队列
    pub fn queue_packet_tx(&mut self, ev: &mut Scheduler, io: &mut dyn PacketIo, packet: Packet) {
        let at = ev.now() + self.delay_s;
        let queue = &mut self.queue;
        self.throttler
            .insert(packet.len() as u64, packet, |p| queue.push_back((at, p)));
        self.transmit(ev, io);
    }

    pub fn throttler_tick(&mut self, ev: &mut Scheduler, io: &mut dyn PacketIo) {
        let at = ev.now() + self.delay_s;
        let before = self.queue.len();
        let queue = &mut self.queue;
        self.throttler.tick(ev, |p| queue.push_back((at, p)));
        if self.queue.len() != before {
            self.transmit(ev, io);
        }
    }

    /// 把到点的包全部发掉，然后按新的队头重新定时
    pub fn transmit(&mut self, ev: &mut Scheduler, io: &mut dyn PacketIo) {
        let now = ev.now();
        while self.queue.front().is_some_and(|(at, _)| *at <= now + CLOCK_SLACK) {
            let Some((_, packet)) = self.queue.pop_front() else {
                break;
            };
            io.record(&packet);
            if !io.inject(self.iface, packet.as_ref()) {
                trace!("inject on {} failed, {} bytes lost", self.iface.name(), packet.len());
            }
        }

        match self.queue.front() {
            Some((at, _)) => self.transmit_timer.reschedule(ev, at - now),
            None => self.transmit_timer.stop(ev),
        }
    }

    pub fn should_close(&self, peer: &TcpFlow) -> bool {
        self.received_rst || (self.received_fin && peer.received_fin)
    }

    pub fn can_close(&self) -> bool {
        self.received_rst || (self.queue.is_empty() && !self.throttler.has_queued())
    }

    /// 只影响之后入队的包
    pub fn set_delay(&mut self, delay_s: f64) {
        self.delay_s = delay_s.max(0.0);
    }

    pub fn delay(&self) -> f64 {
        self.delay_s
    }

    pub fn apply_effect(&mut self, effect: &LinkEffect) {
        self.throttler.apply(effect);
    }

    pub fn revert_effect(&mut self, effect: &LinkEffect) {
        self.throttler.revert(effect);
    }

    pub fn release(self, ev: &mut Scheduler) {
        ev.release(self.transmit_timer);
        self.throttler.release(ev);
    }
}

#[cfg(test)]
impl TcpFlow {
    pub fn throttler(&self) -> &Throttler<Packet> {
        &self.throttler
    }

    pub fn queued_packets(&self) -> usize {
        self.queue.len()
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }
}
