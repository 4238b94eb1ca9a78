use chrono::Local;
use std::time::{Duration, Instant};

use crate::connection::CloseReason;
use crate::io::{Direction, PacketIo};
use crate::packet::Packet;

// ==========================================
// 1. 每条腿的统计 (每次出报表后清零)
// ==========================================
#[derive(Default, Clone, Copy)]
struct LinkStats {
    in_pkts: u64,
    in_bytes: u64,
    unexamined: u64, // 不跟踪、原样转发的
    tracked: u64,
    out_pkts: u64,
    out_bytes: u64,
    inject_failures: u64,
}

// ==========================================
// 2. 监控面板
// ==========================================
pub struct Monitor {
    links: [LinkStats; 2],
    opened: u64,
    closed: u64,
    handshake_failures: u64,
    // 连接计数永远不清零
    total_opened: u64,
    total_closed: u64,
    interval: Option<Duration>,
    last_report: Instant,
}

impl Monitor {
    /// `interval` 为 `None` 时只计数不打印
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            links: [LinkStats::default(); 2],
            opened: 0,
            closed: 0,
            handshake_failures: 0,
            total_opened: 0,
            total_closed: 0,
            interval,
            last_report: Instant::now(),
        }
    }

    pub fn frame_in(&mut self, from: Direction, bytes: usize) {
        let s = &mut self.links[from.index()];
        s.in_pkts += 1;
        s.in_bytes += bytes as u64;
    }

    pub fn unexamined(&mut self, from: Direction) {
        self.links[from.index()].unexamined += 1;
    }

    pub fn tracked(&mut self, from: Direction) {
        self.links[from.index()].tracked += 1;
    }

    pub fn connection_opened(&mut self) {
        self.opened += 1;
        self.total_opened += 1;
    }

    pub fn connection_closed(&mut self, reason: CloseReason) {
        self.closed += 1;
        self.total_closed += 1;
        if reason == CloseReason::HandshakeConfusion {
            self.handshake_failures += 1;
        }
    }

    #[cfg(test)]
    pub fn total_opened(&self) -> u64 {
        self.total_opened
    }

    #[cfg(test)]
    pub fn total_closed(&self) -> u64 {
        self.total_closed
    }

    #[cfg(test)]
    pub fn sent(&self, to: Direction) -> (u64, u64) {
        let s = &self.links[to.index()];
        (s.out_pkts, s.out_bytes)
    }

    #[cfg(test)]
    pub fn forwarded_unexamined(&self, from: Direction) -> u64 {
        self.links[from.index()].unexamined
    }

    /// 套在真正的 I/O 外面，顺手记下发出去的包
    pub fn tap<'a>(&'a mut self, inner: &'a mut dyn PacketIo) -> Tap<'a> {
        Tap { inner, monitor: self }
    }

    // 到点就打印并清零
    pub fn check_and_report(&mut self, active: usize) {
        let Some(interval) = self.interval else {
            return;
        };
        let elapsed = self.last_report.elapsed();
        if elapsed < interval {
            return;
        }

        let now_str = Local::now().format("%H:%M:%S").to_string();
        let secs = elapsed.as_secs_f64();

        println!("\n📊 [{}] flow-disruptor", now_str);
        println!("-------------------------------------------------------------------------------------");
        println!(
            "{:<9} | {:>9} | {:>9} | {:>9} | {:>9} | {:>9} | {:>10} | {:>7}",
            "Link", "in pkt/s", "in Mbps", "tracked", "passthru", "out pkt/s", "out Mbps", "failed"
        );
        println!("-------------------------------------------------------------------------------------");
        for d in [Direction::Downlink, Direction::Uplink] {
            let s = &mut self.links[d.index()];
            println!(
                "{:<9} | {:>9.0} | {:>9.2} | {:>9} | {:>9} | {:>9.0} | {:>10.2} | {:>7}",
                d.name(),
                s.in_pkts as f64 / secs,
                mbps(s.in_bytes, secs),
                s.tracked,
                s.unexamined,
                s.out_pkts as f64 / secs,
                mbps(s.out_bytes, secs),
                s.inject_failures
            );
            *s = LinkStats::default();
        }
        println!("-------------------------------------------------------------------------------------");
        println!(
            "connections: {} active | +{} opened | -{} closed ({} handshake failures) | {} / {} total",
            active, self.opened, self.closed, self.handshake_failures, self.total_opened, self.total_closed
        );
        println!("=====================================================================================\n");

        self.opened = 0;
        self.closed = 0;
        self.handshake_failures = 0;
        self.last_report = Instant::now();
    }
}

fn mbps(bytes: u64, secs: f64) -> f64 {
    (bytes as f64 * 8.0) / 1_000_000.0 / secs
}

// ==========================================
// 3. 透明拦截：转发给内层，同时计数
// ==========================================
pub struct Tap<'a> {
    inner: &'a mut dyn PacketIo,
    monitor: &'a mut Monitor,
}

impl PacketIo for Tap<'_> {
    fn inject(&mut self, to: Direction, frame: &[u8]) -> bool {
        let ok = self.inner.inject(to, frame);
        let s = &mut self.monitor.links[to.index()];
        if ok {
            s.out_pkts += 1;
            s.out_bytes += frame.len() as u64;
        } else {
            s.inject_failures += 1;
        }
        ok
    }

    fn record(&mut self, packet: &Packet) {
        self.inner.record(packet);
    }
}
