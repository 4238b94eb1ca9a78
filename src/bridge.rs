use std::path::Path;
use std::time::Duration;

use log::{info, trace};

use crate::config::{Config, ConfigError};
use crate::connection::{CloseReason, Connection, ConnectionId, ConnectionTable, Disposition, Scheduler, TimerAction};
use crate::io::{Direction, PacketIo};
use crate::monitor::Monitor;
use crate::packet::Packet;

// ==========================================
// 分发器：整个进程的状态都挂在这一个对象上
// ==========================================
pub struct Bridge {
    ev: Scheduler,
    connections: ConnectionTable,
    config: Config,
    monitor: Monitor,
}

impl Bridge {
    pub fn new(config: Config, monitor: Monitor) -> Self {
        Self {
            ev: Scheduler::new(),
            connections: ConnectionTable::new(),
            config,
            monitor,
        }
    }

    /// 从 `from` 那条腿收到一帧
    pub fn handle_frame(&mut self, from: Direction, frame: &[u8], io: &mut dyn PacketIo) {
        self.monitor.frame_in(from, frame.len());
        match Packet::decode(frame, from) {
            Ok(packet) if packet.tcp.is_some() => self.handle_tcp(packet, frame, io),
            Ok(packet) => {
                trace!(
                    "{}: passing through non-TCP packet (protocol {}{})",
                    from.name(),
                    packet.ip.protocol(),
                    if packet.ip.is_fragment() { ", fragment" } else { "" }
                );
                self.forward(from, frame, io);
            }
            Err(e) => {
                trace!("{}: passing through unclassified frame ({})", from.name(), e);
                self.forward(from, frame, io);
            }
        }
    }

    // 不跟踪，原样送到对面
    fn forward(&mut self, from: Direction, frame: &[u8], io: &mut dyn PacketIo) {
        self.monitor.unexamined(from);
        self.monitor.tap(io).inject(from.other(), frame);
    }

    fn handle_tcp(&mut self, packet: Packet, frame: &[u8], io: &mut dyn PacketIo) {
        let from = packet.from;

        if let Some(id) = self.connections.lookup(&packet) {
            let Some(conn) = self.connections.get_mut(id) else {
                return;
            };
            self.monitor.tracked(from);
            let disposition = conn.receive(packet, &mut self.ev, &mut self.monitor.tap(io));
            if let Disposition::Close(reason) = disposition {
                self.close(id, reason);
            }
            return;
        }

        let pure_syn = packet.tcp.as_ref().is_some_and(|t| t.is_pure_syn());
        let profile = if pure_syn { self.config.find_match(&packet) } else { None };
        let Some(profile) = profile else {
            self.forward(from, frame, io);
            return;
        };

        let id = self.connections.next_id();
        self.monitor.tracked(from);
        self.monitor.connection_opened();
        let conn = Connection::new(id, profile, packet, &mut self.ev, &mut self.monitor.tap(io));
        self.connections.insert(conn);
    }

    fn close(&mut self, id: ConnectionId, reason: CloseReason) {
        self.connections.close(id, &mut self.ev, reason);
        self.monitor.connection_closed(reason);
    }

    fn dispatch(&mut self, action: TimerAction, io: &mut dyn PacketIo) {
        let Some(conn) = self.connections.get_mut(action.conn) else {
            return;
        };
        let disposition = conn.on_timer(action.kind, &mut self.ev, &mut self.monitor.tap(io));
        if let Disposition::Close(reason) = disposition {
            self.close(action.conn, reason);
        }
    }

    /// 处理所有已经到期的定时器
    pub fn run_timers(&mut self, io: &mut dyn PacketIo) {
        while let Some(action) = self.ev.pop_due() {
            self.dispatch(action, io);
        }
    }

    pub fn update_clock(&mut self) {
        self.ev.update_now();
    }

    pub fn time_until_next(&self) -> Option<Duration> {
        self.ev.time_until_next()
    }

    /// 重读配置。已有连接继续用它们建立时的 profile。
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        self.config.update(path)?;
        info!(
            "Configuration reloaded; {} existing connection(s) keep their profiles",
            self.connections.len()
        );
        Ok(())
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down, closing {} connection(s)", self.connections.len());
        self.connections.clear(&mut self.ev);
    }

    pub fn report(&mut self) {
        self.monitor.check_and_report(self.connections.len());
    }
}

#[cfg(test)]
impl Bridge {
    /// 仿真：逐个到期点拨表，直到 `t`
    pub fn advance_to(&mut self, t: f64, io: &mut dyn PacketIo) {
        while let Some(action) = self.ev.step_until(t) {
            self.dispatch(action, io);
        }
        self.ev.set_now(t);
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }
}
