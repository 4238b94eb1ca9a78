use std::fmt;
use std::rc::Rc;

use log::{debug, info};

use crate::config::Profile;
use crate::five_tuple::ConnectionKey;
use crate::io::PacketIo;
use crate::packet::{Packet, TcpHeader};
use crate::timer::{EventLoop, Timer};

mod flow;
mod table;

pub use flow::TcpFlow;
pub use table::ConnectionTable;

/// 多久没包就把连接扔掉 (秒)
pub const IDLE_TIMEOUT_SECS: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 客户端那一侧的流往客户端发，服务端那一侧的流往服务端发
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

// ==========================================
// 定时器到期后要做的事，由分发器统一处理
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Idle,
    ApplyEffect(usize),
    RevertEffect(usize),
    Transmit(Side),
    ThrottlerTick(Side),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerAction {
    pub conn: ConnectionId,
    pub kind: TimerKind,
}

pub type Scheduler = EventLoop<TimerAction>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Syn,
    SynAck,
    Established,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HandshakeConfusion,
    Finished,
    IdleTimeout,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::HandshakeConfusion => "handshake confusion",
            CloseReason::Finished => "finished",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Shutdown => "shutdown",
        })
    }
}

/// 连接处理完一个包或一个定时器之后的去向；真正的关闭由持有连接表的一方来做
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Open,
    Close(CloseReason),
}

struct EffectTimers {
    apply: Timer,
    revert: Option<Timer>,
}

pub struct Connection {
    id: ConnectionId,
    key: ConnectionKey,
    profile: Rc<Profile>,
    state: State,
    syn_time: f64,
    idle_timer: Timer,
    effect_timers: Vec<EffectTimers>,
    client: TcpFlow,
    server: TcpFlow,
}

impl Connection {
    /// 用一个纯 SYN 建连接。SYN 记在客户端一侧的流上，同时排进服务端一侧的发送队列。
    pub fn new(
        id: ConnectionId,
        profile: Rc<Profile>,
        syn: Packet,
        ev: &mut Scheduler,
        io: &mut dyn PacketIo,
    ) -> Self {
        let key = ConnectionKey::for_packet(&syn);
        let action = |kind| TimerAction { conn: id, kind };

        let mut client = TcpFlow::new(
            syn.from,
            ev.timer(action(TimerKind::Transmit(Side::Client))),
            ev.timer(action(TimerKind::ThrottlerTick(Side::Client))),
        );
        let mut server = TcpFlow::new(
            syn.from.other(),
            ev.timer(action(TimerKind::Transmit(Side::Server))),
            ev.timer(action(TimerKind::ThrottlerTick(Side::Server))),
        );
        if let Some(props) = profile.downlink() {
            client.enable_throttling(ev, props);
        }
        if let Some(props) = profile.uplink() {
            server.enable_throttling(ev, props);
        }

        let idle_timer = ev.timer(action(TimerKind::Idle));
        idle_timer.reschedule(ev, IDLE_TIMEOUT_SECS);

        let mut effect_timers = Vec::with_capacity(profile.timed_events().len());
        for (i, event) in profile.timed_events().iter().enumerate() {
            let apply = ev.timer(action(TimerKind::ApplyEffect(i)));
            apply.reschedule(ev, event.trigger_time);
            let revert = event.duration.map(|duration| {
                let t = ev.timer(action(TimerKind::RevertEffect(i)));
                t.reschedule(ev, event.trigger_time + duration);
                t
            });
            effect_timers.push(EffectTimers { apply, revert });
        }

        info!("{} {} opened, profile '{}'", id, key, profile.id());

        io.record(&syn);
        if let Some(tcp) = syn.tcp.as_ref() {
            client.record_packet_rx(&mut server, tcp);
        }
        server.queue_packet_tx(ev, io, syn);

        Self {
            id,
            key,
            profile,
            state: State::Syn,
            syn_time: ev.now(),
            idle_timer,
            effect_timers,
            client,
            server,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    fn flow_mut(&mut self, side: Side) -> &mut TcpFlow {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// 本连接的一个包到了：推进握手状态机，再转给对面那条流
    pub fn receive(&mut self, packet: Packet, ev: &mut Scheduler, io: &mut dyn PacketIo) -> Disposition {
        io.record(&packet);
        let Some(tcp) = packet.tcp.clone() else {
            panic!("{} received a packet without a TCP header", self.id);
        };

        let side = if packet.from == self.client.iface() {
            Side::Client
        } else {
            Side::Server
        };
        let (source, target) = match side {
            Side::Client => (&mut self.client, &mut self.server),
            Side::Server => (&mut self.server, &mut self.client),
        };

        source.record_packet_rx(target, &tcp);
        if source.should_close(target) && self.state != State::Closing {
            debug!("{} closing", self.id);
            self.state = State::Closing;
        }

        match self.state {
            State::Syn => {
                if side == Side::Server && tcp.syn && tcp.ack {
                    self.state = State::SynAck;
                    // target 此时就是客户端一侧的流
                    let rtt = ev.now() - self.syn_time;
                    if let Some(target_rtt) = self.profile.target_rtt() {
                        if target_rtt > rtt {
                            target.set_delay(target_rtt - rtt);
                            debug!(
                                "{} server rtt {:.3}s, delaying client side by {:.3}s",
                                self.id,
                                rtt,
                                target_rtt - rtt
                            );
                        }
                    }
                } else if !(side == Side::Client && tcp.syn && !tcp.ack) {
                    return self.confused(&tcp);
                }
            }
            State::SynAck => {
                let resent_syn = side == Side::Client && tcp.syn && !tcp.ack;
                let resent_synack = side == Side::Server && tcp.syn && tcp.ack;
                if side == Side::Client && tcp.ack && !tcp.syn {
                    self.state = State::Established;
                    debug!("{} established", self.id);
                } else if !(resent_syn || resent_synack) {
                    return self.confused(&tcp);
                }
            }
            State::Established | State::Closing => {}
        }

        target.queue_packet_tx(ev, io, packet);
        self.idle_timer.reschedule(ev, IDLE_TIMEOUT_SECS);
        self.check_closing()
    }

    fn confused(&self, tcp: &TcpHeader) -> Disposition {
        info!(
            "{} handshake confusion in state {:?} (syn={} ack={} rst={} fin={})",
            self.id, self.state, tcp.syn, tcp.ack, tcp.rst, tcp.fin
        );
        Disposition::Close(CloseReason::HandshakeConfusion)
    }

    fn check_closing(&self) -> Disposition {
        if self.state == State::Closing && self.client.can_close() && self.server.can_close() {
            Disposition::Close(CloseReason::Finished)
        } else {
            Disposition::Open
        }
    }

    /// 本连接的定时器到期
    pub fn on_timer(&mut self, kind: TimerKind, ev: &mut Scheduler, io: &mut dyn PacketIo) -> Disposition {
        match kind {
            TimerKind::Idle => return Disposition::Close(CloseReason::IdleTimeout),
            TimerKind::ApplyEffect(i) => self.apply_timed_effect(i, ev),
            TimerKind::RevertEffect(i) => self.revert_timed_effect(i),
            TimerKind::Transmit(side) => {
                self.flow_mut(side).transmit(ev, io);
                return self.check_closing();
            }
            TimerKind::ThrottlerTick(side) => {
                self.flow_mut(side).throttler_tick(ev, io);
                return self.check_closing();
            }
        }
        Disposition::Open
    }

    fn apply_timed_effect(&mut self, index: usize, ev: &mut Scheduler) {
        let profile = Rc::clone(&self.profile);
        let Some(event) = profile.timed_events().get(index) else {
            return;
        };
        info!("{} applying timed effect {} of profile '{}'", self.id, index, profile.id());

        if event.extra_rtt != 0.0 {
            self.client.set_delay(self.client.delay() + event.extra_rtt);
        }
        self.client.apply_effect(&event.downlink);
        self.server.apply_effect(&event.uplink);

        // 周期性的效果在自己的回调里续期；带时长的同时把撤销也往后挪
        if let (Some(interval), Some(timers)) = (event.repeat_interval, self.effect_timers.get(index)) {
            timers.apply.reschedule(ev, interval);
            if let (Some(duration), Some(revert)) = (event.duration, timers.revert.as_ref()) {
                revert.reschedule(ev, duration);
            }
        }
    }

    fn revert_timed_effect(&mut self, index: usize) {
        let profile = Rc::clone(&self.profile);
        let Some(event) = profile.timed_events().get(index) else {
            return;
        };
        info!("{} reverting timed effect {} of profile '{}'", self.id, index, profile.id());

        if event.extra_rtt != 0.0 {
            self.client.set_delay(self.client.delay() - event.extra_rtt);
        }
        self.client.revert_effect(&event.downlink);
        self.server.revert_effect(&event.uplink);
    }

    /// 注销所有定时器；排队中的包随之丢弃
    pub fn release(self, ev: &mut Scheduler) {
        ev.release(self.idle_timer);
        for timers in self.effect_timers {
            ev.release(timers.apply);
            if let Some(revert) = timers.revert {
                ev.release(revert);
            }
        }
        self.client.release(ev);
        self.server.release(ev);
    }
}

#[cfg(test)]
impl Connection {
    pub fn state(&self) -> State {
        self.state
    }

    pub fn flow(&self, side: Side) -> &TcpFlow {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::io::Direction;
    use crate::packet::test_frames::{self, ACK, FIN, RST, SYN};

    #[derive(Default)]
    struct Wire {
        sent: Vec<(Direction, u8)>,
    }

    impl PacketIo for Wire {
        fn inject(&mut self, to: Direction, frame: &[u8]) -> bool {
            // TCP 标志在以太网 14 + IPv4 20 + 13 的位置
            self.sent.push((to, frame[47]));
            true
        }
    }

    const CLIENT: &str = "10.0.0.1";
    const SERVER: &str = "10.0.0.2";

    fn from_client(flags: u8, seq: u32, ack: u32, len: usize) -> Packet {
        test_frames::tcp_packet(Direction::Downlink, CLIENT, 40000, SERVER, 80, flags, seq, ack, len)
    }

    fn from_server(flags: u8, seq: u32, ack: u32, len: usize) -> Packet {
        test_frames::tcp_packet(Direction::Uplink, SERVER, 80, CLIENT, 40000, flags, seq, ack, len)
    }

    fn profile(json: &str) -> Rc<Profile> {
        Rc::clone(&Config::from_json(json).unwrap().profiles()[0])
    }

    fn plain() -> Rc<Profile> {
        profile(r#"{ "profiles": [ { "id": "plain" } ] }"#)
    }

    fn open(ev: &mut Scheduler, wire: &mut Wire, p: Rc<Profile>) -> Connection {
        Connection::new(ConnectionId(7), p, from_client(SYN, 100, 0, 0), ev, wire)
    }

    #[test]
    fn syn_is_forwarded_to_server_side() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let c = open(&mut ev, &mut wire, plain());

        assert_eq!(c.state(), State::Syn);
        assert_eq!(wire.sent, vec![(Direction::Uplink, SYN)]);
        assert_eq!(c.flow(Side::Client).iface(), Direction::Downlink);
        assert_eq!(c.flow(Side::Server).snd_una(), 100);
    }

    #[test]
    fn three_way_handshake_reaches_established() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let mut c = open(&mut ev, &mut wire, plain());

        ev.set_now(0.04);
        assert_eq!(c.receive(from_server(SYN | ACK, 500, 101, 0), &mut ev, &mut wire), Disposition::Open);
        assert_eq!(c.state(), State::SynAck);
        assert_eq!(c.receive(from_client(ACK, 101, 501, 0), &mut ev, &mut wire), Disposition::Open);
        assert_eq!(c.state(), State::Established);
        assert_eq!(c.receive(from_client(ACK, 101, 501, 100), &mut ev, &mut wire), Disposition::Open);
        assert_eq!(c.receive(from_server(ACK, 501, 201, 0), &mut ev, &mut wire), Disposition::Open);
        assert_eq!(c.state(), State::Established);

        assert_eq!(
            wire.sent,
            vec![
                (Direction::Uplink, SYN),
                (Direction::Downlink, SYN | ACK),
                (Direction::Uplink, ACK),
                (Direction::Uplink, ACK),
                (Direction::Downlink, ACK),
            ]
        );
    }

    #[test]
    fn retransmissions_during_handshake_are_tolerated() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let mut c = open(&mut ev, &mut wire, plain());

        assert_eq!(c.receive(from_client(SYN, 100, 0, 0), &mut ev, &mut wire), Disposition::Open);
        assert_eq!(c.state(), State::Syn);
        assert_eq!(c.receive(from_server(SYN | ACK, 500, 101, 0), &mut ev, &mut wire), Disposition::Open);
        assert_eq!(c.receive(from_server(SYN | ACK, 500, 101, 0), &mut ev, &mut wire), Disposition::Open);
        assert_eq!(c.receive(from_client(SYN, 100, 0, 0), &mut ev, &mut wire), Disposition::Open);
        assert_eq!(c.state(), State::SynAck);
        assert_eq!(wire.sent.len(), 5);
    }

    #[test]
    fn handshake_confusion_closes_without_forwarding() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let mut c = open(&mut ev, &mut wire, plain());
        assert_eq!(
            c.receive(from_server(ACK, 500, 101, 10), &mut ev, &mut wire),
            Disposition::Close(CloseReason::HandshakeConfusion)
        );
        assert_eq!(wire.sent.len(), 1);

        let mut c = open(&mut ev, &mut wire, plain());
        c.receive(from_server(SYN | ACK, 500, 101, 0), &mut ev, &mut wire).ok_open();
        assert_eq!(
            c.receive(from_server(ACK, 501, 101, 10), &mut ev, &mut wire),
            Disposition::Close(CloseReason::HandshakeConfusion)
        );
    }

    #[test]
    fn rst_closes_once_queues_drain() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let mut c = open(&mut ev, &mut wire, plain());
        assert_eq!(
            c.receive(from_server(RST | ACK, 0, 101, 0), &mut ev, &mut wire),
            Disposition::Close(CloseReason::Finished)
        );
        assert_eq!(c.state(), State::Closing);
        // RST 照样转给客户端
        assert_eq!(wire.sent.last(), Some(&(Direction::Downlink, RST | ACK)));
    }

    #[test]
    fn fin_on_both_sides_closes() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let mut c = open(&mut ev, &mut wire, plain());
        c.receive(from_server(SYN | ACK, 500, 101, 0), &mut ev, &mut wire).ok_open();
        c.receive(from_client(ACK, 101, 501, 0), &mut ev, &mut wire).ok_open();

        assert_eq!(c.receive(from_client(FIN | ACK, 101, 501, 0), &mut ev, &mut wire), Disposition::Open);
        assert_eq!(c.state(), State::Established);
        assert_eq!(
            c.receive(from_server(FIN | ACK, 501, 102, 0), &mut ev, &mut wire),
            Disposition::Close(CloseReason::Finished)
        );
    }

    #[test]
    fn target_rtt_delays_client_side() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let p = profile(r#"{ "profiles": [ { "id": "rtt", "target_rtt": 0.1 } ] }"#);
        let mut c = open(&mut ev, &mut wire, p);

        ev.set_now(0.02);
        c.receive(from_server(SYN | ACK, 500, 101, 0), &mut ev, &mut wire).ok_open();
        assert!((c.flow(Side::Client).delay() - 0.08).abs() < 1e-9);
        assert_eq!(c.flow(Side::Server).delay(), 0.0);
        // SYNACK 还在客户端一侧的队列里
        assert_eq!(wire.sent.len(), 1);
        assert_eq!(c.flow(Side::Client).queued_packets(), 1);
    }

    #[test]
    fn timed_effects_apply_and_revert() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let p = profile(
            r#"{ "profiles": [ { "id": "fx",
                 "downlink": { "throughput_kbps": 1000 },
                 "timed_events": [ { "trigger_time": 1.0, "duration": 0.5, "extra_rtt": 0.2,
                                     "downlink": { "throughput_kbps_change": -600 },
                                     "uplink": { "drop_bytes": 100 } } ] } ] }"#,
        );
        let mut c = open(&mut ev, &mut wire, p);

        let mut fired = Vec::new();
        while let Some(action) = ev.step_until(2.0) {
            assert_eq!(action.conn, ConnectionId(7));
            if matches!(action.kind, TimerKind::ApplyEffect(_) | TimerKind::RevertEffect(_)) {
                fired.push((action.kind, ev.now()));
            }
            c.on_timer(action.kind, &mut ev, &mut wire).ok_open();
            if action.kind == TimerKind::ApplyEffect(0) {
                assert_eq!(c.flow(Side::Client).throttler().throttle_kbps(), 400);
                assert!((c.flow(Side::Client).delay() - 0.2).abs() < 1e-9);
                assert_eq!(c.flow(Side::Server).throttler().drop_bytes(), 100);
            }
        }

        assert_eq!(fired.len(), 2);
        assert!((fired[0].1 - 1.0).abs() < 1e-6);
        assert!((fired[1].1 - 1.5).abs() < 1e-6);
        assert_eq!(c.flow(Side::Client).throttler().throttle_kbps(), 1000);
        assert_eq!(c.flow(Side::Client).delay(), 0.0);
        assert_eq!(c.flow(Side::Server).throttler().drop_bytes(), 100);
    }

    #[test]
    fn repeating_effect_rearms_itself() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let p = profile(
            r#"{ "profiles": [ { "id": "rep",
                 "timed_events": [ { "trigger_time": 0.5, "repeat_interval": 1.0,
                                     "uplink": { "drop_bytes": 10 } } ] } ] }"#,
        );
        let mut c = open(&mut ev, &mut wire, p);

        let mut applied = 0;
        while let Some(action) = ev.step_until(3.0) {
            if action.kind == TimerKind::ApplyEffect(0) {
                applied += 1;
            }
            c.on_timer(action.kind, &mut ev, &mut wire).ok_open();
        }
        // 0.5, 1.5, 2.5
        assert_eq!(applied, 3);
        assert_eq!(c.flow(Side::Server).throttler().drop_bytes(), 30);
    }

    #[test]
    fn bounded_repeating_effect_reverts_every_cycle() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let p = profile(
            r#"{ "profiles": [ { "id": "pulse",
                 "downlink": { "throughput_kbps": 1000 },
                 "timed_events": [ { "trigger_time": 0.5, "duration": 0.3,
                                     "repeat_interval": 1.0, "extra_rtt": 0.1,
                                     "downlink": { "throughput_kbps_change": -600 } } ] } ] }"#,
        );
        let mut c = open(&mut ev, &mut wire, p);

        let mut fired = Vec::new();
        while let Some(action) = ev.step_until(3.0) {
            c.on_timer(action.kind, &mut ev, &mut wire).ok_open();
            let kbps = c.flow(Side::Client).throttler().throttle_kbps();
            let delay = c.flow(Side::Client).delay();
            match action.kind {
                TimerKind::ApplyEffect(0) => {
                    assert_eq!(kbps, 400);
                    assert!((delay - 0.1).abs() < 1e-9);
                    fired.push(('a', ev.now()));
                }
                TimerKind::RevertEffect(0) => {
                    assert_eq!(kbps, 1000);
                    assert!(delay.abs() < 1e-9);
                    fired.push(('r', ev.now()));
                }
                _ => {}
            }
        }

        let expected = [('a', 0.5), ('r', 0.8), ('a', 1.5), ('r', 1.8), ('a', 2.5), ('r', 2.8)];
        assert_eq!(fired.len(), expected.len());
        for ((kind, at), (want_kind, want_at)) in fired.iter().zip(expected) {
            assert_eq!(*kind, want_kind);
            assert!((at - want_at).abs() < 1e-6, "{kind} fired at {at}, expected {want_at}");
        }
        assert_eq!(c.flow(Side::Client).throttler().throttle_kbps(), 1000);
    }

    #[test]
    fn idle_timer_and_release() {
        let mut ev = Scheduler::new();
        let mut wire = Wire::default();
        let mut c = open(&mut ev, &mut wire, plain());
        ev.set_now(100.0);
        c.receive(from_server(SYN | ACK, 500, 101, 0), &mut ev, &mut wire).ok_open();

        // 收到包以后重新计时
        assert_eq!(ev.step_until(219.0), None);
        let action = ev.step_until(221.0).unwrap();
        assert_eq!(action.kind, TimerKind::Idle);
        assert_eq!(
            c.on_timer(action.kind, &mut ev, &mut wire),
            Disposition::Close(CloseReason::IdleTimeout)
        );

        c.release(&mut ev);
        assert_eq!(ev.registered(), 0);
        assert_eq!(ev.pending(), 0);
    }

    trait OkOpen {
        fn ok_open(self);
    }

    impl OkOpen for Disposition {
        fn ok_open(self) {
            assert_eq!(self, Disposition::Open);
        }
    }
}
