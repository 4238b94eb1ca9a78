use std::collections::HashMap;

use log::info;

use crate::five_tuple::{ConnectionKey, KeyV4, KeyV6};
use crate::packet::Packet;

use super::{CloseReason, Connection, ConnectionId, Scheduler};

// ==========================================
// 五元组 -> 连接，按地址族分两张表
// ==========================================
#[derive(Default)]
pub struct ConnectionTable {
    next_id: u64,
    v4: HashMap<KeyV4, ConnectionId>,
    v6: HashMap<KeyV6, ConnectionId>,
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    /// 调用方保证这个 key 还没有连接；重复插入是编程错误
    pub fn insert(&mut self, connection: Connection) {
        let id = connection.id();
        let previous = match *connection.key() {
            ConnectionKey::V4(k) => self.v4.insert(k, id),
            ConnectionKey::V6(k) => self.v6.insert(k, id),
        };
        assert!(
            previous.is_none(),
            "connection {} inserted over a live entry for {}",
            id,
            connection.key()
        );
        self.connections.insert(id, connection);
    }

    pub fn lookup(&self, packet: &Packet) -> Option<ConnectionId> {
        match ConnectionKey::for_packet(packet) {
            ConnectionKey::V4(k) => self.v4.get(&k).copied(),
            ConnectionKey::V6(k) => self.v6.get(&k).copied(),
        }
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// 从两张表里摘掉；连接必须在表里
    pub fn remove(&mut self, id: ConnectionId) -> Connection {
        let Some(connection) = self.connections.remove(&id) else {
            panic!("connection {id} is not in the table");
        };
        let removed = match *connection.key() {
            ConnectionKey::V4(k) => self.v4.remove(&k),
            ConnectionKey::V6(k) => self.v6.remove(&k),
        };
        assert_eq!(removed, Some(id), "key table out of sync for {}", connection.key());
        connection
    }

    pub fn close(&mut self, id: ConnectionId, ev: &mut Scheduler, reason: CloseReason) {
        let connection = self.remove(id);
        info!("{} {} closed: {}", id, connection.key(), reason);
        connection.release(ev);
    }

    /// 强制关掉所有连接。每次都重新取第一个，不在关闭过程中持有迭代器。
    pub fn clear(&mut self, ev: &mut Scheduler) {
        while let Some(id) = self.v4.values().next().copied() {
            self.close(id, ev, CloseReason::Shutdown);
        }
        while let Some(id) = self.v6.values().next().copied() {
            self.close(id, ev, CloseReason::Shutdown);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

}

#[cfg(test)]
impl ConnectionTable {
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn family_sizes(&self) -> (usize, usize) {
        (self.v4.len(), self.v6.len())
    }
}
