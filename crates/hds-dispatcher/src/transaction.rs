//! # transaction 模块说明
//!
//! ## 角色定位（Why）
//! - 事务是流上一次跨越多个传输完成回调的操作：发送事件、发送请求并等待响应、接收请求并回复；
//! - 每条流以“创建顺序”维护自己的事务链表，发送泵按该顺序挑选下一条待发送的事务。
//!
//! ## 结构（How）
//! - 事务存放在每流一个的槽位池中，以“槽位 + 代数”组成 [`TransactionId`]，
//!   槽位复用后旧标识自然失效；
//! - 池内以 `next` 下标串成单向链表，删除为 O(n) 扫描，n 受流上的并发事务数约束。
//!
//! ## 状态迁移（What）
//! - 发送事件：`WaitingForSend → SendingEvent → (移除)`；
//! - 发送请求：`WaitingForSend → SendingRequest → WaitingForResponse → ResponseAvailable
//!   → ReceivingResponse → (移除)`；
//! - 接收请求：`ReceivingRequest → WaitingForResponse → WaitingForSend → SendingResponse → (移除)`。

use core::fmt;
use std::time::Duration;

use crate::protocol::{OutgoingMessage, ProtocolId};
use crate::status::ResponseStatus;

/// 事务标识。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TransactionId {
    slot: u32,
    generation: u32,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// 事务种类。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransactionKind {
    SendEvent,
    SendRequest,
    ReceiveRequest,
}

/// 事务状态，取值范围随种类而定，见模块文档。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransactionState {
    WaitingForSend,
    SendingEvent,
    SendingRequest,
    WaitingForResponse,
    ResponseAvailable,
    ReceivingResponse,
    ReceivingRequest,
    SendingResponse,
}

/// 事务快照，供宿主与测试观察流上的事务。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub state: TransactionState,
    pub protocol: ProtocolId,
    pub topic: String,
}

pub(crate) struct Transaction {
    pub(crate) kind: TransactionKind,
    pub(crate) state: TransactionState,
    pub(crate) protocol: ProtocolId,
    pub(crate) topic: String,
    /// 发送请求时本端生成，接收请求时取自对端报文头；发送事件恒为 0。
    pub(crate) request_id: i64,
    /// 仅发送事件与发送请求带时限。
    pub(crate) ttl: Option<Duration>,
    pub(crate) message: Option<OutgoingMessage>,
    /// 接收请求：待回复的状态；发送请求：收到的响应状态。
    pub(crate) status: Option<ResponseStatus>,
}

impl Transaction {
    pub(crate) fn new(
        kind: TransactionKind,
        state: TransactionState,
        protocol: ProtocolId,
        topic: String,
    ) -> Self {
        Self {
            kind,
            state,
            protocol,
            topic,
            request_id: 0,
            ttl: None,
            message: None,
            status: None,
        }
    }

    /// 发送泵或接收泵是否正在使用该事务。
    pub(crate) fn is_in_flight(&self) -> bool {
        matches!(
            self.state,
            TransactionState::SendingEvent
                | TransactionState::SendingRequest
                | TransactionState::SendingResponse
                | TransactionState::ReceivingRequest
                | TransactionState::ReceivingResponse
                | TransactionState::ResponseAvailable
        )
    }
}

struct Node {
    transaction: Transaction,
    next: Option<u32>,
}

#[derive(Default)]
struct Entry {
    generation: u32,
    node: Option<Node>,
}

/// 以创建顺序串联的事务池。
#[derive(Default)]
pub(crate) struct TransactionList {
    entries: Vec<Entry>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl TransactionList {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// 追加到链表尾部。
    pub(crate) fn push_back(&mut self, transaction: Transaction) -> TransactionId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.entries.push(Entry::default());
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[slot as usize];
        entry.node = Some(Node {
            transaction,
            next: None,
        });
        let id = TransactionId {
            slot,
            generation: entry.generation,
        };
        match self.tail {
            Some(tail) => {
                if let Some(node) = self.entries[tail as usize].node.as_mut() {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        id
    }

    pub(crate) fn get(&self, id: TransactionId) -> Option<&Transaction> {
        let entry = self.entries.get(id.slot as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.node.as_ref().map(|node| &node.transaction)
    }

    pub(crate) fn get_mut(&mut self, id: TransactionId) -> Option<&mut Transaction> {
        let entry = self.entries.get_mut(id.slot as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.node.as_mut().map(|node| &mut node.transaction)
    }

    /// 从链表中摘除并返回事务。
    pub(crate) fn remove(&mut self, id: TransactionId) -> Option<Transaction> {
        self.get(id)?;
        let mut previous = None;
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let next = self.entries[slot as usize].node.as_ref().and_then(|node| node.next);
            if slot == id.slot {
                match previous {
                    Some(previous) => {
                        if let Some(node) = self.entries[previous as usize].node.as_mut() {
                            node.next = next;
                        }
                    }
                    None => self.head = next,
                }
                if self.tail == Some(slot) {
                    self.tail = previous;
                }
                return self.release(slot);
            }
            previous = Some(slot);
            cursor = next;
        }
        None
    }

    /// 摘除链表头部的事务。
    pub(crate) fn pop_front(&mut self) -> Option<(TransactionId, Transaction)> {
        let slot = self.head?;
        let entry = &self.entries[slot as usize];
        let id = TransactionId {
            slot,
            generation: entry.generation,
        };
        self.head = entry.node.as_ref().and_then(|node| node.next);
        if self.head.is_none() {
            self.tail = None;
        }
        self.release(slot).map(|transaction| (id, transaction))
    }

    /// 按创建顺序遍历。
    pub(crate) fn iter(&self) -> impl Iterator<Item = (TransactionId, &Transaction)> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let slot = cursor?;
            let entry = &self.entries[slot as usize];
            let node = entry.node.as_ref()?;
            cursor = node.next;
            let id = TransactionId {
                slot,
                generation: entry.generation,
            };
            Some((id, &node.transaction))
        })
    }

    /// 遍历所有带时限事务的剩余时限，顺序无关。
    pub(crate) fn ttls_mut(&mut self) -> impl Iterator<Item = &mut Duration> + '_ {
        self.entries
            .iter_mut()
            .filter_map(|entry| entry.node.as_mut())
            .filter_map(|node| node.transaction.ttl.as_mut())
    }

    fn release(&mut self, slot: u32) -> Option<Transaction> {
        let entry = &mut self.entries[slot as usize];
        let node = entry.node.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot);
        self.len -= 1;
        Some(node.transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(topic: &str) -> Transaction {
        Transaction::new(
            TransactionKind::SendEvent,
            TransactionState::WaitingForSend,
            ProtocolId::CONTROL,
            topic.to_owned(),
        )
    }

    fn topics(list: &TransactionList) -> Vec<String> {
        list.iter().map(|(_, txn)| txn.topic.clone()).collect()
    }

    #[test]
    fn iteration_follows_creation_order_across_removals() {
        let mut list = TransactionList::default();
        let a = list.push_back(event("a"));
        let b = list.push_back(event("b"));
        let c = list.push_back(event("c"));
        assert_eq!(topics(&list), ["a", "b", "c"]);

        assert_eq!(list.remove(b).map(|txn| txn.topic), Some("b".to_owned()));
        assert_eq!(topics(&list), ["a", "c"]);
        assert!(list.get(b).is_none(), "被移除的标识失效");

        let d = list.push_back(event("d"));
        assert_ne!(d, b, "复用槽位时代数递增");
        assert_eq!(topics(&list), ["a", "c", "d"]);

        list.remove(d).expect("尾部移除");
        list.push_back(event("e"));
        assert_eq!(topics(&list), ["a", "c", "e"]);
        assert_eq!(list.pop_front().map(|(id, _)| id), Some(a));
        list.remove(c).expect("移除");
        assert_eq!(topics(&list), ["e"]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn ttls_cover_only_timed_transactions() {
        let mut list = TransactionList::default();
        let mut timed = event("timed");
        timed.ttl = Some(Duration::from_secs(3));
        list.push_back(timed);
        list.push_back(Transaction::new(
            TransactionKind::ReceiveRequest,
            TransactionState::ReceivingRequest,
            ProtocolId::CONTROL,
            "untimed".to_owned(),
        ));
        let ttls: Vec<Duration> = list.ttls_mut().map(|ttl| *ttl).collect();
        assert_eq!(ttls, [Duration::from_secs(3)]);
    }
}
