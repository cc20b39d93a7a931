//! Completion tokens and the queues that carry them.
//!
//! Tokens gate readiness only; results travel through scratch tables or
//! inlined SQL. Every queue has exactly one listener. A listener expects one
//! token from every node that broadcasts on the queue.

use std::collections::BTreeMap;

use aqp_core::id::{NodeId, QueueId};
use aqp_planner::QueryExecutionPlan;
use tokio::sync::mpsc;

use crate::error::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub producer: NodeId,
    pub status: TokenStatus,
}

/// A listening queue together with how many tokens must arrive on it.
#[derive(Debug)]
pub struct Listener {
    pub queue: QueueId,
    pub expected: usize,
    pub rx: mpsc::UnboundedReceiver<Token>,
}

/// Queue endpoints for one node.
#[derive(Debug, Default)]
pub struct NodeQueues {
    pub listeners: Vec<Listener>,
    pub broadcasters: Vec<(QueueId, mpsc::UnboundedSender<Token>)>,
}

impl NodeQueues {
    pub fn broadcast(&self, token: Token) {
        for (queue, tx) in &self.broadcasters {
            if tx.send(token).is_err() {
                tracing::trace!(queue = queue.get(), "listener already gone");
            }
        }
    }
}

/// Create one channel per queue in the plan and hand out endpoints per node.
pub fn wire_queues(plan: &QueryExecutionPlan) -> Result<BTreeMap<NodeId, NodeQueues>, ExecError> {
    let mut senders: BTreeMap<QueueId, mpsc::UnboundedSender<Token>> = BTreeMap::new();
    let mut receivers: BTreeMap<QueueId, mpsc::UnboundedReceiver<Token>> = BTreeMap::new();
    let mut expected: BTreeMap<QueueId, usize> = BTreeMap::new();

    for node in plan.nodes() {
        for q in node.listening_queues.iter().chain(&node.broadcasting_queues) {
            if !senders.contains_key(q) {
                let (tx, rx) = mpsc::unbounded_channel();
                senders.insert(*q, tx);
                receivers.insert(*q, rx);
            }
        }
        for q in &node.broadcasting_queues {
            *expected.entry(*q).or_default() += 1;
        }
    }

    let mut out = BTreeMap::new();
    for node in plan.nodes() {
        let mut queues = NodeQueues::default();
        for q in &node.listening_queues {
            let rx = receivers.remove(q).ok_or_else(|| {
                ExecError::Invalid(format!("queue {} has more than one listener", q.get()))
            })?;
            queues.listeners.push(Listener {
                queue: *q,
                expected: expected.get(q).copied().unwrap_or(0),
                rx,
            });
        }
        for q in &node.broadcasting_queues {
            if let Some(tx) = senders.get(q) {
                queues.broadcasters.push((*q, tx.clone()));
            }
        }
        out.insert(node.id, queues);
    }
    Ok(out)
}
