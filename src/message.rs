//! GC messages: the queue through which the arena tells its client
//! about collections and finalizable objects. Each trace slot keeps a
//! pre-staged begin and end message so posting at a collection boundary
//! never allocates.

use crate::arena::ArenaState;
use crate::describe::wline;
use crate::res::Res;
use crate::set::{TraceId, TRACE_MAX};
use crate::tract::Addr;
use std::collections::VecDeque;

pub const MESSAGE_TYPE_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A collection has begun.
    GcStart,
    /// A collection has finished; carries its tallies.
    Gc,
    /// A registered object has become finalizable.
    Finalization,
}

impl MessageType {
    pub fn index(self) -> usize {
        match self {
            MessageType::GcStart => 0,
            MessageType::Gc => 1,
            MessageType::Finalization => 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Message {
    GcStart { epoch: u64 },
    Gc { epoch: u64, condemned: usize },
    Finalization { obj: Addr },
}

impl Message {
    pub fn mtype(&self) -> MessageType {
        match self {
            Message::GcStart { .. } => MessageType::GcStart,
            Message::Gc { .. } => MessageType::Gc,
            Message::Finalization { .. } => MessageType::Finalization,
        }
    }
}

pub(crate) struct MessageQueue {
    enabled: [bool; MESSAGE_TYPE_COUNT],
    queue: VecDeque<Message>,
    pub(crate) dropped: u64,
    // Pre-staged begin/end messages, one pair per trace slot.
    staged: [(Option<Message>, Option<Message>); TRACE_MAX],
}

impl MessageQueue {
    pub(crate) fn new() -> MessageQueue {
        MessageQueue {
            enabled: [false; MESSAGE_TYPE_COUNT],
            queue: VecDeque::new(),
            dropped: 0,
            staged: [(None, None); TRACE_MAX],
        }
    }
}

impl ArenaState {
    /// Stage the begin/end messages for every trace slot. Runs at
    /// arena creation and after a slot's messages are consumed.
    pub(crate) fn message_stage_all(&mut self) {
        for ti in 0..TRACE_MAX {
            let slot = &mut self.messages.staged[ti];
            if slot.0.is_none() {
                slot.0 = Some(Message::GcStart { epoch: 0 });
            }
            if slot.1.is_none() {
                slot.1 = Some(Message::Gc {
                    epoch: 0,
                    condemned: 0,
                });
            }
        }
    }

    pub(crate) fn message_enable(&mut self, mtype: MessageType, enabled: bool) {
        self.messages.enabled[mtype.index()] = enabled;
    }

    fn message_post(&mut self, message: Message) {
        if self.messages.enabled[message.mtype().index()] {
            self.messages.queue.push_back(message);
        } else {
            self.messages.dropped += 1;
        }
    }

    /// Post the staged begin message for a trace.
    pub(crate) fn message_post_trace_start(&mut self, ti: TraceId) {
        let staged = self.messages.staged[ti.index()]
            .0
            .take()
            .expect("trace start message not staged");
        let epoch = self.history.epoch;
        debug_assert!(matches!(staged, Message::GcStart { .. }));
        self.message_post(Message::GcStart { epoch });
    }

    /// Post the staged end message for a trace, then restage the pair
    /// for the slot's next occupant.
    pub(crate) fn message_post_trace_end(&mut self, ti: TraceId, condemned: usize) {
        let staged = self.messages.staged[ti.index()]
            .1
            .take()
            .expect("trace end message not staged");
        let epoch = self.history.epoch;
        debug_assert!(matches!(staged, Message::Gc { .. }));
        self.message_post(Message::Gc { epoch, condemned });
        self.message_stage_all();
    }

    /// Is any message waiting?
    pub(crate) fn message_poll(&self) -> bool {
        !self.messages.queue.is_empty()
    }

    pub(crate) fn message_get(&mut self, mtype: MessageType) -> Option<Message> {
        let at = self
            .messages
            .queue
            .iter()
            .position(|m| m.mtype() == mtype)?;
        self.messages.queue.remove(at)
    }

    pub(crate) fn message_empty(&mut self) {
        self.messages.queue.clear();
    }

    pub(crate) fn message_describe(&self, w: &mut dyn std::fmt::Write, depth: usize) -> Res<()> {
        wline!(w, depth, "Messages")?;
        wline!(w, depth + 2, "queued {}", self.messages.queue.len())?;
        wline!(w, depth + 2, "dropped {}", self.messages.dropped)?;
        wline!(
            w,
            depth + 2,
            "enabled start={} gc={} finalization={}",
            self.messages.enabled[0],
            self.messages.enabled[1],
            self.messages.enabled[2]
        )
    }
}
