//! Retransmission Scheduling
//!
//! NAKs are debounced before the requested range is resent: a range already
//! being served is ignored, and a served range lingers for a while so that
//! NAKs from several receivers for the same loss cause a single resend.

use crate::config::{duration_nanos, PublicationConfig};
use crate::frame::DATA_HEADER_LENGTH;
use std::time::Duration;

/// Target of scheduled resends
pub trait RetransmitSender {
    /// Resend up to `length` bytes of the term identified by `term_id` from `term_offset`.
    fn resend(&mut self, term_id: i32, term_offset: i32, length: i32);
}

/// Retransmit scheduling contract
///
/// Owned by the sender; every call happens on the sending thread.
pub trait RetransmitHandler: Send {
    /// Schedule a resend for a NAKed range.
    fn on_nak(
        &mut self,
        term_id: i32,
        term_offset: i32,
        length: i32,
        now: i64,
        sender: &mut dyn RetransmitSender,
    );

    /// Fire delayed resends and expire lingering ranges.
    fn process_timeouts(&mut self, now: i64, sender: &mut dyn RetransmitSender);
}

/// Delay before answering a NAK
pub trait DelayGenerator: Send {
    fn generate_delay(&self) -> i64;
}

/// Same delay for every NAK
#[derive(Debug, Clone, Copy)]
pub struct StaticDelayGenerator {
    delay_ns: i64,
}

impl StaticDelayGenerator {
    pub fn new(delay: Duration) -> Self {
        StaticDelayGenerator {
            delay_ns: duration_nanos(delay),
        }
    }
}

impl DelayGenerator for StaticDelayGenerator {
    fn generate_delay(&self) -> i64 {
        self.delay_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionState {
    Inactive,
    Delayed,
    Lingering,
}

#[derive(Debug, Clone, Copy)]
struct RetransmitAction {
    state: ActionState,
    term_id: i32,
    term_offset: i32,
    length: i32,
    expiry: i64,
}

impl RetransmitAction {
    const INACTIVE: RetransmitAction = RetransmitAction {
        state: ActionState::Inactive,
        term_id: 0,
        term_offset: 0,
        length: 0,
        expiry: 0,
    };

    fn is_active(&self) -> bool {
        self.state != ActionState::Inactive
    }

    fn matches(&self, term_id: i32, term_offset: i32) -> bool {
        self.is_active() && self.term_id == term_id && self.term_offset == term_offset
    }
}

/// Fixed pool of retransmit actions with delay and linger timers
pub struct DefaultRetransmitHandler {
    actions: Vec<RetransmitAction>,
    delay_generator: Box<dyn DelayGenerator>,
    linger_ns: i64,
    term_length: i32,
}

impl DefaultRetransmitHandler {
    pub fn new(
        delay_generator: Box<dyn DelayGenerator>,
        linger: Duration,
        term_length: i32,
        max_retransmits: usize,
    ) -> Self {
        DefaultRetransmitHandler {
            actions: vec![RetransmitAction::INACTIVE; max_retransmits],
            delay_generator,
            linger_ns: duration_nanos(linger),
            term_length,
        }
    }

    /// Handler using the delay, linger and pool size from `config`.
    pub fn from_config(config: &PublicationConfig) -> Self {
        Self::new(
            Box::new(StaticDelayGenerator::new(config.retransmit_delay)),
            config.retransmit_linger,
            config.term_length as i32,
            config.max_retransmits,
        )
    }

    /// Number of ranges currently delayed or lingering.
    pub fn active_count(&self) -> usize {
        self.actions.iter().filter(|a| a.is_active()).count()
    }

    fn is_invalid(&self, term_offset: i32) -> bool {
        term_offset < 0 || term_offset > self.term_length - DATA_HEADER_LENGTH as i32
    }
}

impl RetransmitHandler for DefaultRetransmitHandler {
    fn on_nak(
        &mut self,
        term_id: i32,
        term_offset: i32,
        length: i32,
        now: i64,
        sender: &mut dyn RetransmitSender,
    ) {
        if self.is_invalid(term_offset) || length <= 0 {
            tracing::trace!("Ignoring NAK at invalid offset {} length {}", term_offset, length);
            return;
        }

        if self.actions.iter().any(|a| a.matches(term_id, term_offset)) {
            return;
        }

        let linger_ns = self.linger_ns;
        let delay = self.delay_generator.generate_delay();
        let length = length.min(self.term_length - term_offset);

        let Some(action) = self.actions.iter_mut().find(|a| !a.is_active()) else {
            tracing::trace!("Retransmit actions exhausted, dropping NAK for term {}", term_id);
            return;
        };

        action.term_id = term_id;
        action.term_offset = term_offset;
        action.length = length;

        if delay == 0 {
            sender.resend(term_id, term_offset, length);
            action.state = ActionState::Lingering;
            action.expiry = now + linger_ns;
        } else {
            action.state = ActionState::Delayed;
            action.expiry = now + delay;
        }
    }

    fn process_timeouts(&mut self, now: i64, sender: &mut dyn RetransmitSender) {
        let linger_ns = self.linger_ns;
        for action in self.actions.iter_mut().filter(|a| a.is_active()) {
            if now < action.expiry {
                continue;
            }
            match action.state {
                ActionState::Delayed => {
                    sender.resend(action.term_id, action.term_offset, action.length);
                    action.state = ActionState::Lingering;
                    action.expiry = now + linger_ns;
                }
                ActionState::Lingering => *action = RetransmitAction::INACTIVE,
                ActionState::Inactive => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERM_LENGTH: i32 = 64 * 1024;
    const LINGER: Duration = Duration::from_millis(60);
    const LINGER_NS: i64 = 60_000_000;

    #[derive(Default)]
    struct RecordingSender {
        resends: Vec<(i32, i32, i32)>,
    }

    impl RetransmitSender for RecordingSender {
        fn resend(&mut self, term_id: i32, term_offset: i32, length: i32) {
            self.resends.push((term_id, term_offset, length));
        }
    }

    fn handler(delay: Duration) -> DefaultRetransmitHandler {
        DefaultRetransmitHandler::new(Box::new(StaticDelayGenerator::new(delay)), LINGER, TERM_LENGTH, 4)
    }

    #[test]
    fn test_immediate_resend_then_linger() {
        let mut handler = handler(Duration::ZERO);
        let mut sender = RecordingSender::default();

        handler.on_nak(3, 0, 1408, 0, &mut sender);
        assert_eq!(sender.resends, vec![(3, 0, 1408)]);

        // Duplicate while lingering
        handler.on_nak(3, 0, 1408, 1_000, &mut sender);
        assert_eq!(sender.resends.len(), 1);

        handler.process_timeouts(LINGER_NS, &mut sender);
        assert_eq!(handler.active_count(), 0);

        handler.on_nak(3, 0, 1408, LINGER_NS + 1, &mut sender);
        assert_eq!(sender.resends.len(), 2);
    }

    #[test]
    fn test_delayed_resend() {
        let mut handler = handler(Duration::from_millis(10));
        let mut sender = RecordingSender::default();

        handler.on_nak(1, 2048, 512, 0, &mut sender);
        assert!(sender.resends.is_empty());

        handler.process_timeouts(5_000_000, &mut sender);
        assert!(sender.resends.is_empty());

        handler.process_timeouts(10_000_000, &mut sender);
        assert_eq!(sender.resends, vec![(1, 2048, 512)]);
        assert_eq!(handler.active_count(), 1);

        handler.process_timeouts(10_000_000 + LINGER_NS, &mut sender);
        assert_eq!(handler.active_count(), 0);
        assert_eq!(sender.resends.len(), 1);
    }

    #[test]
    fn test_invalid_offsets_ignored() {
        let mut handler = handler(Duration::ZERO);
        let mut sender = RecordingSender::default();

        handler.on_nak(0, -32, 64, 0, &mut sender);
        handler.on_nak(0, TERM_LENGTH - 16, 64, 0, &mut sender);
        handler.on_nak(0, 0, 0, 0, &mut sender);
        assert!(sender.resends.is_empty());
        assert_eq!(handler.active_count(), 0);
    }

    #[test]
    fn test_length_clamped_to_term_end() {
        let mut handler = handler(Duration::ZERO);
        let mut sender = RecordingSender::default();

        handler.on_nak(0, TERM_LENGTH - 1024, 4096, 0, &mut sender);
        assert_eq!(sender.resends, vec![(0, TERM_LENGTH - 1024, 1024)]);
    }

    #[test]
    fn test_pool_exhaustion_drops_nak() {
        let mut handler = handler(Duration::from_millis(1));
        let mut sender = RecordingSender::default();

        for i in 0..5 {
            handler.on_nak(0, i * 1408, 1408, 0, &mut sender);
        }
        assert_eq!(handler.active_count(), 4);

        handler.process_timeouts(1_000_000, &mut sender);
        assert_eq!(sender.resends.len(), 4);
    }
}
