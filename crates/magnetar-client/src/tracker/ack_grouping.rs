//! Coalesces acknowledgments into periodic ACK commands.

use crate::message::MessageId;
use magnetar_protocol::proto::AckType;
use std::collections::BTreeSet;
use std::time::Duration;

/// A group of ids ready to leave as one ACK command.
#[derive(Debug, PartialEq)]
pub(crate) struct AckBatch {
    pub ack_type: AckType,
    pub ids: Vec<MessageId>,
}

/// Buffers individual acks and the high-water cumulative ack between flush
/// ticks. A cumulative ack supersedes every individual ack it covers, and
/// the tracker remembers what it just flushed so redeliveries of acked
/// messages are recognized as duplicates.
///
/// With a zero group time, or on non-persistent topics, the tracker runs in
/// immediate mode: every ack is handed straight back for sending and
/// nothing is remembered.
pub(crate) enum AckGroupingTracker {
    Grouping {
        individual: BTreeSet<MessageId>,
        cumulative: Option<MessageId>,
        flushed_individual: BTreeSet<MessageId>,
        flushed_cumulative: Option<MessageId>,
    },
    Immediate,
}

impl AckGroupingTracker {
    pub fn new(group_time: Duration, persistent: bool) -> Self {
        if group_time.is_zero() || !persistent {
            Self::Immediate
        } else {
            Self::Grouping {
                individual: BTreeSet::new(),
                cumulative: None,
                flushed_individual: BTreeSet::new(),
                flushed_cumulative: None,
            }
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }

    /// Buffer an individual ack; in immediate mode it comes straight back.
    pub fn add_individual(&mut self, id: MessageId) -> Vec<AckBatch> {
        match self {
            Self::Immediate => vec![AckBatch {
                ack_type: AckType::Individual,
                ids: vec![id],
            }],
            Self::Grouping {
                individual,
                cumulative,
                ..
            } => {
                let covered = cumulative.as_ref().is_some_and(|c| id <= *c);
                if !covered {
                    individual.insert(id);
                }
                Vec::new()
            }
        }
    }

    /// Advance the cumulative high-water mark; it only moves forward.
    pub fn add_cumulative(&mut self, id: MessageId) -> Vec<AckBatch> {
        match self {
            Self::Immediate => vec![AckBatch {
                ack_type: AckType::Cumulative,
                ids: vec![id],
            }],
            Self::Grouping {
                individual,
                cumulative,
                ..
            } => {
                if cumulative.as_ref().is_none_or(|c| id > *c) {
                    individual.retain(|i| *i > id);
                    *cumulative = Some(id);
                }
                Vec::new()
            }
        }
    }

    /// Is `id` already covered by a pending or just-flushed ack?
    pub fn is_duplicate(&self, id: &MessageId) -> bool {
        match self {
            Self::Immediate => false,
            Self::Grouping {
                individual,
                cumulative,
                flushed_individual,
                flushed_cumulative,
            } => {
                cumulative.as_ref().is_some_and(|c| *id <= *c)
                    || flushed_cumulative.as_ref().is_some_and(|c| *id <= *c)
                    || individual.contains(id)
                    || flushed_individual.contains(id)
            }
        }
    }

    /// Drain pending acks into at most one cumulative and one individual
    /// batch, remembering them for duplicate detection.
    pub fn flush(&mut self) -> Vec<AckBatch> {
        match self {
            Self::Immediate => Vec::new(),
            Self::Grouping {
                individual,
                cumulative,
                flushed_individual,
                flushed_cumulative,
            } => {
                let mut batches = Vec::new();
                if let Some(c) = cumulative.take() {
                    *flushed_cumulative = Some(c.clone());
                    batches.push(AckBatch {
                        ack_type: AckType::Cumulative,
                        ids: vec![c],
                    });
                }
                if !individual.is_empty() {
                    let ids: Vec<_> = std::mem::take(individual).into_iter().collect();
                    *flushed_individual = ids.iter().cloned().collect();
                    batches.push(AckBatch {
                        ack_type: AckType::Individual,
                        ids,
                    });
                }
                batches
            }
        }
    }

    /// Flush, then forget the flushed state too (used by seek, which makes
    /// old positions meaningful again).
    pub fn flush_and_clean(&mut self) -> Vec<AckBatch> {
        let batches = self.flush();
        if let Self::Grouping {
            flushed_individual,
            flushed_cumulative,
            ..
        } = self
        {
            flushed_individual.clear();
            *flushed_cumulative = None;
        }
        batches
    }
}
