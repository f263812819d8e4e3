use std::collections::VecDeque;

use bytes::Bytes;

use crate::messages::DbdMsgType;

/// Packed messages waiting for delivery to the primary daemon, oldest first.
///
/// Every frame carries a sequence number so a delivered batch can be dequeued even when
/// frames were discarded while it was in flight.
#[derive(Default)]
pub(crate) struct PendingQueue {
    frames: VecDeque<(u64, Bytes)>,
    next_seq: u64,
}

/// Front frames handed to the worker, with their sequence numbers.
#[derive(Default)]
pub(crate) struct Batch {
    pub frames: Vec<Bytes>,
    pub seqs: Vec<u64>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl PendingQueue {
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push_back(&mut self, frame: Bytes) {
        self.frames.push_back((self.next_seq, frame));
        self.next_seq += 1;
    }

    /// Puts frames loaded from the replay file in front of everything queued so far.
    ///
    /// Renumbers the whole queue, so it must not be called while a batch is in flight.
    pub fn prepend(&mut self, frames: Vec<Bytes>) {
        let queued = std::mem::take(&mut self.frames);
        self.next_seq = 0;
        for frame in frames
            .into_iter()
            .chain(queued.into_iter().map(|(_, frame)| frame))
        {
            self.push_back(frame);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter().map(|(_, frame)| frame)
    }

    /// Drops every frame of the given types and returns how many were dropped.
    pub fn purge(&mut self, types: &[DbdMsgType]) -> usize {
        let before = self.frames.len();
        self.frames.retain(|(_, frame)| {
            DbdMsgType::of_frame(frame).is_none_or(|msg_type| !types.contains(&msg_type))
        });
        before - self.frames.len()
    }

    /// Makes room below `max_queue - 1` by dropping step records, then job start records.
    ///
    /// Returns the number of dropped frames.
    pub fn make_room(&mut self, max_queue: usize) -> usize {
        let limit = max_queue.saturating_sub(1);
        let mut dropped = 0;
        for types in [
            &[DbdMsgType::StepStart, DbdMsgType::StepComplete][..],
            &[DbdMsgType::JobStart][..],
        ] {
            if self.frames.len() < limit {
                break;
            }
            let count = self.purge(types);
            if count > 0 {
                log::error!("Agent queue is full, discarded {count} {types:?} messages");
            }
            dropped += count;
        }
        dropped
    }

    /// Clones the front frames forming the next batch, without dequeuing them.
    ///
    /// At least one frame is returned when the queue is not empty, even if it exceeds
    /// `max_size` alone.
    pub fn peek_batch(&self, max_count: usize, max_size: usize) -> Batch {
        let mut size = 0;
        let mut batch = Batch {
            frames: Vec::new(),
            seqs: Vec::new(),
        };
        for (seq, frame) in self.frames.iter().take(max_count) {
            let frame_size = frame.len() + size_of::<u32>();
            if !batch.is_empty() && size + frame_size > max_size {
                break;
            }
            size += frame_size;
            batch.frames.push(frame.clone());
            batch.seqs.push(*seq);
        }
        batch
    }

    /// Dequeues every frame up to and including sequence number `seq`.
    ///
    /// Frames are only removed from the front or purged, so whatever is left up to `seq`
    /// belongs to the delivered part of a batch. Returns the number of dequeued frames.
    pub fn pop_through(&mut self, seq: u64) -> usize {
        let count = self.frames.partition_point(|(queued, _)| *queued <= seq);
        self.frames.drain(..count);
        count
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use jobres::protocol::PROTOCOL_VERSION;

    use super::PendingQueue;
    use crate::messages::{DbdMsg, DbdMsgType, JobStart, StepStart};

    fn job_start(job_id: u32) -> Bytes {
        DbdMsg::JobStart(JobStart {
            job_id,
            ..Default::default()
        })
        .pack(PROTOCOL_VERSION)
        .unwrap()
    }

    fn step_start(job_id: u32) -> Bytes {
        DbdMsg::StepStart(StepStart {
            job_id,
            ..Default::default()
        })
        .pack(PROTOCOL_VERSION)
        .unwrap()
    }

    fn push_with_limit(queue: &mut PendingQueue, frame: Bytes, max_queue: usize) {
        if queue.len() >= max_queue - 1 {
            queue.make_room(max_queue);
        }
        queue.push_back(frame);
    }

    #[test]
    fn discard_steps_first() {
        let mut queue = PendingQueue::default();
        for i in 0..60 {
            push_with_limit(&mut queue, step_start(i), 100);
        }
        for i in 0..60 {
            push_with_limit(&mut queue, job_start(i), 100);
        }
        push_with_limit(&mut queue, job_start(60), 100);

        assert!(queue.len() <= 99);
        assert_eq!(queue.len(), 61);
        assert!(
            queue
                .iter()
                .all(|f| DbdMsgType::of_frame(f) == Some(DbdMsgType::JobStart))
        );
    }

    #[test]
    fn discard_job_starts_when_no_steps_are_left() {
        let mut queue = PendingQueue::default();
        for i in 0..9 {
            queue.push_back(job_start(i));
        }
        queue.push_back(
            DbdMsg::RegisterCtld(Default::default())
                .pack(PROTOCOL_VERSION)
                .unwrap(),
        );
        assert_eq!(queue.make_room(10), 9);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn batch_respects_count_and_size() {
        let mut queue = PendingQueue::default();
        for i in 0..10 {
            queue.push_back(job_start(i));
        }
        let frame_size = queue.iter().next().unwrap().len() + 4;
        assert_eq!(queue.peek_batch(4, usize::MAX).len(), 4);
        assert_eq!(queue.peek_batch(100, frame_size * 3).len(), 3);
        assert_eq!(queue.peek_batch(100, 1).len(), 1);
        assert_eq!(queue.len(), 10);

        let batch = queue.peek_batch(3, usize::MAX);
        assert_eq!(queue.pop_through(batch.seqs[2]), 3);
        let first = queue.peek_batch(1, usize::MAX);
        assert_eq!(first.frames[0], job_start(3));
        queue.pop_through(u64::MAX);
        assert!(queue.is_empty());
        assert!(queue.peek_batch(10, 10).is_empty());
    }

    #[test]
    fn discard_during_delivery_keeps_later_frames() {
        let mut queue = PendingQueue::default();
        queue.push_back(step_start(100));
        let batch = queue.peek_batch(10, usize::MAX);
        for i in 0..9 {
            push_with_limit(&mut queue, job_start(i), 10);
        }
        assert_eq!(queue.len(), 9);

        assert_eq!(queue.pop_through(batch.seqs[0]), 0);
        let order: Vec<_> = queue.iter().cloned().collect();
        assert_eq!(order, (0..9).map(job_start).collect::<Vec<_>>());
    }

    #[test]
    fn prepend_keeps_order() {
        let mut queue = PendingQueue::default();
        queue.push_back(job_start(3));
        queue.prepend(vec![job_start(1), job_start(2)]);
        let order: Vec<_> = queue.iter().cloned().collect();
        assert_eq!(order, vec![job_start(1), job_start(2), job_start(3)]);

        let batch = queue.peek_batch(2, usize::MAX);
        assert_eq!(queue.pop_through(batch.seqs[1]), 2);
        assert_eq!(queue.peek_batch(1, usize::MAX).frames, vec![job_start(3)]);
    }
}
