//! # Send Queue
//!
//! Priority-ordered queue feeding the sender task.
//!
//! ## Discipline
//! - Signals always go first, FIFO among themselves
//! - Files and objects each have High, Normal and Low lanes; with
//!   [`ChannelOrder::FilesFirst`] all file lanes precede all object lanes,
//!   [`ChannelOrder::ObjectsFirst`] swaps the channels
//! - Items in one lane are served FIFO
//! - The queue hands out one parcel at a time and is re-evaluated for every
//!   parcel, so an item queued into a higher lane preempts a running one at
//!   the next parcel boundary
//!
//! ## Capacity
//! The object capacity bounds queued objects plus files. The parcel capacity
//! bounds queued object fragments; an object with more fragments than the
//! whole parcel capacity is admitted only while no other fragment waits.
//! Pushing into a full queue fails immediately.

use crate::config::{ChannelOrder, ConnectionParameters};
use crate::connection::state::CloseCause;
use crate::core::parcel::{Parcel, Priority};
use crate::error::{ProtocolError, Result};
use crate::protocol::signal::Signal;
use bytes::Bytes;
use std::collections::VecDeque;

/// Priority lanes of files and objects together
pub(crate) const LANES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Files,
    Objects,
}

#[derive(Debug)]
struct ObjectJob {
    object_id: u64,
    priority: Priority,
    payload: Bytes,
    offset: usize,
    sequence: u32,
}

#[derive(Debug)]
struct FileJob {
    file_id: u64,
    priority: Priority,
    remote_path: Option<String>,
    length: u64,
    header_sent: bool,
    offset: u64,
    sequence: u32,
}

#[derive(Debug)]
enum Job {
    Object(ObjectJob),
    File(FileJob),
}

/// What the sender does once the CLOSE signal is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AfterClose {
    /// Wait for the remote's CLOSE, up to the confirm timeout
    AwaitEcho,
    /// End the connection right away
    Terminate {
        cause: CloseCause,
        message: Option<String>,
    },
}

/// Next unit of work for the sender
#[derive(Debug)]
pub(crate) enum Next {
    Signal(Signal),
    Object {
        parcel: Parcel,
        done: bool,
    },
    FileHeader {
        file_id: u64,
        priority: Priority,
        remote_path: Option<String>,
        length: u64,
    },
    FileChunk {
        file_id: u64,
        priority: Priority,
        offset: u64,
        len: usize,
        sequence: u32,
        is_final: bool,
    },
    Close {
        signal: Signal,
        after: AfterClose,
    },
    /// Data is waiting but may not be sent yet
    Blocked,
    Idle,
}

/// Per-connection send queue
#[derive(Debug)]
pub(crate) struct SendQueue {
    signals: VecDeque<Signal>,
    lanes: [VecDeque<Job>; LANES],
    order: ChannelOrder,
    parcel_size: usize,
    object_capacity: usize,
    parcel_capacity: usize,
    pending_fragments: usize,
    close: Option<(Signal, AfterClose)>,
    released: Vec<u64>,
}

impl SendQueue {
    pub(crate) fn new(params: &ConnectionParameters) -> Self {
        Self {
            signals: VecDeque::new(),
            lanes: Default::default(),
            order: params.channel_order,
            parcel_size: params.transmission_parcel_size,
            object_capacity: params.object_queue_capacity,
            parcel_capacity: params.parcel_queue_capacity,
            pending_fragments: 0,
            close: None,
            released: Vec::new(),
        }
    }

    fn lane(&self, channel: Channel, priority: Priority) -> usize {
        let rank = match (self.order, channel) {
            (ChannelOrder::FilesFirst, Channel::Files)
            | (ChannelOrder::ObjectsFirst, Channel::Objects) => 0,
            _ => 1,
        };
        rank * 3 + priority.lane()
    }

    /// Objects and files waiting, including a partially sent one
    pub(crate) fn pending_items(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Object fragments waiting
    #[cfg(test)]
    pub(crate) fn pending_fragments(&self) -> usize {
        self.pending_fragments
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.close.is_some()
    }

    pub(crate) fn push_signal(&mut self, signal: Signal) {
        self.signals.push_back(signal);
    }

    pub(crate) fn push_object(
        &mut self,
        object_id: u64,
        priority: Priority,
        payload: Bytes,
    ) -> Result<()> {
        if self.pending_items() >= self.object_capacity {
            return Err(ProtocolError::CapacityExceeded {
                queue: "object",
                capacity: self.object_capacity,
            });
        }

        let fragments = payload.len().div_ceil(self.parcel_size).max(1);
        let fits = self.pending_fragments + fragments <= self.parcel_capacity;
        let oversized_into_empty = fragments > self.parcel_capacity && self.pending_fragments == 0;
        if !fits && !oversized_into_empty {
            return Err(ProtocolError::CapacityExceeded {
                queue: "parcel",
                capacity: self.parcel_capacity,
            });
        }

        self.pending_fragments += fragments;
        let lane = self.lane(Channel::Objects, priority);
        self.lanes[lane].push_back(Job::Object(ObjectJob {
            object_id,
            priority,
            payload,
            offset: 0,
            sequence: 0,
        }));
        Ok(())
    }

    pub(crate) fn push_file(
        &mut self,
        file_id: u64,
        priority: Priority,
        remote_path: Option<String>,
        length: u64,
    ) -> Result<()> {
        if self.pending_items() >= self.object_capacity {
            return Err(ProtocolError::CapacityExceeded {
                queue: "object",
                capacity: self.object_capacity,
            });
        }
        let lane = self.lane(Channel::Files, priority);
        self.lanes[lane].push_back(Job::File(FileJob {
            file_id,
            priority,
            remote_path,
            length,
            header_sent: false,
            offset: 0,
            sequence: 0,
        }));
        Ok(())
    }

    /// Drop a queued file; its ID is reported through [`SendQueue::take_released`]
    pub(crate) fn remove_file(&mut self, file_id: u64) -> bool {
        for lane in self.lanes.iter_mut() {
            if let Some(pos) = lane
                .iter()
                .position(|job| matches!(job, Job::File(f) if f.file_id == file_id))
            {
                lane.remove(pos);
                self.released.push(file_id);
                return true;
            }
        }
        false
    }

    /// File IDs whose read handles the sender must drop
    pub(crate) fn take_released(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.released)
    }

    /// Send CLOSE once every queued item has been sent
    pub(crate) fn request_close(&mut self, signal: Signal, after: AfterClose) {
        if self.close.is_none() {
            self.close = Some((signal, after));
        }
    }

    /// Discard queued data and send CLOSE after the pending signals
    pub(crate) fn close_now(&mut self, signal: Signal, after: AfterClose) {
        self.clear_data();
        self.close = Some((signal, after));
    }

    /// Discard queued data, keeping signals
    pub(crate) fn clear_data(&mut self) {
        for lane in self.lanes.iter_mut() {
            for job in lane.drain(..) {
                if let Job::File(f) = job {
                    self.released.push(f.file_id);
                }
            }
        }
        self.pending_fragments = 0;
    }

    /// Hand out the next parcel-sized unit of work
    ///
    /// With `admit_data == false` only signals (and a due CLOSE) are released.
    pub(crate) fn next(&mut self, admit_data: bool) -> Next {
        if let Some(signal) = self.signals.pop_front() {
            return Next::Signal(signal);
        }

        let Some(lane) = self.lanes.iter().position(|l| !l.is_empty()) else {
            return match self.close.take() {
                Some((signal, after)) => Next::Close { signal, after },
                None => Next::Idle,
            };
        };

        if !admit_data {
            return Next::Blocked;
        }

        let parcel_size = self.parcel_size;
        let (next, finished) = match self.lanes[lane].front_mut() {
            Some(Job::Object(job)) => {
                let total = job.payload.len();
                let end = (job.offset + parcel_size).min(total);
                let is_final = end == total;
                let parcel = Parcel::object_fragment(
                    job.object_id,
                    job.priority,
                    job.sequence,
                    total as u64,
                    is_final,
                    job.payload.slice(job.offset..end),
                );
                job.offset = end;
                job.sequence += 1;
                self.pending_fragments = self.pending_fragments.saturating_sub(1);
                (
                    Next::Object {
                        parcel,
                        done: is_final,
                    },
                    is_final,
                )
            }
            Some(Job::File(job)) if !job.header_sent => {
                job.header_sent = true;
                let next = Next::FileHeader {
                    file_id: job.file_id,
                    priority: job.priority,
                    remote_path: job.remote_path.clone(),
                    length: job.length,
                };
                (next, job.length == 0)
            }
            Some(Job::File(job)) => {
                let len = (job.length - job.offset).min(parcel_size as u64) as usize;
                job.sequence += 1;
                let is_final = job.offset + len as u64 == job.length;
                let next = Next::FileChunk {
                    file_id: job.file_id,
                    priority: job.priority,
                    offset: job.offset,
                    len,
                    sequence: job.sequence,
                    is_final,
                };
                job.offset += len as u64;
                (next, is_final)
            }
            None => (Next::Idle, false),
        };

        if finished {
            self.lanes[lane].pop_front();
        }
        next
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;

    fn params(order: ChannelOrder) -> ConnectionParameters {
        ConnectionParameters {
            parcel_queue_capacity: 10,
            object_queue_capacity: 4,
            transmission_parcel_size: 1024,
            channel_order: order,
            ..ConnectionParameters::default()
        }
    }

    fn object_id(next: Next) -> u64 {
        match next {
            Next::Object { parcel, .. } => parcel.object_id,
            other => panic!("Expected object parcel, got {other:?}"),
        }
    }

    #[test]
    fn test_priority_lanes_and_fifo() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_object(1, Priority::Low, Bytes::from_static(b"a")).unwrap();
        q.push_object(2, Priority::Normal, Bytes::from_static(b"b")).unwrap();
        q.push_object(3, Priority::High, Bytes::from_static(b"c")).unwrap();
        q.push_object(4, Priority::High, Bytes::from_static(b"d")).unwrap();

        let order: Vec<u64> = (0..4).map(|_| object_id(q.next(true))).collect();
        assert_eq!(order, vec![3, 4, 2, 1]);
        assert!(matches!(q.next(true), Next::Idle));
    }

    #[test]
    fn test_signals_preempt_and_bypass_admission() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_object(1, Priority::High, Bytes::from_static(b"a")).unwrap();
        q.push_signal(Signal::Alive);
        assert!(matches!(q.next(false), Next::Signal(Signal::Alive)));
        assert!(matches!(q.next(false), Next::Blocked));
        assert_eq!(object_id(q.next(true)), 1);
    }

    #[test]
    fn test_files_first_then_objects_first() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_object(1, Priority::High, Bytes::from_static(b"a")).unwrap();
        q.push_file(2, Priority::Low, None, 10).unwrap();
        assert!(matches!(q.next(true), Next::FileHeader { file_id: 2, .. }));

        let mut q = SendQueue::new(&params(ChannelOrder::ObjectsFirst));
        q.push_file(2, Priority::High, None, 10).unwrap();
        q.push_object(1, Priority::Low, Bytes::from_static(b"a")).unwrap();
        assert_eq!(object_id(q.next(true)), 1);
    }

    #[test]
    fn test_higher_lane_preempts_at_parcel_boundary() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_object(1, Priority::Low, Bytes::from(vec![0u8; 3000])).unwrap();
        assert_eq!(object_id(q.next(true)), 1);
        q.push_object(2, Priority::High, Bytes::from_static(b"urgent")).unwrap();
        assert_eq!(object_id(q.next(true)), 2);
        assert_eq!(object_id(q.next(true)), 1);
        match q.next(true) {
            Next::Object { parcel, done } => {
                assert_eq!(parcel.sequence, 2);
                assert!(done);
                assert!(parcel.is_final());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_object_capacity() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        for id in 0..4 {
            q.push_object(id, Priority::Normal, Bytes::from_static(b"x")).unwrap();
        }
        let err = q.push_object(9, Priority::Normal, Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, ProtocolError::CapacityExceeded { queue: "object", capacity: 4 }));
        assert!(q.push_file(10, Priority::Normal, None, 1).is_err());
    }

    #[test]
    fn test_parcel_capacity_and_oversized_exemption() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        // 20 fragments, more than the whole parcel capacity of 10
        q.push_object(1, Priority::Normal, Bytes::from(vec![0u8; 20 * 1024])).unwrap();
        assert_eq!(q.pending_fragments(), 20);
        let err = q.push_object(2, Priority::Normal, Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, ProtocolError::CapacityExceeded { queue: "parcel", .. }));

        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_object(1, Priority::Normal, Bytes::from(vec![0u8; 9 * 1024])).unwrap();
        q.push_object(2, Priority::Normal, Bytes::from_static(b"x")).unwrap();
        assert!(q
            .push_object(3, Priority::Normal, Bytes::from(vec![0u8; 20 * 1024]))
            .is_err());
    }

    #[test]
    fn test_file_chunks() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_file(5, Priority::Normal, Some("a/b.txt".into()), 2500).unwrap();
        assert!(matches!(q.next(true), Next::FileHeader { file_id: 5, length: 2500, .. }));
        let mut lens = Vec::new();
        loop {
            match q.next(true) {
                Next::FileChunk { len, is_final, offset, .. } => {
                    lens.push((offset, len));
                    if is_final {
                        break;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(lens, vec![(0, 1024), (1024, 1024), (2048, 452)]);
        assert_eq!(q.pending_items(), 0);
    }

    #[test]
    fn test_empty_file_is_header_only() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_file(1, Priority::Normal, None, 0).unwrap();
        assert!(matches!(q.next(true), Next::FileHeader { length: 0, .. }));
        assert!(matches!(q.next(true), Next::Idle));
    }

    #[test]
    fn test_remove_file_releases() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_file(7, Priority::Normal, None, 5000).unwrap();
        let _ = q.next(true);
        assert!(q.remove_file(7));
        assert!(!q.remove_file(7));
        assert_eq!(q.take_released(), vec![7]);
        assert!(q.take_released().is_empty());
    }

    #[test]
    fn test_close_after_drain() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_object(1, Priority::Normal, Bytes::from_static(b"a")).unwrap();
        q.request_close(
            Signal::Close { cause: 0, message: None },
            AfterClose::AwaitEcho,
        );
        assert!(q.is_closing());
        assert_eq!(object_id(q.next(true)), 1);
        assert!(matches!(q.next(true), Next::Close { after: AfterClose::AwaitEcho, .. }));
    }

    #[test]
    fn test_close_now_discards_data() {
        let mut q = SendQueue::new(&params(ChannelOrder::FilesFirst));
        q.push_object(1, Priority::Normal, Bytes::from_static(b"a")).unwrap();
        q.push_file(2, Priority::Normal, None, 10).unwrap();
        q.push_signal(Signal::FileConfirm { file_id: 9 });
        q.close_now(
            Signal::Close { cause: 1, message: None },
            AfterClose::Terminate { cause: CloseCause::RemoteClose, message: None },
        );
        assert!(matches!(q.next(true), Next::Signal(Signal::FileConfirm { file_id: 9 })));
        assert!(matches!(q.next(true), Next::Close { .. }));
        assert_eq!(q.take_released(), vec![2]);
    }
}
