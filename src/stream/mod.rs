//! Chunked streaming of result sequences too large for one message frame.
//!
//! The sender side packs serialized result objects into size-bounded,
//! sequence-numbered chunks; the receiver side reassembles each sender's
//! chunks in sequence order. The receiving half plugs into the reply
//! correlator, which treats "chunk stream finished" as that target's reply.

use std::collections::BTreeMap;

use crate::utils::GridError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// One chunk of a streamed result sequence. The sending member and processor
/// ID ride on the enclosing reply envelope; ordering is per-sender by `seq`.
/// The final chunk announces its own sequence number via `last`; the total
/// chunk count is not known in advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// Chunk sequence number, starting at 0 per sender.
    pub seq: u32,

    /// True on the final chunk of this sender's sequence.
    pub last: bool,

    /// Serialized result objects carried by this chunk.
    pub objects: Vec<Bytes>,
}

impl ChunkEnvelope {
    /// Number of result objects in this chunk.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// Sender-side chunk packer with a fixed byte capacity sized to the
/// transport's frame limit.
///
/// Appending an object that would overflow the buffer flushes the buffer
/// without it and retries the object as the first item of the next chunk; a
/// chunk's first object always goes in whole even when oversized, since a
/// single object is never split across chunks.
#[derive(Debug)]
pub struct ChunkedSender {
    /// Byte capacity of one chunk.
    capacity: usize,

    /// Objects staged for the current chunk.
    staged: Vec<Bytes>,

    /// Total bytes staged.
    staged_bytes: usize,

    /// Sequence number the next flushed chunk will carry.
    next_seq: u32,
}

impl ChunkedSender {
    pub fn new(capacity: usize) -> Result<Self, GridError> {
        if capacity == 0 {
            return logged_err!("invalid chunk capacity 0");
        }
        Ok(ChunkedSender {
            capacity,
            staged: Vec::new(),
            staged_bytes: 0,
            next_seq: 0,
        })
    }

    fn flush(&mut self, last: bool) -> ChunkEnvelope {
        let env = ChunkEnvelope {
            seq: self.next_seq,
            last,
            objects: std::mem::take(&mut self.staged),
        };
        self.next_seq += 1;
        self.staged_bytes = 0;
        env
    }

    /// Stages one serialized object. Returns a chunk to send out now if
    /// staging the object forced a flush of the previously staged objects.
    pub fn push(&mut self, obj: Bytes) -> Option<ChunkEnvelope> {
        let mut flushed = None;
        if !self.staged.is_empty()
            && self.staged_bytes + obj.len() > self.capacity
        {
            // the object is not sent in the current chunk; it becomes the
            // first item of the next one
            flushed = Some(self.flush(false));
        }
        self.staged_bytes += obj.len();
        self.staged.push(obj);
        flushed
    }

    /// Ends the stream, producing the final chunk. A producer that yielded
    /// zero objects still gets exactly one empty last chunk, so the receiver
    /// detects completion deterministically.
    pub fn finish(mut self) -> ChunkEnvelope {
        self.flush(true)
    }
}

/// Receiver-side reassembly of one sender's chunk sequence. Chunks may
/// arrive in any delivery order and may be duplicated by send retries; each
/// chunk is folded exactly once, in sequence order.
#[derive(Debug, Default)]
pub struct ChunkAssembly {
    /// Chunks received ahead of order, keyed by sequence number.
    buffered: BTreeMap<u32, Vec<Bytes>>,

    /// Next sequence number to fold; equals the count of chunks folded.
    next_seq: u32,

    /// Sequence number of the last chunk, once it has arrived.
    last_seq: Option<u32>,

    /// Result objects folded so far, in production order.
    objects: Vec<Bytes>,
}

impl ChunkAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a received chunk. Returns the payloads of chunks that became
    /// foldable in order (possibly none, possibly several if this chunk
    /// filled a gap). Duplicates are dropped.
    pub fn offer(&mut self, env: ChunkEnvelope) -> Vec<Vec<Bytes>> {
        if env.last {
            self.last_seq = Some(env.seq);
        }
        if env.seq >= self.next_seq {
            self.buffered.entry(env.seq).or_insert(env.objects);
        }

        let mut ready = Vec::new();
        while let Some(objects) = self.buffered.remove(&self.next_seq) {
            self.next_seq += 1;
            ready.push(objects);
        }
        ready
    }

    /// Appends folded objects to the reassembled sequence.
    pub fn absorb(&mut self, objects: Vec<Bytes>) {
        self.objects.extend(objects);
    }

    /// True once the last chunk has arrived and every chunk up to it has
    /// been folded. This guards against chunks arriving out of delivery
    /// order: seeing `last` alone is not completion.
    pub fn complete(&self) -> bool {
        match self.last_seq {
            Some(last) => self.next_seq == last + 1,
            None => false,
        }
    }

    /// Takes the reassembled object sequence.
    pub fn into_objects(self) -> Vec<Bytes> {
        self.objects
    }
}

#[cfg(test)]
mod stream_tests {
    use super::*;

    fn obj(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn sender_rejects_zero_capacity() {
        assert!(ChunkedSender::new(0).is_err());
    }

    #[test]
    fn sender_packs_to_capacity() {
        let mut sender = ChunkedSender::new(10).unwrap();
        assert_eq!(sender.push(obj(4, 0)), None);
        assert_eq!(sender.push(obj(4, 1)), None);
        // third object would overflow: previous two flush without it
        let env = sender.push(obj(4, 2)).unwrap();
        assert_eq!(env.seq, 0);
        assert!(!env.last);
        assert_eq!(env.object_count(), 2);
        // the overflowing object leads the next chunk
        let env = sender.finish();
        assert_eq!(env.seq, 1);
        assert!(env.last);
        assert_eq!(env.objects, vec![obj(4, 2)]);
    }

    #[test]
    fn sender_never_splits_single_object() {
        // capacity 10 bytes, object 50 bytes: one chunk with that object
        let mut sender = ChunkedSender::new(10).unwrap();
        assert_eq!(sender.push(obj(50, 7)), None);
        let env = sender.finish();
        assert_eq!(env.seq, 0);
        assert!(env.last);
        assert_eq!(env.objects, vec![obj(50, 7)]);
    }

    #[test]
    fn sender_empty_stream_one_last_chunk() {
        let sender = ChunkedSender::new(10).unwrap();
        let env = sender.finish();
        assert_eq!(env.seq, 0);
        assert!(env.last);
        assert_eq!(env.object_count(), 0);
    }

    #[test]
    fn assembly_in_order() {
        let mut sender = ChunkedSender::new(8).unwrap();
        let mut envs = Vec::new();
        for i in 0..6u8 {
            if let Some(env) = sender.push(obj(4, i)) {
                envs.push(env);
            }
        }
        envs.push(sender.finish());

        let mut assembly = ChunkAssembly::new();
        for env in envs {
            for objects in assembly.offer(env) {
                assembly.absorb(objects);
            }
        }
        assert!(assembly.complete());
        let objects = assembly.into_objects();
        assert_eq!(objects.len(), 6);
        for (i, o) in objects.iter().enumerate() {
            assert_eq!(*o, obj(4, i as u8));
        }
    }

    #[test]
    fn assembly_any_replay_order_no_lost_chunk() {
        // produce M = 9 objects across several chunks
        let mut sender = ChunkedSender::new(8).unwrap();
        let mut envs = Vec::new();
        for i in 0..9u8 {
            if let Some(env) = sender.push(obj(3, i)) {
                envs.push(env);
            }
        }
        envs.push(sender.finish());
        assert!(envs.len() >= 3);

        // replay in reverse order with a duplicate thrown in
        let mut replay = envs.clone();
        replay.reverse();
        replay.push(envs[0].clone());

        let mut assembly = ChunkAssembly::new();
        for env in replay {
            for objects in assembly.offer(env) {
                assembly.absorb(objects);
            }
        }
        assert!(assembly.complete());
        let objects = assembly.into_objects();
        assert_eq!(objects.len(), 9);
        for (i, o) in objects.iter().enumerate() {
            assert_eq!(*o, obj(3, i as u8));
        }
    }

    #[test]
    fn assembly_last_alone_is_not_complete() {
        let mut assembly = ChunkAssembly::new();
        let ready = assembly.offer(ChunkEnvelope {
            seq: 2,
            last: true,
            objects: vec![obj(1, 2)],
        });
        assert!(ready.is_empty());
        assert!(!assembly.complete());

        for objects in assembly.offer(ChunkEnvelope {
            seq: 0,
            last: false,
            objects: vec![obj(1, 0)],
        }) {
            assembly.absorb(objects);
        }
        assert!(!assembly.complete());

        for objects in assembly.offer(ChunkEnvelope {
            seq: 1,
            last: false,
            objects: vec![obj(1, 1)],
        }) {
            assembly.absorb(objects);
        }
        // seq 2 got buffered earlier and unblocks now
        for objects in assembly.offer(ChunkEnvelope {
            seq: 2,
            last: true,
            objects: vec![obj(1, 2)],
        }) {
            assembly.absorb(objects);
        }
        assert!(assembly.complete());
        assert_eq!(assembly.into_objects().len(), 3);
    }

    #[test]
    fn assembly_empty_last_completes() {
        let mut assembly = ChunkAssembly::new();
        let ready = assembly.offer(ChunkEnvelope {
            seq: 0,
            last: true,
            objects: vec![],
        });
        assert_eq!(ready.len(), 1);
        assert!(assembly.complete());
        assert!(assembly.into_objects().is_empty());
    }
}
