//! Registry of live sequences in a ring.
//!
//! A sequence is a contiguous epoch of ring bytes described by a single
//! immutable header. Records live in an ordered deque; handles held by
//! readers and writers are plain integer ids, validated against the
//! registry on every use so an expired handle is detectable rather than
//! dangling.

use std::collections::VecDeque;
use std::sync::Arc;

/// One live sequence.
pub(crate) struct SequenceRecord {
    pub id: u64,
    pub name: String,
    pub time_tag: u64,
    pub header: Arc<[u8]>,
    /// Ring byte offset of the first byte of this sequence.
    pub begin: u64,
    /// Ring byte offset one past the last byte, once the sequence ends.
    pub end: Option<u64>,
    /// Number of open reader handles referencing this record.
    pub nreader: usize,
}

/// Ordered collection of live sequences.
///
/// Ids are strictly increasing and begin offsets are non-decreasing, so the
/// deque is sorted by both.
#[derive(Default)]
pub(crate) struct SequenceRegistry {
    seqs: VecDeque<SequenceRecord>,
    next_id: u64,
}

impl SequenceRegistry {
    /// Insert a new open sequence starting at `begin`; returns its id.
    pub fn begin(&mut self, name: String, time_tag: u64, header: Arc<[u8]>, begin: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.seqs.push_back(SequenceRecord {
            id,
            name,
            time_tag,
            header,
            begin,
            end: None,
            nreader: 0,
        });
        id
    }

    pub fn get(&self, id: u64) -> Option<&SequenceRecord> {
        self.seqs.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut SequenceRecord> {
        self.seqs.iter_mut().find(|s| s.id == id)
    }

    pub fn earliest(&self) -> Option<&SequenceRecord> {
        self.seqs.front()
    }

    pub fn latest(&self) -> Option<&SequenceRecord> {
        self.seqs.back()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&SequenceRecord> {
        self.seqs.iter().find(|s| s.name == name)
    }

    /// The sequence with the largest time tag not after `time_tag`.
    pub fn find_at_time(&self, time_tag: u64) -> Option<&SequenceRecord> {
        self.seqs.iter().rev().find(|s| s.time_tag <= time_tag)
    }

    /// The first sequence created after the one with id `id`.
    ///
    /// Also answers for pruned ids: any record with a larger id qualifies.
    pub fn next_after(&self, id: u64) -> Option<&SequenceRecord> {
        self.seqs.iter().find(|s| s.id > id)
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    /// Drop finished sequences that no reader holds and whose bytes have
    /// all been reclaimed by the writer (tail has moved past their end).
    pub fn prune(&mut self, tail: u64) {
        while let Some(front) = self.seqs.front() {
            let done = front.nreader == 0 && front.end.is_some_and(|end| end <= tail);
            if !done {
                break;
            }
            let dropped = self.seqs.pop_front();
            if let Some(seq) = dropped {
                tracing::debug!(sequence = %seq.name, id = seq.id, "pruned finished sequence");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Arc<[u8]> {
        Arc::from(&b"{}"[..])
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut reg = SequenceRegistry::default();
        let a = reg.begin("a".into(), 100, header(), 0);
        let b = reg.begin("b".into(), 200, header(), 512);
        assert!(b > a);
        assert_eq!(reg.earliest().unwrap().id, a);
        assert_eq!(reg.latest().unwrap().id, b);
    }

    #[test]
    fn test_lookup_by_name_and_time() {
        let mut reg = SequenceRegistry::default();
        reg.begin("obs-1".into(), 1000, header(), 0);
        reg.begin("obs-2".into(), 2000, header(), 512);
        assert_eq!(reg.find_by_name("obs-2").unwrap().time_tag, 2000);
        assert!(reg.find_by_name("obs-3").is_none());
        // Largest tag <= request.
        assert_eq!(reg.find_at_time(1500).unwrap().name, "obs-1");
        assert_eq!(reg.find_at_time(2000).unwrap().name, "obs-2");
        assert!(reg.find_at_time(500).is_none());
    }

    #[test]
    fn test_next_after_skips_pruned_ids() {
        let mut reg = SequenceRegistry::default();
        let a = reg.begin("a".into(), 1, header(), 0);
        reg.get_mut(a).unwrap().end = Some(100);
        let b = reg.begin("b".into(), 2, header(), 100);
        reg.prune(100);
        assert!(reg.get(a).is_none());
        assert_eq!(reg.next_after(a).unwrap().id, b);
    }

    #[test]
    fn test_prune_respects_readers_and_tail() {
        let mut reg = SequenceRegistry::default();
        let a = reg.begin("a".into(), 1, header(), 0);
        reg.get_mut(a).unwrap().end = Some(100);
        reg.get_mut(a).unwrap().nreader = 1;

        // Held by a reader: stays even though the tail has passed.
        reg.prune(200);
        assert!(reg.get(a).is_some());

        reg.get_mut(a).unwrap().nreader = 0;
        // Tail not yet past the end: stays.
        reg.prune(50);
        assert!(reg.get(a).is_some());

        reg.prune(100);
        assert!(reg.get(a).is_none());
    }

    #[test]
    fn test_open_sequence_never_pruned() {
        let mut reg = SequenceRegistry::default();
        reg.begin("open".into(), 1, header(), 0);
        reg.prune(u64::MAX);
        assert!(!reg.is_empty());
    }
}
