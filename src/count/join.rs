//! Read-side join: tag extraction, index lookup and bucket increments.

use crate::batch::Batch;
use crate::count::index::ClassificationIndex;
use crate::count::table::CountTable;
use crate::error::Result;
use crate::tags::TagExtractor;
use crate::types::Read;

/// One bit per index slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitSet {
    words: Vec<u64>,
}

impl HitSet {
    pub fn with_slots(slots: usize) -> Self {
        Self {
            words: vec![0; slots.div_ceil(64)],
        }
    }

    pub fn insert(&mut self, slot: u32) {
        let slot = slot as usize;
        self.words[slot / 64] |= 1 << (slot % 64);
    }

    pub fn union(mut self, other: &HitSet) -> HitSet {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= b;
        }
        self
    }

    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadTally {
    pub processed: u64,
    pub without_tag: u64,
    pub unclassified: u64,
}

impl ReadTally {
    pub fn add(&mut self, other: &ReadTally) {
        self.processed += other.processed;
        self.without_tag += other.without_tag;
        self.unclassified += other.unclassified;
    }
}

/// Everything one worker owns during the read phase.
#[derive(Debug, Default)]
pub struct ReadState {
    pub table: CountTable,
    pub hits: HitSet,
    pub tally: ReadTally,
    scratch: Vec<u8>,
}

/// Shared, read-only context of the read phase.
pub struct ReadWorker<'c> {
    index: &'c ClassificationIndex,
    tags: &'c TagExtractor,
}

impl<'c> ReadWorker<'c> {
    pub fn new(index: &'c ClassificationIndex, tags: &'c TagExtractor) -> Self {
        Self { index, tags }
    }

    pub fn new_state(&self) -> ReadState {
        ReadState {
            hits: HitSet::with_slots(self.index.len()),
            ..ReadState::default()
        }
    }

    pub fn process(&self, state: &mut ReadState, batch: Batch<Read>) -> Result<()> {
        for read in &batch.records {
            self.process_read(state, read);
        }
        Ok(())
    }

    fn process_read(&self, state: &mut ReadState, read: &Read) {
        state.tally.processed += 1;

        let classified = self.index.lookup(&read.id);
        if let Some((slot, _)) = classified {
            state.hits.insert(slot);
        } else {
            state.tally.unclassified += 1;
        }

        let Some(tag) = self.tags.extract(read, &mut state.scratch) else {
            state.tally.without_tag += 1;
            return;
        };
        if let Some((_, taxon_id)) = classified {
            state.table.increment(taxon_id, tag.pattern as u32, tag.umi);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnchorPosition, BarcodeSpec, TagSource};
    use crate::count::index::{IndexFragment, Origin};
    use crate::types::{Classification, CountKey};

    fn index(entries: &[(&str, u64)]) -> ClassificationIndex {
        let mut frag = IndexFragment::default();
        for (line, (id, taxon_id)) in entries.iter().enumerate() {
            frag.insert(
                Origin {
                    file_index: 0,
                    line: line as u64 + 1,
                },
                Classification {
                    read_id: id.to_string(),
                    taxon_id: *taxon_id,
                    rank_path: vec![],
                    taxon_path: vec![],
                    total_reads: 1,
                    read_length: 10,
                },
            );
        }
        ClassificationIndex::from_fragments(vec![frag]).unwrap()
    }

    fn read(id: &str, seq: &str) -> Read {
        Read {
            id: id.into(),
            header: id.into(),
            sequence: seq.as_bytes().to_vec(),
            quality: vec![b'I'; seq.len()],
        }
    }

    fn extractor() -> TagExtractor {
        TagExtractor::new(&BarcodeSpec {
            patterns: vec!["AAAA".into()],
            anchor_position: AnchorPosition::Prefix,
            mismatch_tolerance: 0,
            umi_length: 4,
            tag_source: TagSource::Sequence,
        })
        .unwrap()
    }

    #[test]
    fn test_join_counts_and_misses() {
        let index = index(&[("r1", 9606), ("r2", 9606), ("r3", 562), ("r4", 562)]);
        let tags = extractor();
        let worker = ReadWorker::new(&index, &tags);
        let mut state = worker.new_state();
        worker
            .process(
                &mut state,
                Batch {
                    file_index: 0,
                    records: vec![
                        read("r1", "AAAAUMI1GG"),
                        read("r2", "AAAAUMI1TT"),
                        read("r3", "CCCCCCCCCC"),
                        read("r5", "AAAAUMI9"),
                    ],
                },
            )
            .unwrap();

        assert_eq!(state.table.get(&CountKey::new(9606, 0, b"UMI1")), 2);
        assert_eq!(state.table.len(), 1);
        assert_eq!(state.tally.processed, 4);
        assert_eq!(state.tally.without_tag, 1);
        assert_eq!(state.tally.unclassified, 1);
        // r1, r2, r3 were looked up; r4 never
        assert_eq!(state.hits.count(), 3);
        let mut r4 = HitSet::with_slots(index.len());
        r4.insert(index.lookup("r4").unwrap().0);
        assert_eq!(state.hits.clone().union(&r4).count(), 4);
    }

    #[test]
    fn test_hit_set_union() {
        let mut a = HitSet::with_slots(130);
        a.insert(0);
        a.insert(129);
        let mut b = HitSet::with_slots(130);
        b.insert(64);
        b.insert(0);
        let all = a.union(&b);
        assert_eq!(all.count(), 3);
        assert_eq!(HitSet::default().union(&all), all);
        assert_eq!(HitSet::default().count(), 0);
    }
}
