/// A bounded run of records from one input file, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    /// Position of the source file in the call's path list.
    pub file_index: u32,
    pub records: Vec<T>,
}

/// Groups records into batches of at most `size`.
///
/// Batches never span files: the caller starts a new batcher per file and
/// flushes it with [`finish`](Batcher::finish).
pub struct Batcher<T> {
    size: usize,
    file_index: u32,
    current: Vec<T>,
}

impl<T> Batcher<T> {
    pub fn new(size: usize, file_index: u32) -> Self {
        let size = size.max(1);
        Self {
            size,
            file_index,
            current: Vec::with_capacity(size),
        }
    }

    /// Adds a record, returning a full batch once `size` is reached.
    pub fn push(&mut self, record: T) -> Option<Batch<T>> {
        self.current.push(record);
        if self.current.len() >= self.size {
            let records = std::mem::replace(&mut self.current, Vec::with_capacity(self.size));
            Some(Batch {
                file_index: self.file_index,
                records,
            })
        } else {
            None
        }
    }

    /// The final partial batch, if any records are left.
    pub fn finish(self) -> Option<Batch<T>> {
        if self.current.is_empty() {
            None
        } else {
            Some(Batch {
                file_index: self.file_index,
                records: self.current,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_all(n: usize, size: usize) -> Vec<Batch<usize>> {
        let mut batcher = Batcher::new(size, 3);
        let mut out: Vec<Batch<usize>> = (0..n).filter_map(|i| batcher.push(i)).collect();
        out.extend(batcher.finish());
        out
    }

    #[test]
    fn test_every_record_in_exactly_one_batch_in_order() {
        for size in [1, 2, 7, 256, 1000] {
            let batches = batch_all(1001, size);
            let flat: Vec<usize> = batches.iter().flat_map(|b| b.records.clone()).collect();
            assert_eq!(flat, (0..1001).collect::<Vec<_>>(), "size {size}");
            assert!(batches.iter().all(|b| b.records.len() <= size));
            assert!(batches.iter().all(|b| b.file_index == 3));
        }
    }

    #[test]
    fn test_exact_multiple_leaves_no_partial() {
        let batches = batch_all(512, 256);
        assert_eq!(batches.len(), 2);
        assert!(batch_all(0, 256).is_empty());
    }

    #[test]
    fn test_zero_size_clamps_to_one() {
        assert_eq!(batch_all(3, 0).len(), 3);
    }
}
