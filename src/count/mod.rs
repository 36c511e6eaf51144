pub mod index;
pub mod join;
pub mod table;

pub use index::{ClassificationIndex, IndexFragment, Lineage, Origin, ReportFilter, ReportWorker};
pub use join::{HitSet, ReadState, ReadTally, ReadWorker};
pub use table::{CountTable, FinalTable, FinalizeTally};
