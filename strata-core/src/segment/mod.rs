//! Segments: boundary policies, mapped segment files and the table of
//! sealed (historical) segments

mod files;
mod finder;
mod table;

pub use files::{ChunkBytes, ChunkPlacement, SegmentFileWriter, SegmentFiles};
pub use finder::{CalendarSegmentFinder, CalendarUnit, FixedSegmentFinder, SegmentFinder, SingleSegmentFinder};
pub use table::{HistoricalRange, HistoricalSegmentTable, SegmentSummary, UPDATE_MARKER};
pub(crate) use table::segment_hash;
