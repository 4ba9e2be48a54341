//! Segments and the parser collaborator interface
//!
//! The loader treats the executable container as a black box: an
//! [`ImageParser`] turns a path into an ordered list of [`SegmentInfo`]
//! records plus an entry point, and everything downstream works on
//! [`Segment`]s, which pair a record with its page tracker.

use std::path::Path;

use crate::error::Result;
use crate::mm::mmap::ProtFlags;
use crate::mm::pages_spanned;
use crate::mm::tracker::PageTracker;

/// One loadable region as reported by the parser.
///
/// `vaddr` and `file_offset` must be page-aligned; `mem_size >= file_size`.
/// Parsers normalize congruent unaligned values before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Start of the region in the process's address space.
    pub vaddr: usize,
    /// Offset of the region's first byte in the backing file.
    pub file_offset: u64,
    /// Bytes backed by file content.
    pub file_size: usize,
    /// Total extent in memory; the tail past `file_size` reads as zero.
    pub mem_size: usize,
    /// Declared access permissions.
    pub prot: ProtFlags,
}

/// Parser output: the segment list plus the program entry point.
#[derive(Debug, Clone)]
pub struct ParsedImage {
    /// Virtual address execution starts at.
    pub entry: usize,
    /// Ordered, pairwise non-overlapping loadable segments.
    pub segments: Vec<SegmentInfo>,
}

/// The executable-container parser collaborator.
pub trait ImageParser {
    /// Produce the segment descriptor for the image at `path`.
    ///
    /// Malformed or empty input fails with [`crate::LoaderError::Parse`].
    fn parse(&self, path: &Path) -> Result<ParsedImage>;
}

/// A published segment: descriptor plus exclusive page state.
pub struct Segment {
    info: SegmentInfo,
    /// One state per page of `mem_size`.
    pub pages: PageTracker,
}

impl Segment {
    /// Build a segment with a zeroed tracker sized to its memory extent.
    pub fn new(info: SegmentInfo, page_size: usize) -> Self {
        let pages = PageTracker::new(pages_spanned(info.mem_size, page_size));
        Self { info, pages }
    }

    /// The descriptor this segment was built from.
    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    /// Whether `addr` falls within `[vaddr, vaddr + mem_size)`.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.info.vaddr && addr < self.info.vaddr + self.info.mem_size
    }

    /// Page index of `addr` within this segment.
    pub fn page_index(&self, addr: usize, page_size: usize) -> usize {
        (addr - self.info.vaddr) / page_size
    }

    /// Virtual address of page `index`.
    pub fn page_addr(&self, index: usize, page_size: usize) -> usize {
        self.info.vaddr + index * page_size
    }
}

/// First segment whose range contains `addr`, if any.
///
/// Linear first-match scan; segment sets are single-digit sized and
/// pairwise non-overlapping, so no index structure is warranted.
pub fn find_segment(segments: &[Segment], addr: usize) -> Option<&Segment> {
    segments.iter().find(|s| s.contains(addr))
}

/// The view of a published image handed to the program starter.
pub struct LoadedImage<'a> {
    /// Virtual address execution starts at.
    pub entry: usize,
    /// The published segments.
    pub segments: &'a [Segment],
}
