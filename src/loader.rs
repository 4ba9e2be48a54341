//! Loader lifecycle: init, execute, teardown
//!
//! The controller wires the collaborators together: it opens the backing
//! file, asks the parser for the segment list, allocates every page tracker
//! up front, publishes the whole state to the process-wide slot, and hands
//! off to the program starter. From that point on, all liveness is driven
//! by faults arriving at [`crate::fault`].

use std::convert::Infallible;
use std::fs::File;
use std::path::Path;

use log::{debug, info};

use crate::error::{LoaderError, Result};
use crate::fault;
use crate::image::{ImageParser, LoadedImage, Segment};
use crate::mm::{self, mmap};
use crate::slot::StateSlot;
use crate::start::ProgramStarter;

/// Everything the fault handler needs, published as one unit.
pub(crate) struct LoaderState {
    /// Ordered, pairwise non-overlapping segments with their trackers.
    pub(crate) segments: Box<[Segment]>,
    /// Read-only backing file, the mapping source for every segment.
    pub(crate) file: File,
    /// Host page size, cached so the fault path never queries it.
    pub(crate) page_size: usize,
}

/// The one process-wide slot the trap-dispatch interface reads through.
/// Single-loaded-image lifetime: set in `execute`, drained in `teardown`.
static ACTIVE: StateSlot<LoaderState> = StateSlot::new();

/// The published state, if an image is active.
pub(crate) fn active_state() -> Option<&'static LoaderState> {
    ACTIVE.get()
}

/// Demand-paging loader controller.
pub struct Loader {
    parser: Box<dyn ImageParser>,
    starter: Box<dyn ProgramStarter>,
    page_size: usize,
}

impl Loader {
    /// Build a loader from its two collaborators.
    pub fn new(parser: Box<dyn ImageParser>, starter: Box<dyn ProgramStarter>) -> Self {
        Self {
            parser,
            starter,
            page_size: mm::page_size(),
        }
    }

    /// Install the fault handler, chaining the previous disposition.
    ///
    /// Must complete before any segment is touched.
    pub fn init(&self) -> Result<()> {
        fault::install()?;
        info!("fault handler installed");
        Ok(())
    }

    /// Load `path` and transfer control to it with `argv`.
    ///
    /// On success this does not return: the started program runs to
    /// completion and owns the process's exit status. On any failure before
    /// or during start, mappings are torn down and the error is returned.
    pub fn execute(&self, path: &Path, argv: &[String]) -> Result<Infallible> {
        if !fault::is_installed() {
            return Err(LoaderError::NotInitialized {
                subsystem: "fault handler",
            });
        }

        let file = File::open(path).map_err(|e| LoaderError::Open {
            path: path.to_path_buf(),
            errno: e.raw_os_error().unwrap_or(0),
        })?;

        let parsed = self.parser.parse(path)?;
        if parsed.segments.is_empty() {
            return Err(LoaderError::Parse {
                path: path.to_path_buf(),
                reason: "empty segment list",
            });
        }

        // Allocate every tracker now; nothing on the fault path allocates.
        let segments: Box<[Segment]> = parsed
            .segments
            .into_iter()
            .map(|info| Segment::new(info, self.page_size))
            .collect();
        for segment in segments.iter() {
            let info = segment.info();
            debug!(
                "segment 0x{:x}..0x{:x} ({} pages, file {} bytes, {:?})",
                info.vaddr,
                info.vaddr + info.mem_size,
                segment.pages.len(),
                info.file_size,
                info.prot
            );
        }

        ACTIVE
            .set(Box::new(LoaderState {
                segments,
                file,
                page_size: self.page_size,
            }))
            .map_err(|_| LoaderError::AlreadyActive)?;
        let state = active_state().ok_or(LoaderError::NotInitialized {
            subsystem: "loader state",
        })?;

        info!(
            "executing {} with {} segment(s)",
            path.display(),
            state.segments.len()
        );

        let image = LoadedImage {
            entry: parsed.entry,
            segments: &state.segments,
        };
        let err = match self.starter.start(&image, argv) {
            Ok(never) => match never {},
            Err(err) => err,
        };

        // The starter returned: the program never took over the process.
        self.teardown();
        Err(err)
    }

    /// Unmap every materialized page, release the trackers and the backing
    /// file, and restore the prior fault disposition.
    ///
    /// Runs at most once per published image; a second call is a no-op.
    pub fn teardown(&self) {
        if let Some(state) = ACTIVE.take() {
            let mut unmapped = 0usize;
            for segment in state.segments.iter() {
                for page in segment.pages.mapped_indices() {
                    let addr = segment.page_addr(page, state.page_size);
                    match mmap::unmap(addr, state.page_size) {
                        Ok(()) => unmapped += 1,
                        Err(e) => log::warn!("failed to unmap page 0x{:x}: errno {}", addr, e.0),
                    }
                }
            }
            info!("teardown: unmapped {} page(s)", unmapped);
            // Trackers and the backing fd are released with the state.
        }
        fault::uninstall();
    }
}
