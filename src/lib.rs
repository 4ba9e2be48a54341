//! Demand-paged loading for statically structured executables
//!
//! Instead of copying every segment into memory up front, the loader maps
//! segments lazily: each page is materialized on its first access, from
//! inside a SIGSEGV handler. Faults on addresses the loader does not own,
//! or on pages it already mapped, are forwarded to the previously installed
//! disposition so the program's own crash behavior is untouched.
//!
//! The container parser and the transfer of control are collaborators
//! behind traits ([`ImageParser`], [`ProgramStarter`]); the crate ships an
//! ELF64 parser and an x86_64 entry starter so the `lazyrun` command works
//! end to end, and tests substitute both.
//!
//! ```no_run
//! use lazyrun::{elf::ElfParser, start::EntryStarter, Loader};
//!
//! # fn main() -> Result<(), lazyrun::LoaderError> {
//! let loader = Loader::new(Box::new(ElfParser), Box::new(EntryStarter));
//! loader.init()?;
//! // Does not return once the program is running.
//! let err = loader.execute("demo".as_ref(), &["demo".to_string()]).unwrap_err();
//! Err(err)
//! # }
//! ```

pub mod elf;
pub mod error;
mod fault;
pub mod image;
pub mod logging;
pub mod loader;
pub mod mm;
mod slot;
pub mod start;

pub use error::{LoaderError, Result};
pub use image::{ImageParser, LoadedImage, ParsedImage, SegmentInfo};
pub use loader::Loader;
pub use start::{EntryStarter, ProgramStarter};
