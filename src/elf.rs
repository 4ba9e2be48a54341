//! ELF64 program-header reader
//!
//! Implements the parser collaborator for statically linked ELF64
//! executables. Only the pieces the loader needs are read: the file header
//! for validation and the entry point, and the `PT_LOAD` program headers
//! for the segment list. Sections, symbols and relocations are never
//! touched.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{LoaderError, Result};
use crate::image::{ImageParser, ParsedImage, SegmentInfo};
use crate::mm::mmap::ProtFlags;
use crate::mm::page_size;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    magic: [u8; 4],
    class: u8,
    data: u8,
    version: u8,
    osabi: u8,
    abiversion: u8,
    pad: [u8; 7],
    elf_type: u16,
    machine: u16,
    version2: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const ELF_VERSION_CURRENT: u8 = 1;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

const EHDR_SIZE: usize = core::mem::size_of::<Elf64Header>();
const PHDR_SIZE: usize = core::mem::size_of::<Elf64ProgramHeader>();

fn prot_from_flags(flags: u32) -> ProtFlags {
    let mut prot = ProtFlags::empty();
    if flags & PF_R != 0 {
        prot |= ProtFlags::READ;
    }
    if flags & PF_W != 0 {
        prot |= ProtFlags::WRITE;
    }
    if flags & PF_X != 0 {
        prot |= ProtFlags::EXEC;
    }
    prot
}

fn parse_err(path: &Path, reason: &'static str) -> LoaderError {
    LoaderError::Parse {
        path: path.to_path_buf(),
        reason,
    }
}

fn validate_header(header: &Elf64Header, path: &Path) -> Result<()> {
    if header.magic != ELF_MAGIC {
        return Err(parse_err(path, "invalid ELF magic"));
    }
    if header.class != ELF_CLASS_64 {
        return Err(parse_err(path, "not a 64-bit ELF"));
    }
    if header.data != ELF_DATA_2LSB {
        return Err(parse_err(path, "not little-endian"));
    }
    if header.version != ELF_VERSION_CURRENT {
        return Err(parse_err(path, "unsupported ELF version"));
    }
    if header.elf_type == ET_DYN {
        return Err(parse_err(path, "position-independent executables are not supported"));
    }
    if header.elf_type != ET_EXEC {
        return Err(parse_err(path, "not an executable"));
    }
    if header.phentsize as usize != PHDR_SIZE {
        return Err(parse_err(path, "unexpected program header size"));
    }
    if header.phnum == 0 {
        return Err(parse_err(path, "no program headers"));
    }
    Ok(())
}

/// Convert one `PT_LOAD` header into a page-normalized segment record.
///
/// ELF only guarantees `p_vaddr ≡ p_offset (mod page)`; the loader maps at
/// page granularity, so both are rounded down together and the sizes grow
/// by the same delta.
fn normalize(phdr: &Elf64ProgramHeader, page: usize, path: &Path) -> Result<SegmentInfo> {
    if phdr.filesz > phdr.memsz {
        return Err(parse_err(path, "segment file size exceeds memory size"));
    }
    let vaddr = usize::try_from(phdr.vaddr).map_err(|_| parse_err(path, "segment address overflow"))?;
    let memsz = usize::try_from(phdr.memsz).map_err(|_| parse_err(path, "segment size overflow"))?;
    let filesz = usize::try_from(phdr.filesz).map_err(|_| parse_err(path, "segment size overflow"))?;

    let delta = vaddr % page;
    if phdr.offset as usize % page != delta {
        return Err(parse_err(path, "segment offset and address are not congruent"));
    }

    Ok(SegmentInfo {
        vaddr: vaddr - delta,
        file_offset: phdr.offset - delta as u64,
        file_size: filesz + delta,
        mem_size: memsz + delta,
        prot: prot_from_flags(phdr.flags),
    })
}

fn ranges_overlap(a: &SegmentInfo, b: &SegmentInfo) -> bool {
    a.vaddr < b.vaddr + b.mem_size && b.vaddr < a.vaddr + a.mem_size
}

/// Parser for statically linked ELF64 executables.
pub struct ElfParser;

impl ImageParser for ElfParser {
    fn parse(&self, path: &Path) -> Result<ParsedImage> {
        let file = File::open(path).map_err(|_| parse_err(path, "cannot read image"))?;

        let mut ehdr_buf = [0u8; EHDR_SIZE];
        file.read_exact_at(&mut ehdr_buf, 0)
            .map_err(|_| parse_err(path, "file too small for ELF header"))?;
        // SAFETY: Elf64Header is repr(C), all fields plain integers, and
        // the buffer holds exactly size_of::<Elf64Header>() bytes;
        // read_unaligned imposes no alignment requirement.
        let header = unsafe { core::ptr::read_unaligned(ehdr_buf.as_ptr() as *const Elf64Header) };
        validate_header(&header, path)?;

        let mut phdr_buf = vec![0u8; PHDR_SIZE * header.phnum as usize];
        file.read_exact_at(&mut phdr_buf, header.phoff)
            .map_err(|_| parse_err(path, "file too small for program headers"))?;

        let page = page_size();
        let mut segments: Vec<SegmentInfo> = Vec::with_capacity(header.phnum as usize);
        for chunk in phdr_buf.chunks_exact(PHDR_SIZE) {
            // SAFETY: same layout argument as for the file header; each
            // chunk is exactly one program header.
            let phdr = unsafe {
                core::ptr::read_unaligned(chunk.as_ptr() as *const Elf64ProgramHeader)
            };
            if phdr.p_type != PT_LOAD || phdr.memsz == 0 {
                continue;
            }
            let info = normalize(&phdr, page, path)?;
            if segments.iter().any(|existing| ranges_overlap(existing, &info)) {
                return Err(parse_err(path, "overlapping loadable segments"));
            }
            segments.push(info);
        }

        if segments.is_empty() {
            return Err(parse_err(path, "no loadable segments"));
        }

        let entry = usize::try_from(header.entry)
            .map_err(|_| parse_err(path, "entry point overflow"))?;
        log::debug!(
            "parsed {}: entry 0x{:x}, {} loadable segment(s)",
            path.display(),
            entry,
            segments.len()
        );

        Ok(ParsedImage { entry, segments })
    }
}
