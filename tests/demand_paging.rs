//! End-to-end demand paging tests.
//!
//! These drive the real fault path: segments point into reserved
//! (PROT_NONE) address ranges, the probe starter touches them, and the
//! SIGSEGV handler materializes pages from a scratch file. Signal
//! dispositions and the published image slot are process-wide, so every
//! test runs under one mutex and fully tears down before releasing it.

use std::convert::Infallible;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use lazyrun::image::{ImageParser, LoadedImage, ParsedImage, SegmentInfo};
use lazyrun::mm::mmap::{self, MapError, ProtFlags};
use lazyrun::mm::tracker::PageState;
use lazyrun::start::ProgramStarter;
use lazyrun::{Loader, LoaderError, Result};

fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_scratch(name: &str, bytes: &[u8]) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("lazyrun-test-{}-{}", std::process::id(), name));
    let mut file = File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    path
}

/// Reserve an inaccessible address range; any access faults.
fn reserve(len: usize) -> usize {
    mmap::map_anon(len, ProtFlags::empty()).unwrap() as usize
}

fn read_at(addr: usize) -> u8 {
    // SAFETY: the demand-paging handler under test materializes the page
    // (or the rescue handler maps one) before the load completes.
    unsafe { core::ptr::read_volatile(addr as *const u8) }
}

fn write_at(addr: usize, value: u8) {
    // SAFETY: as for read_at.
    unsafe { core::ptr::write_volatile(addr as *mut u8, value) }
}

struct FixedParser {
    image: ParsedImage,
}

impl ImageParser for FixedParser {
    fn parse(&self, _path: &Path) -> Result<ParsedImage> {
        Ok(self.image.clone())
    }
}

type Probe = Box<dyn Fn(&LoadedImage<'_>) + Send + Sync>;

/// Starter that pokes at the published segments instead of jumping.
struct ProbeStarter {
    probe: Probe,
}

impl ProgramStarter for ProbeStarter {
    fn start(&self, image: &LoadedImage<'_>, _argv: &[String]) -> Result<Infallible> {
        (self.probe)(image);
        Err(LoaderError::Start {
            reason: "probe finished",
        })
    }
}

/// Full lifecycle: init, execute with a probe, implicit teardown.
fn run_probe(file_path: &Path, image: ParsedImage, probe: Probe) {
    let loader = Loader::new(
        Box::new(FixedParser { image }),
        Box::new(ProbeStarter { probe }),
    );
    loader.init().unwrap();
    let err = loader.execute(file_path, &[]).unwrap_err();
    assert_eq!(
        err,
        LoaderError::Start {
            reason: "probe finished"
        }
    );
}

#[test]
fn scenario_a_one_page_file_content_and_zero_tail() {
    let _guard = serial();
    let psz = page_size();
    let content = pattern(100);
    let path = write_scratch("scenario-a", &content);
    let region = reserve(psz);

    let image = ParsedImage {
        entry: region,
        segments: vec![SegmentInfo {
            vaddr: region,
            file_offset: 0,
            file_size: 100,
            mem_size: psz,
            prot: ProtFlags::READ | ProtFlags::WRITE,
        }],
    };

    run_probe(
        &path,
        image,
        Box::new(move |img| {
            // First access materializes the page.
            for (i, expected) in content.iter().enumerate() {
                assert_eq!(read_at(region + i), *expected);
            }
            // The tail past file_size reads as zero.
            for i in 100..psz {
                assert_eq!(read_at(region + i), 0);
            }
            assert_eq!(img.segments[0].pages.state(0), PageState::Mapped);

            // Idempotence: a write sticks, so later reads cannot have
            // re-entered the materialization path.
            write_at(region, 0xab);
            assert_eq!(read_at(region), 0xab);
            assert_eq!(read_at(region + 50), 50 % 251);
        }),
    );

    std::fs::remove_file(path).unwrap();
}

#[test]
fn boundary_page_zeroed_after_file_size_and_tail_pages_all_zero() {
    let _guard = serial();
    let psz = page_size();
    let file_size = psz + 100;
    let content = pattern(file_size);
    let path = write_scratch("boundary", &content);
    let region = reserve(3 * psz);

    let image = ParsedImage {
        entry: region,
        segments: vec![SegmentInfo {
            vaddr: region,
            file_offset: 0,
            file_size,
            mem_size: 3 * psz,
            prot: ProtFlags::READ | ProtFlags::WRITE,
        }],
    };

    let expected = content.clone();
    run_probe(
        &path,
        image,
        Box::new(move |img| {
            let pages = &img.segments[0].pages;

            // Touch only the straddling page; its neighbors stay unmapped.
            assert_eq!(read_at(region + psz), expected[psz]);
            assert_eq!(pages.state(1), PageState::Mapped);
            assert_eq!(pages.state(0), PageState::Unmapped);
            assert_eq!(pages.state(2), PageState::Unmapped);

            // File bytes before the boundary, zeros after, same page.
            for i in 0..100 {
                assert_eq!(read_at(region + psz + i), expected[psz + i]);
            }
            for i in 100..psz {
                assert_eq!(read_at(region + psz + i), 0);
            }

            // A page entirely beyond file_size is fully zero.
            for i in (0..psz).step_by(64) {
                assert_eq!(read_at(region + 2 * psz + i), 0);
            }
            // And the fully file-backed page is untouched by the zeroing.
            for i in (0..psz).step_by(64) {
                assert_eq!(read_at(region + i), expected[i]);
            }
            assert_eq!(pages.mapped_indices().count(), 3);
        }),
    );

    std::fs::remove_file(path).unwrap();
}

static RESCUES: AtomicUsize = AtomicUsize::new(0);

/// Stand-in for a program's own SIGSEGV handler: recovers by mapping an
/// anonymous writable page over the faulting address.
extern "C" fn rescue_handler(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // SAFETY: kernel-provided siginfo for a SA_SIGINFO handler.
    let addr = unsafe { (*info).si_addr() } as usize;
    let psz = page_size();
    let page = lazyrun::mm::page_floor(addr, psz);
    // SAFETY: overlaying the faulting page makes the retried access succeed.
    unsafe {
        libc::mmap(
            page as *mut libc::c_void,
            psz,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        );
    }
    RESCUES.fetch_add(1, Ordering::SeqCst);
}

fn install_rescue() -> libc::sigaction {
    // SAFETY: standard sigaction construction; the previous disposition is
    // returned so the test can restore it.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_flags = libc::SA_SIGINFO;
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            rescue_handler;
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        let mut old: libc::sigaction = std::mem::zeroed();
        libc::sigaction(libc::SIGSEGV, &action, &mut old);
        old
    }
}

#[test]
fn scenario_b_unowned_faults_forward_to_prior_disposition() {
    let _guard = serial();
    RESCUES.store(0, Ordering::SeqCst);
    let saved = install_rescue();

    let psz = page_size();
    let content = pattern(psz);
    let path = write_scratch("forwarding", &content);
    let region_a = reserve(psz); // read-only segment
    let region_c = reserve(psz); // second segment, never touched
    let region_b = reserve(psz); // not a segment

    let image = ParsedImage {
        entry: region_a,
        segments: vec![
            SegmentInfo {
                vaddr: region_a,
                file_offset: 0,
                file_size: psz,
                mem_size: psz,
                prot: ProtFlags::READ,
            },
            SegmentInfo {
                vaddr: region_c,
                file_offset: 0,
                file_size: psz,
                mem_size: psz,
                prot: ProtFlags::READ,
            },
        ],
    };

    let expected0 = content[0];
    run_probe(
        &path,
        image,
        Box::new(move |img| {
            // A fault outside both segments reaches the prior handler and
            // mutates neither tracker.
            assert_eq!(read_at(region_b), 0);
            assert_eq!(RESCUES.load(Ordering::SeqCst), 1);
            assert_eq!(img.segments[0].pages.state(0), PageState::Unmapped);
            assert_eq!(img.segments[1].pages.state(0), PageState::Unmapped);

            // Materializing the read-only page is handled by the loader,
            // not the prior handler.
            assert_eq!(read_at(region_a), expected0);
            assert_eq!(img.segments[0].pages.state(0), PageState::Mapped);
            assert_eq!(RESCUES.load(Ordering::SeqCst), 1);

            // A write to the mapped read-only page is a genuine protection
            // violation and forwards too.
            write_at(region_a, 0x7f);
            assert_eq!(RESCUES.load(Ordering::SeqCst), 2);
            assert_eq!(read_at(region_a), 0x7f);
        }),
    );

    // Teardown restored the rescue disposition; put the original back.
    // SAFETY: restoring a disposition previously returned by sigaction.
    unsafe {
        libc::sigaction(libc::SIGSEGV, &saved, core::ptr::null_mut());
    }
    mmap::unmap(region_b, psz).unwrap();
    mmap::unmap(region_c, psz).unwrap();
    std::fs::remove_file(path).unwrap();
}

#[test]
fn scenario_c_mapping_failure_exits_with_out_of_memory_status() {
    if std::env::var("LAZYRUN_FATAL_CHILD").is_ok() {
        let _guard = serial();
        let psz = page_size();
        let content = pattern(psz);
        let path = write_scratch("fatal", &content);
        let region = reserve(psz);

        // A misaligned file offset makes the lazy mmap fail with EINVAL,
        // which the handler treats like any mapping failure: fatal.
        let image = ParsedImage {
            entry: region,
            segments: vec![SegmentInfo {
                vaddr: region,
                file_offset: 3,
                file_size: psz,
                mem_size: psz,
                prot: ProtFlags::READ,
            }],
        };

        run_probe(
            &path,
            image,
            Box::new(move |_img| {
                let _ = read_at(region);
                unreachable!("survived a failed lazy mapping");
            }),
        );
        return;
    }

    let exe = std::env::current_exe().unwrap();
    let output = std::process::Command::new(exe)
        .args([
            "scenario_c_mapping_failure_exits_with_out_of_memory_status",
            "--exact",
        ])
        .env("LAZYRUN_FATAL_CHILD", "1")
        .output()
        .unwrap();

    // _exit(-ENOMEM) surfaces as 256 - 12.
    assert_eq!(output.status.code(), Some(244));
}

#[test]
fn teardown_unmaps_materialized_pages() {
    let _guard = serial();
    let psz = page_size();
    let content = pattern(2 * psz);
    let path = write_scratch("teardown", &content);
    let region = reserve(2 * psz);

    let image = ParsedImage {
        entry: region,
        segments: vec![SegmentInfo {
            vaddr: region,
            file_offset: 0,
            file_size: 2 * psz,
            mem_size: 2 * psz,
            prot: ProtFlags::READ,
        }],
    };

    let expected = content.clone();
    run_probe(
        &path,
        image,
        Box::new(move |_img| {
            assert_eq!(read_at(region), expected[0]);
            assert_eq!(read_at(region + psz), expected[psz]);
        }),
    );

    // Both pages are gone: mprotect on an unmapped range reports ENOMEM.
    assert_eq!(
        mmap::protect(region, psz, ProtFlags::READ),
        Err(MapError(libc::ENOMEM))
    );
    assert_eq!(
        mmap::protect(region + psz, psz, ProtFlags::READ),
        Err(MapError(libc::ENOMEM))
    );

    std::fs::remove_file(path).unwrap();
}

#[test]
fn loader_is_reusable_after_teardown() {
    let _guard = serial();
    let psz = page_size();
    let content = pattern(psz);
    let path = write_scratch("reuse", &content);

    for round in 0..2 {
        let region = reserve(psz);
        let image = ParsedImage {
            entry: region,
            segments: vec![SegmentInfo {
                vaddr: region,
                file_offset: 0,
                file_size: psz,
                mem_size: psz,
                prot: ProtFlags::READ,
            }],
        };
        let expected = content[round];
        run_probe(
            &path,
            image,
            Box::new(move |_img| {
                assert_eq!(read_at(region + round), expected);
            }),
        );
    }

    std::fs::remove_file(path).unwrap();
}

#[test]
fn execute_requires_init() {
    let _guard = serial();
    let psz = page_size();
    let path = write_scratch("no-init", &pattern(16));

    let loader = Loader::new(
        Box::new(FixedParser {
            image: ParsedImage {
                entry: 0,
                segments: vec![SegmentInfo {
                    vaddr: 0x1000,
                    file_offset: 0,
                    file_size: 16,
                    mem_size: psz,
                    prot: ProtFlags::READ,
                }],
            },
        }),
        Box::new(ProbeStarter {
            probe: Box::new(|_| panic!("starter must not run")),
        }),
    );

    let err = loader.execute(&path, &[]).unwrap_err();
    assert_eq!(
        err,
        LoaderError::NotInitialized {
            subsystem: "fault handler"
        }
    );

    std::fs::remove_file(path).unwrap();
}

#[test]
fn double_init_is_rejected() {
    let _guard = serial();
    let loader = Loader::new(
        Box::new(FixedParser {
            image: ParsedImage {
                entry: 0,
                segments: Vec::new(),
            },
        }),
        Box::new(ProbeStarter {
            probe: Box::new(|_| {}),
        }),
    );

    loader.init().unwrap();
    assert_eq!(loader.init().unwrap_err(), LoaderError::AlreadyActive);
    loader.teardown();

    // A fresh install works after teardown.
    loader.init().unwrap();
    loader.teardown();
}

#[test]
fn open_and_parse_failures_abort_before_any_mapping() {
    let _guard = serial();
    let loader = Loader::new(
        Box::new(FixedParser {
            image: ParsedImage {
                entry: 0,
                segments: Vec::new(),
            },
        }),
        Box::new(ProbeStarter {
            probe: Box::new(|_| panic!("starter must not run")),
        }),
    );
    loader.init().unwrap();

    let missing = PathBuf::from("/nonexistent/lazyrun-image");
    match loader.execute(&missing, &[]).unwrap_err() {
        LoaderError::Open { path, errno } => {
            assert_eq!(path, missing);
            assert_eq!(errno, libc::ENOENT);
        }
        other => panic!("expected Open error, got {other}"),
    }

    // An empty descriptor is a parse failure.
    let path = write_scratch("empty-descriptor", b"not parsed");
    match loader.execute(&path, &[]).unwrap_err() {
        LoaderError::Parse { reason, .. } => assert_eq!(reason, "empty segment list"),
        other => panic!("expected Parse error, got {other}"),
    }

    loader.teardown();
    std::fs::remove_file(path).unwrap();
}
