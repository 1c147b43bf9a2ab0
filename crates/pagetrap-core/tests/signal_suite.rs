//! End-to-end fault handling through the installed `SIGSEGV` hook.

use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod linux {
    use std::ptr;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, OnceLock};

    use pagetrap_core::entry::{fault_count, redirect_in_flight};
    use pagetrap_core::thread::interrupted_context;
    use pagetrap_core::{
        catch_guest_fault, install, AccessCause, EngineConfig, GuestMemory, TaskFailure,
        ThreadCtrl, ThreadError, ViolationHandler,
    };

    const SPAN: usize = 0x1_0000;

    /// Inaccessible guest view backed by a separate writable privileged view.
    struct Mapped {
        guest: usize,
        private: usize,
    }

    impl GuestMemory for Mapped {
        fn base(&self, address: u32) -> *mut u8 {
            (self.guest + address as usize) as *mut u8
        }

        fn base_priv(&self, address: u32) -> *mut u8 {
            (self.private + address as usize) as *mut u8
        }

        fn reservation_query(
            &self,
            _address: u32,
            _size: u32,
            _is_write: bool,
            mutate: &mut dyn FnMut() -> bool,
        ) -> bool {
            mutate()
        }
    }

    fn map(protection: libc::c_int) -> usize {
        // SAFETY: anonymous private mapping with no address hint.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                SPAN,
                protection,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(raw, libc::MAP_FAILED, "mmap failed");
        raw as usize
    }

    fn engine() -> &'static ViolationHandler {
        static ENGINE: OnceLock<&'static ViolationHandler> = OnceLock::new();
        ENGINE.get_or_init(|| {
            let memory = Mapped {
                guest: map(libc::PROT_NONE),
                private: map(libc::PROT_READ | libc::PROT_WRITE),
            };
            let config = EngineConfig {
                window_span: SPAN as u64,
                ..EngineConfig::default()
            };
            let handler = ViolationHandler::new(config, memory).expect("valid config");
            install(handler).expect("first install")
        })
    }

    fn guest(offset: u32) -> usize {
        engine().memory().base(offset) as usize
    }

    fn private(offset: u32) -> *mut u32 {
        engine().memory().base_priv(offset).cast()
    }

    #[inline(never)]
    fn read_guest(address: usize) -> u32 {
        // SAFETY: the address lies in the window; the fault is expected.
        unsafe { (address as *const u32).read_volatile() }
    }

    #[inline(never)]
    fn write_guest(address: usize, value: u32) {
        // SAFETY: see `read_guest`.
        unsafe { (address as *mut u32).write_volatile(value) }
    }

    #[test]
    fn managed_writes_are_emulated() {
        let target = guest(0x10);
        let ctrl = ThreadCtrl::spawn("writer", move || {
            write_guest(target, 0xCAFE_BABE);
            Ok::<(), String>(())
        })
        .expect("spawn");
        assert_eq!(ctrl.join(), Ok(()));
        // SAFETY: the privileged view is readable and nothing else writes offset 0x10.
        assert_eq!(unsafe { private(0x10).read_volatile() }, 0xCAFE_BABE);
    }

    #[test]
    fn unmanaged_reads_raise_guest_faults() {
        let target = guest(0x40);
        let before = fault_count();

        let caught = catch_guest_fault(|| read_guest(target));

        let violation = caught.expect_err("read must fault");
        assert_eq!(violation.address, 0x40);
        assert_eq!(violation.cause, AccessCause::Reading);
        assert_ne!(violation.host_rip, 0);
        assert_eq!(fault_count(), before + 1);
        assert!(!redirect_in_flight());
    }

    #[test]
    fn uncaught_guest_faults_fail_the_thread() {
        let target = guest(0x80);
        let ctrl = ThreadCtrl::spawn("reader", move || {
            read_guest(target);
            Ok::<(), String>(())
        })
        .expect("spawn");

        match ctrl.join() {
            Err(ThreadError::Task(failure)) => match *failure {
                TaskFailure::GuestFault(violation) => {
                    assert_eq!(violation.address, 0x80);
                    assert_eq!(violation.cause, AccessCause::Reading);
                }
                ref other => panic!("unexpected failure {other:?}"),
            },
            other => panic!("unexpected join result {other:?}"),
        }
    }

    static INTERRUPTED_RIP: AtomicU64 = AtomicU64::new(0);

    fn record_interrupted_rip() {
        let rip = interrupted_context().map_or(0, |snapshot| snapshot.rip);
        INTERRUPTED_RIP.store(rip, Ordering::SeqCst);
    }

    #[test]
    fn interrupt_handler_sees_the_interrupted_registers() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let ctrl = ThreadCtrl::spawn("interrupted", move || {
            while !flag.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            Ok::<(), String>(())
        })
        .expect("spawn");

        assert_eq!(ctrl.interrupt(record_interrupted_rip), Ok(()));
        assert_ne!(INTERRUPTED_RIP.load(Ordering::SeqCst), 0);

        stop.store(true, Ordering::Release);
        assert_eq!(ctrl.join(), Ok(()));
    }

    #[test]
    fn second_install_is_rejected() {
        let _ = engine();
        let config = EngineConfig {
            window_span: SPAN as u64,
            ..EngineConfig::default()
        };
        let memory = Mapped {
            guest: 0,
            private: 0,
        };
        let handler = ViolationHandler::new(config, memory).expect("valid config");
        assert_eq!(
            install(handler).map(|_| ()),
            Err(pagetrap_core::InstallError::AlreadyInstalled)
        );
    }
}
