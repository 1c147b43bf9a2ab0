//! Fault emulation against an in-process window with a register device.

use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
use libc as _;
use pagetrap_core::context::flags::{CF, OF, PF, SF, ZF};
use pagetrap_core::context::{RAX, RCX, RDI, RSI};
use pagetrap_core::{
    DeviceRegistry, EngineConfig, FaultCode, GuestMemory, MmioLayout, RegisterDevice,
    RegisterSnapshot, ViolationHandler,
};
use proptest as _;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;

const WINDOW: usize = 0x3000;
const SLOT_SIZE: u32 = 0x800;
const PROBE: u32 = 0x400;
const MMIO_BASE: u32 = 0x2000;

/// Three pages of emulated memory, with the same view for guest and
/// privileged accesses.
struct Window {
    bytes: Box<[UnsafeCell<u8>]>,
    queries: Mutex<Vec<(u32, u32, bool)>>,
}

// SAFETY: tests access the bytes from one thread at a time.
unsafe impl Sync for Window {}

impl Window {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: (0..WINDOW).map(|_| UnsafeCell::new(0)).collect(),
            queries: Mutex::new(Vec::new()),
        })
    }

    fn read(&self, address: u32, len: usize) -> Vec<u8> {
        let start = address as usize;
        // SAFETY: no emulation runs concurrently with the test body.
        (start..start + len)
            .map(|i| unsafe { *self.bytes[i].get() })
            .collect()
    }

    fn write(&self, address: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            // SAFETY: see `read`.
            unsafe { *self.bytes[address as usize + i].get() = byte };
        }
    }

    fn read_u32(&self, address: u32) -> u32 {
        let bytes = self.read(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn last_query(&self) -> Option<(u32, u32, bool)> {
        self.queries.lock().unwrap().last().copied()
    }
}

impl GuestMemory for Window {
    fn base(&self, address: u32) -> *mut u8 {
        self.bytes
            .as_ptr()
            .cast::<u8>()
            .cast_mut()
            .wrapping_add(address as usize)
    }

    fn base_priv(&self, address: u32) -> *mut u8 {
        self.base(address)
    }

    fn reservation_query(
        &self,
        address: u32,
        size: u32,
        is_write: bool,
        mutate: &mut dyn FnMut() -> bool,
    ) -> bool {
        self.queries.lock().unwrap().push((address, size, is_write));
        mutate()
    }
}

/// Register file of the single device in slot 1.
#[derive(Default)]
struct Registers {
    value: u32,
    written: Mutex<Vec<(u32, u32)>>,
}

impl RegisterDevice for Registers {
    fn read_reg(&self, _address: u32) -> Option<u32> {
        Some(self.value)
    }

    fn write_reg(&self, address: u32, value: u32) -> bool {
        self.written.lock().unwrap().push((address, value));
        true
    }
}

struct SlotOne(Arc<Registers>);

impl DeviceRegistry for SlotOne {
    fn device(&self, index: u32) -> Option<&dyn RegisterDevice> {
        (index == 1).then(|| &*self.0 as &dyn RegisterDevice)
    }
}

struct Fixture {
    handler: ViolationHandler,
    window: Arc<Window>,
    device: Arc<Registers>,
}

fn fixture() -> Fixture {
    let config = EngineConfig {
        mmio: MmioLayout {
            base: MMIO_BASE,
            slot_size: SLOT_SIZE,
            probe_offset: PROBE,
            slot_count: 2,
        },
        window_span: WINDOW as u64,
        ..EngineConfig::default()
    };
    let window = Window::new();
    let device = Arc::new(Registers {
        value: 0x1122_3344,
        ..Registers::default()
    });
    let handler = ViolationHandler::new(config, Arc::clone(&window))
        .expect("valid config")
        .with_devices(SlotOne(Arc::clone(&device)));
    Fixture {
        handler,
        window,
        device,
    }
}

fn at(code: &[u8]) -> RegisterSnapshot {
    RegisterSnapshot::at_instruction(0x40_0000, code)
}

#[test]
fn cmpxchg_with_identical_replacement_reserves_nothing() {
    let fx = fixture();
    fx.window.write(0x100, &5u32.to_le_bytes());
    // lock cmpxchg [rdx], ecx
    let mut ctx = at(&[0xF0, 0x0F, 0xB1, 0x0A]);
    ctx.gprs[usize::from(RAX)] = 5;
    ctx.gprs[usize::from(RCX)] = 5;

    assert!(fx.handler.handle(0x100, true, &mut ctx));
    assert_eq!(fx.window.last_query(), Some((0x100, 0, true)));
    assert_eq!(fx.window.read_u32(0x100), 5);
    assert_ne!(ctx.rflags & ZF, 0);
    assert_eq!(ctx.rip, 0x40_0004);
}

#[test]
fn cmpxchg_mismatch_loads_the_accumulator() {
    let fx = fixture();
    fx.window.write(0x100, &7u32.to_le_bytes());
    let mut ctx = at(&[0xF0, 0x0F, 0xB1, 0x0A]);
    ctx.gprs[usize::from(RAX)] = 5;
    ctx.gprs[usize::from(RCX)] = 9;

    assert!(fx.handler.handle(0x100, true, &mut ctx));
    assert_eq!(fx.window.last_query(), Some((0x100, 4, true)));
    assert_eq!(fx.window.read_u32(0x100), 7);
    assert_eq!(ctx.gprs[usize::from(RAX)], 7);
    assert_eq!(ctx.rflags & ZF, 0);
}

#[test]
fn register_reads_are_byte_swapped() {
    let fx = fixture();
    let address = MMIO_BASE + SLOT_SIZE + PROBE;
    // mov eax, [rdi]
    let mut ctx = at(&[0x8B, 0x07]);

    assert_eq!(fx.handler.try_handle(address, false, &mut ctx), Ok(()));
    assert_eq!(ctx.gprs[usize::from(RAX)], 0x4433_2211);
    assert_eq!(ctx.rip, 0x40_0002);
    assert!(fx.window.last_query().is_none());
}

#[test]
fn big_endian_register_reads_skip_the_swap() {
    let fx = fixture();
    let address = MMIO_BASE + SLOT_SIZE + PROBE + 8;
    // movbe eax, [rdi]
    let mut ctx = at(&[0x0F, 0x38, 0xF0, 0x07]);

    assert_eq!(fx.handler.try_handle(address, false, &mut ctx), Ok(()));
    assert_eq!(ctx.gprs[usize::from(RAX)], 0x1122_3344);
}

#[test]
fn register_writes_reach_the_device() {
    let fx = fixture();
    let address = MMIO_BASE + SLOT_SIZE + PROBE + 0x10;
    // mov [rdi], ecx
    let mut ctx = at(&[0x89, 0x0F]);
    ctx.gprs[usize::from(RCX)] = 0xAABB_CCDD;

    assert_eq!(fx.handler.try_handle(address, true, &mut ctx), Ok(()));
    assert_eq!(*fx.device.written.lock().unwrap(), [(address, 0xDDCC_BBAA)]);
}

#[test]
fn register_compare_sets_flags() {
    let fx = fixture();
    let address = MMIO_BASE + SLOT_SIZE + PROBE;
    // cmp dword [rdi], 0x44332211
    let mut ctx = at(&[0x81, 0x3F, 0x11, 0x22, 0x33, 0x44]);

    assert_eq!(fx.handler.try_handle(address, false, &mut ctx), Ok(()));
    assert_ne!(ctx.rflags & ZF, 0);
    assert_eq!(ctx.rip, 0x40_0006);
}

#[test]
fn slot_memory_below_the_register_range_is_ram() {
    let fx = fixture();
    let address = MMIO_BASE + SLOT_SIZE + 0x10;
    let mut ctx = at(&[0x89, 0x0F]);
    ctx.gprs[usize::from(RCX)] = 0x0102_0304;

    assert_eq!(fx.handler.try_handle(address, true, &mut ctx), Ok(()));
    assert_eq!(fx.window.read_u32(address), 0x0102_0304);
    assert!(fx.device.written.lock().unwrap().is_empty());
}

#[rstest]
#[case::empty_slot(MMIO_BASE + PROBE, &[0x89, 0x0F], FaultCode::UnmappedDevice)]
#[case::word_access(MMIO_BASE + SLOT_SIZE + PROBE, &[0x66, 0x89, 0x0F], FaultCode::DeviceAccessRejected)]
#[case::exchange(MMIO_BASE + SLOT_SIZE + PROBE, &[0x87, 0x07], FaultCode::DeviceAccessRejected)]
#[case::past_span(WINDOW as u32 - 2, &[0x89, 0x0F], FaultCode::AccessRangeOverflow)]
#[case::undecodable(0x100, &[0x0F, 0x0B], FaultCode::UnsupportedInstruction)]
fn rejected_accesses(#[case] address: u32, #[case] code: &[u8], #[case] expected: FaultCode) {
    let fx = fixture();
    let mut ctx = at(code);
    assert_eq!(fx.handler.try_handle(address, true, &mut ctx), Err(expected));
    assert!(!fx.handler.handle(address, true, &mut ctx));
}

#[test]
fn repeated_store_stops_at_the_page_boundary() {
    let fx = fixture();
    let address = 0x1000 - 8;
    // rep stosd
    let mut ctx = at(&[0xF3, 0xAB]);
    ctx.gprs[usize::from(RCX)] = 5;
    ctx.gprs[usize::from(RAX)] = 0xDEAD_BEEF;
    ctx.gprs[usize::from(RDI)] = fx.window.base(address) as u64;

    assert_eq!(fx.handler.try_handle(address, true, &mut ctx), Ok(()));
    assert_eq!(fx.window.last_query(), Some((address, 20, true)));
    assert_eq!(fx.window.read_u32(address), 0xDEAD_BEEF);
    assert_eq!(fx.window.read_u32(address + 4), 0xDEAD_BEEF);
    assert_eq!(fx.window.read_u32(0x1000), 0);
    assert_eq!(ctx.gprs[usize::from(RCX)], 3);
    assert_eq!(ctx.gprs[usize::from(RDI)], fx.window.base(0x1000) as u64);
    assert_eq!(ctx.rip, 0x40_0000);
}

#[test]
fn repeated_move_copies_through_the_privileged_view() {
    let fx = fixture();
    fx.window.write(0x600, &[1, 2, 3, 4, 5, 6, 7, 8]);
    // rep movsd
    let mut ctx = at(&[0xF3, 0xA5]);
    ctx.gprs[usize::from(RCX)] = 2;
    ctx.gprs[usize::from(RSI)] = fx.window.base(0x600) as u64;
    ctx.gprs[usize::from(RDI)] = fx.window.base(0x700) as u64;

    assert_eq!(fx.handler.try_handle(0x700, true, &mut ctx), Ok(()));
    assert_eq!(fx.window.last_query(), Some((0x700, 8, true)));
    assert_eq!(fx.window.read(0x700, 8), [1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(ctx.gprs[usize::from(RCX)], 0);
    assert_eq!(ctx.gprs[usize::from(RSI)], fx.window.base(0x608) as u64);
    assert_eq!(ctx.gprs[usize::from(RDI)], fx.window.base(0x708) as u64);
    assert_eq!(ctx.rip, 0x40_0002);
}

#[test]
fn repeated_move_stops_at_the_page_boundary() {
    let fx = fixture();
    fx.window.write(0x600, &0x0A0B_0C0Du32.to_le_bytes());
    fx.window.write(0x604, &0x1111_1111u32.to_le_bytes());
    let mut ctx = at(&[0xF3, 0xA5]);
    ctx.gprs[usize::from(RCX)] = 3;
    ctx.gprs[usize::from(RSI)] = fx.window.base(0x600) as u64;
    ctx.gprs[usize::from(RDI)] = fx.window.base(0xFFC) as u64;

    assert_eq!(fx.handler.try_handle(0xFFC, true, &mut ctx), Ok(()));
    assert_eq!(fx.window.read_u32(0xFFC), 0x0A0B_0C0D);
    assert_eq!(fx.window.read_u32(0x1000), 0);
    assert_eq!(ctx.gprs[usize::from(RCX)], 2);
    assert_eq!(ctx.gprs[usize::from(RSI)], fx.window.base(0x604) as u64);
    assert_eq!(ctx.gprs[usize::from(RDI)], fx.window.base(0x1000) as u64);
    assert_eq!(ctx.rip, 0x40_0000);
}

#[test]
fn block_store_destination_must_match_the_fault() {
    let fx = fixture();
    let mut ctx = at(&[0xF3, 0xAB]);
    ctx.gprs[usize::from(RCX)] = 1;
    ctx.gprs[usize::from(RDI)] = fx.window.base(0x200) as u64;

    assert_eq!(
        fx.handler.try_handle(0x100, true, &mut ctx),
        Err(FaultCode::BlockPointerMismatch)
    );
}

#[test]
fn vector_store_writes_sixteen_bytes() {
    let fx = fixture();
    // movdqu [rdi], xmm3
    let mut ctx = at(&[0xF3, 0x0F, 0x7F, 0x1F]);
    ctx.vectors[3] = 0x0F0E_0D0C_0B0A_0908_0706_0504_0302_0100;

    assert_eq!(fx.handler.try_handle(0x200, true, &mut ctx), Ok(()));
    assert_eq!(fx.window.read(0x200, 16), (0u8..16).collect::<Vec<_>>());
}

#[test]
fn set_on_condition_stores_a_boolean() {
    let fx = fixture();
    fx.window.write(0x300, &[0xFF]);
    // sete [rdi]
    let mut ctx = at(&[0x0F, 0x94, 0x07]);
    ctx.rflags = ZF;

    assert_eq!(fx.handler.try_handle(0x300, true, &mut ctx), Ok(()));
    assert_eq!(fx.window.read(0x300, 1), [1]);
}

#[test]
fn exchange_swaps_register_and_memory() {
    let fx = fixture();
    fx.window.write(0x400, &0x10u32.to_le_bytes());
    // xchg [rdi], eax
    let mut ctx = at(&[0x87, 0x07]);
    ctx.gprs[usize::from(RAX)] = 0x20;

    assert_eq!(fx.handler.try_handle(0x400, true, &mut ctx), Ok(()));
    assert_eq!(fx.window.read_u32(0x400), 0x20);
    assert_eq!(ctx.gprs[usize::from(RAX)], 0x10);
}

#[test]
fn subtract_with_borrow_updates_carry() {
    let fx = fixture();
    fx.window.write(0x500, &0u32.to_le_bytes());
    // sbb dword [rdi], 1
    let mut ctx = at(&[0x83, 0x1F, 0x01]);
    ctx.rflags = CF;

    assert_eq!(fx.handler.try_handle(0x500, true, &mut ctx), Ok(()));
    assert_eq!(fx.window.read_u32(0x500), 0xFFFF_FFFE);
    assert_ne!(ctx.rflags & CF, 0);
    assert_eq!(ctx.rip, 0x40_0003);
}

#[rstest]
// and dword [rdi], 0x0f
#[case::and(&[0x83, 0x27, 0x0F], 0xF0, 0, CF | OF, 0, ZF | PF, CF | OF | SF)]
// or [rdi], ecx
#[case::or(&[0x09, 0x0F], 0x10, 1, 0, 0x11, PF, ZF | SF | CF)]
// xor [rdi], ecx
#[case::xor(&[0x31, 0x0F], 0x55, 0x55, CF, 0, ZF | PF, CF | SF)]
// inc dword [rdi]
#[case::inc(&[0xFF, 0x07], 0x7FFF_FFFF, 0, CF, 0x8000_0000, CF | OF | SF, ZF)]
// dec dword [rdi]
#[case::dec(&[0xFF, 0x0F], 1, 0, CF, 0, ZF | PF | CF, OF | SF)]
fn read_modify_write_updates_memory_and_flags(
    #[case] code: &[u8],
    #[case] initial: u32,
    #[case] ecx: u64,
    #[case] flags_in: u64,
    #[case] expected: u32,
    #[case] set: u64,
    #[case] clear: u64,
) {
    let fx = fixture();
    fx.window.write(0x800, &initial.to_le_bytes());
    let mut ctx = at(code);
    ctx.gprs[usize::from(RCX)] = ecx;
    ctx.rflags = flags_in;

    assert_eq!(fx.handler.try_handle(0x800, true, &mut ctx), Ok(()));
    assert_eq!(fx.window.read_u32(0x800), expected);
    assert_eq!(ctx.rflags & set, set, "flags {:#x}", ctx.rflags);
    assert_eq!(ctx.rflags & clear, 0, "flags {:#x}", ctx.rflags);
    assert_eq!(ctx.rip, 0x40_0000 + code.len() as u64);
}
