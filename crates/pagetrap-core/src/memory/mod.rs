//! Interfaces consumed from the emulated memory subsystem and device instances.

/// Privileged access primitives used by the RAM mutation path.
pub mod access;
/// Emulated window geometry and register-window routing.
pub mod map;

use std::sync::Arc;

pub use map::{
    MmioLayout, DEFAULT_PAGE_SIZE, DEFAULT_WINDOW_SPAN, MMIO_BASE, MMIO_PROBE_OFFSET,
    MMIO_SLOT_COUNT, MMIO_SLOT_SIZE,
};

/// Emulated address space as seen by the fault handler.
///
/// Implementations own a host mapping of the 32-bit emulated window through
/// which guest code accesses memory (`base`) and a second, always-accessible
/// view of the same bytes (`base_priv`).
pub trait GuestMemory: Send + Sync {
    /// Host pointer for `address` in the guest-visible view.
    ///
    /// Guest accesses through this view are the ones that fault. `base(0)`
    /// is the start of the window used to triage host fault addresses.
    fn base(&self, address: u32) -> *mut u8;

    /// Host pointer for `address` in the privileged view, which bypasses
    /// emulated protection.
    ///
    /// The pointer must be valid for reads and writes up to the end of the
    /// configured window, or null when `address` has no backing.
    fn base_priv(&self, address: u32) -> *mut u8;

    /// Runs `mutate` under reservation-consistent ordering for the range
    /// `address..address + size` and returns its result, or `false` when the
    /// access must not be emulated.
    ///
    /// A `size` of zero skips the reservation bound check.
    fn reservation_query(
        &self,
        address: u32,
        size: u32,
        is_write: bool,
        mutate: &mut dyn FnMut() -> bool,
    ) -> bool;
}

impl<M: GuestMemory + ?Sized> GuestMemory for Arc<M> {
    fn base(&self, address: u32) -> *mut u8 {
        (**self).base(address)
    }

    fn base_priv(&self, address: u32) -> *mut u8 {
        (**self).base_priv(address)
    }

    fn reservation_query(
        &self,
        address: u32,
        size: u32,
        is_write: bool,
        mutate: &mut dyn FnMut() -> bool,
    ) -> bool {
        (**self).reservation_query(address, size, is_write, mutate)
    }
}

/// Register interface of one secondary-processor instance.
pub trait RegisterDevice: Send + Sync {
    /// Reads the 32-bit register at `address`; `None` when the read is refused.
    fn read_reg(&self, address: u32) -> Option<u32>;

    /// Writes the 32-bit register at `address`; `false` when the write is refused.
    fn write_reg(&self, address: u32, value: u32) -> bool;
}

/// Lookup of device instances by register-window slot.
pub trait DeviceRegistry: Send + Sync {
    /// Device behind slot `index`, if one is running.
    fn device(&self, index: u32) -> Option<&dyn RegisterDevice>;
}

/// Registry with no devices; every register-window access is unhandled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDevices;

impl DeviceRegistry for NoDevices {
    fn device(&self, _index: u32) -> Option<&dyn RegisterDevice> {
        None
    }
}

impl<D: RegisterDevice> DeviceRegistry for Vec<Option<D>> {
    fn device(&self, index: u32) -> Option<&dyn RegisterDevice> {
        let slot = self.get(usize::try_from(index).ok()?)?;
        slot.as_ref().map(|device| device as &dyn RegisterDevice)
    }
}

/// External hook offered every fault before it is decoded, such as a
/// display command processor watching its own pages.
pub trait AccessHook: Send + Sync {
    /// Returns `true` when the hook fully handled the access.
    fn on_access_violation(&self, address: u32, is_write: bool) -> bool;
}

impl<F> AccessHook for F
where
    F: Fn(u32, bool) -> bool + Send + Sync,
{
    fn on_access_violation(&self, address: u32, is_write: bool) -> bool {
        self(address, is_write)
    }
}
