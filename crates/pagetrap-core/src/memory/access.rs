//! Privileged read-modify-write primitives on raw emulated memory.
//!
//! Naturally aligned accesses are performed with host atomics so that they
//! stay atomic against concurrent guest threads. Misaligned ones fall back to
//! plain unaligned accesses.

use std::{mem, ptr};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::fault::FaultCode;

/// Integer width that maps onto a host atomic.
trait Word: Copy {
    fn truncate(value: u64) -> Self;
    fn widen(self) -> u64;

    /// # Safety
    /// `ptr` must be valid for reads and writes of `Self`.
    unsafe fn swap(ptr: *mut u8, value: Self) -> Self;

    /// # Safety
    /// `ptr` must be valid for reads and writes of `Self`.
    unsafe fn compare_swap(ptr: *mut u8, expected: Self, new: Self) -> Self;

    /// # Safety
    /// `ptr` must be valid for reads and writes of `Self`.
    unsafe fn update(ptr: *mut u8, f: &mut dyn FnMut(Self) -> Self) -> Self;
}

macro_rules! atomic_word {
    ($int:ty, $atomic:ty) => {
        #[allow(clippy::cast_possible_truncation)]
        impl Word for $int {
            fn truncate(value: u64) -> Self {
                value as $int
            }

            fn widen(self) -> u64 {
                u64::from(self)
            }

            unsafe fn swap(ptr: *mut u8, value: Self) -> Self {
                if ptr.align_offset(mem::align_of::<$int>()) == 0 {
                    // SAFETY: aligned and valid per the caller's contract.
                    unsafe { <$atomic>::from_ptr(ptr.cast()) }.swap(value, Ordering::SeqCst)
                } else {
                    let ptr = ptr.cast::<$int>();
                    // SAFETY: valid per the caller's contract.
                    unsafe {
                        let old = ptr.read_unaligned();
                        ptr.write_unaligned(value);
                        old
                    }
                }
            }

            unsafe fn compare_swap(ptr: *mut u8, expected: Self, new: Self) -> Self {
                if ptr.align_offset(mem::align_of::<$int>()) == 0 {
                    // SAFETY: aligned and valid per the caller's contract.
                    let atomic = unsafe { <$atomic>::from_ptr(ptr.cast()) };
                    match atomic.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                        Ok(old) | Err(old) => old,
                    }
                } else {
                    let ptr = ptr.cast::<$int>();
                    // SAFETY: valid per the caller's contract.
                    unsafe {
                        let old = ptr.read_unaligned();
                        if old == expected {
                            ptr.write_unaligned(new);
                        }
                        old
                    }
                }
            }

            unsafe fn update(ptr: *mut u8, f: &mut dyn FnMut(Self) -> Self) -> Self {
                if ptr.align_offset(mem::align_of::<$int>()) == 0 {
                    // SAFETY: aligned and valid per the caller's contract.
                    let atomic = unsafe { <$atomic>::from_ptr(ptr.cast()) };
                    match atomic.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(f(v))) {
                        Ok(old) | Err(old) => old,
                    }
                } else {
                    let ptr = ptr.cast::<$int>();
                    // SAFETY: valid per the caller's contract.
                    unsafe {
                        let old = ptr.read_unaligned();
                        ptr.write_unaligned(f(old));
                        old
                    }
                }
            }
        }
    };
}

atomic_word!(u8, AtomicU8);
atomic_word!(u16, AtomicU16);
atomic_word!(u32, AtomicU32);
atomic_word!(u64, AtomicU64);

unsafe fn swap_as<W: Word>(ptr: *mut u8, value: u64) -> u64 {
    // SAFETY: forwarded caller contract.
    unsafe { W::swap(ptr, W::truncate(value)) }.widen()
}

unsafe fn compare_swap_as<W: Word>(ptr: *mut u8, expected: u64, new: u64) -> u64 {
    // SAFETY: forwarded caller contract.
    unsafe { W::compare_swap(ptr, W::truncate(expected), W::truncate(new)) }.widen()
}

unsafe fn update_as<W: Word>(ptr: *mut u8, f: &mut dyn FnMut(u64) -> u64) -> u64 {
    let mut narrow = |v: W| W::truncate(f(v.widen()));
    // SAFETY: forwarded caller contract.
    unsafe { W::update(ptr, &mut narrow) }.widen()
}

/// Atomically replaces the `size`-byte value at `ptr`, returning the old value.
///
/// # Safety
///
/// `ptr` must be valid for reads and writes of `size` bytes.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] unless `size` is 1, 2, 4 or 8.
pub unsafe fn exchange(ptr: *mut u8, size: u8, value: u64) -> Result<u64, FaultCode> {
    // SAFETY: forwarded caller contract.
    unsafe {
        match size {
            1 => Ok(swap_as::<u8>(ptr, value)),
            2 => Ok(swap_as::<u16>(ptr, value)),
            4 => Ok(swap_as::<u32>(ptr, value)),
            8 => Ok(swap_as::<u64>(ptr, value)),
            _ => Err(FaultCode::InvalidOperandSize),
        }
    }
}

/// Atomic compare-and-swap; returns the value observed before the operation.
///
/// # Safety
///
/// `ptr` must be valid for reads and writes of `size` bytes.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] unless `size` is 1, 2, 4 or 8.
pub unsafe fn compare_exchange(
    ptr: *mut u8,
    size: u8,
    expected: u64,
    new: u64,
) -> Result<u64, FaultCode> {
    // SAFETY: forwarded caller contract.
    unsafe {
        match size {
            1 => Ok(compare_swap_as::<u8>(ptr, expected, new)),
            2 => Ok(compare_swap_as::<u16>(ptr, expected, new)),
            4 => Ok(compare_swap_as::<u32>(ptr, expected, new)),
            8 => Ok(compare_swap_as::<u64>(ptr, expected, new)),
            _ => Err(FaultCode::InvalidOperandSize),
        }
    }
}

/// Atomically applies `f` to the `size`-byte value at `ptr`; returns the old value.
///
/// `f` receives and returns values zero-extended to 64 bits; the result is
/// truncated to `size` bytes. `f` may run more than once under contention.
///
/// # Safety
///
/// `ptr` must be valid for reads and writes of `size` bytes.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] unless `size` is 1, 2, 4 or 8.
pub unsafe fn fetch_update(
    ptr: *mut u8,
    size: u8,
    mut f: impl FnMut(u64) -> u64,
) -> Result<u64, FaultCode> {
    let f: &mut dyn FnMut(u64) -> u64 = &mut f;
    // SAFETY: forwarded caller contract.
    unsafe {
        match size {
            1 => Ok(update_as::<u8>(ptr, f)),
            2 => Ok(update_as::<u16>(ptr, f)),
            4 => Ok(update_as::<u32>(ptr, f)),
            8 => Ok(update_as::<u64>(ptr, f)),
            _ => Err(FaultCode::InvalidOperandSize),
        }
    }
}

/// Volatile store of the low `size` bytes of `value` in host byte order.
///
/// # Safety
///
/// `ptr` must be valid for writes of `size` bytes.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] unless `size` is 1, 2, 4 or 8.
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn store(ptr: *mut u8, size: u8, value: u64) -> Result<(), FaultCode> {
    let aligned = |align: usize| ptr.align_offset(align) == 0;
    // SAFETY: forwarded caller contract; aligned paths checked above.
    unsafe {
        match size {
            1 => ptr.write_volatile(value as u8),
            2 if aligned(2) => ptr.cast::<u16>().write_volatile(value as u16),
            4 if aligned(4) => ptr.cast::<u32>().write_volatile(value as u32),
            8 if aligned(8) => ptr.cast::<u64>().write_volatile(value),
            2 | 4 | 8 => {
                let bytes = value.to_ne_bytes();
                ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, usize::from(size));
            }
            _ => return Err(FaultCode::InvalidOperandSize),
        }
    }
    Ok(())
}

/// Copies `bytes` to `ptr` in order.
///
/// # Safety
///
/// `ptr` must be valid for writes of `bytes.len()` bytes and must not overlap `bytes`.
pub unsafe fn store_bytes(ptr: *mut u8, bytes: &[u8]) {
    // SAFETY: forwarded caller contract.
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
}

/// Unaligned load of `size` bytes (1, 2, 4 or 8) in host byte order, zero-extended.
///
/// # Safety
///
/// `ptr` must be valid for reads of `size` bytes.
///
/// # Errors
///
/// Returns [`FaultCode::InvalidOperandSize`] unless `size` is 1, 2, 4 or 8.
pub unsafe fn load(ptr: *const u8, size: u8) -> Result<u64, FaultCode> {
    if !matches!(size, 1 | 2 | 4 | 8) {
        return Err(FaultCode::InvalidOperandSize);
    }
    let mut bytes = [0u8; 8];
    // SAFETY: forwarded caller contract; `size <= 8`.
    unsafe { ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), usize::from(size)) };
    Ok(u64::from_ne_bytes(bytes))
}
