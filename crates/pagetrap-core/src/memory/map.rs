//! Emulated window geometry and secondary-processor register-window routing.

/// Span of the emulated address space in bytes.
pub const DEFAULT_WINDOW_SPAN: u64 = 1 << 32;
/// Granularity at which block operations stop and re-fault.
pub const DEFAULT_PAGE_SIZE: u32 = 0x1000;
/// Start of the first secondary-processor slot.
pub const MMIO_BASE: u32 = 0xE000_0000;
/// Size of each secondary-processor slot.
pub const MMIO_SLOT_SIZE: u32 = 0x0010_0000;
/// Offset within a slot where the register sub-range starts.
pub const MMIO_PROBE_OFFSET: u32 = 0x0004_0000;
/// Number of secondary-processor slots.
pub const MMIO_SLOT_COUNT: u32 = 6;

/// Geometry of the per-instance register windows.
///
/// Slot `n` spans `base + n * slot_size` for `slot_size` bytes; only
/// addresses at or past `probe_offset` within a slot are registers, the
/// rest of the slot is ordinary memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MmioLayout {
    /// Start of slot 0.
    pub base: u32,
    /// Size of each slot.
    pub slot_size: u32,
    /// Offset of the register sub-range within a slot.
    pub probe_offset: u32,
    /// Number of slots.
    pub slot_count: u32,
}

impl Default for MmioLayout {
    fn default() -> Self {
        Self {
            base: MMIO_BASE,
            slot_size: MMIO_SLOT_SIZE,
            probe_offset: MMIO_PROBE_OFFSET,
            slot_count: MMIO_SLOT_COUNT,
        }
    }
}

impl MmioLayout {
    /// Total bytes covered by all slots.
    #[must_use]
    pub const fn span(&self) -> u64 {
        self.slot_size as u64 * self.slot_count as u64
    }

    /// Slot index when `address` falls in a register sub-range.
    #[must_use]
    pub const fn slot_of(&self, address: u32) -> Option<u32> {
        if self.slot_size == 0 {
            return None;
        }

        let offset = address.wrapping_sub(self.base);
        if (offset as u64) < self.span() && offset % self.slot_size >= self.probe_offset {
            Some(offset / self.slot_size)
        } else {
            None
        }
    }
}
