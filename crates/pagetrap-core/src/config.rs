use thiserror::Error;

use crate::memory::{MmioLayout, DEFAULT_PAGE_SIZE, DEFAULT_WINDOW_SPAN};

/// Host-configurable engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct EngineConfig {
    /// Per-instance register window geometry.
    pub mmio: MmioLayout,
    /// Block operations stop at multiples of this size and re-fault.
    pub page_size: u32,
    /// Size of the emulated address span; faults past it are host defects.
    pub window_span: u64,
    /// Prints a diagnostic report on stderr before a fatal fault is chained.
    pub report_fatal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mmio: MmioLayout::default(),
            page_size: DEFAULT_PAGE_SIZE,
            window_span: DEFAULT_WINDOW_SPAN,
            report_fatal: true,
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Register window slots must be non-empty.
    #[error("register window slot size must be nonzero")]
    EmptySlot,
    /// Slots must be word aligned so register accesses never straddle two slots.
    #[error("register window slot size {0:#x} is not word aligned")]
    UnalignedSlot(u32),
    /// Register sub-range must start inside its slot.
    #[error("probe offset {probe_offset:#x} lies outside the {slot_size:#x}-byte slot")]
    ProbeOutsideSlot {
        /// Configured probe offset.
        probe_offset: u32,
        /// Configured slot size.
        slot_size: u32,
    },
    /// Page size must be a nonzero power of two.
    #[error("page size {0:#x} is not a power of two")]
    PageSize(u32),
    /// Emulated span must be nonzero and addressable with 32 bits.
    #[error("window span {0:#x} is outside 1..=4 GiB")]
    WindowSpan(u64),
}

impl EngineConfig {
    /// Checks the configuration for values the handler cannot work with.
    ///
    /// # Errors
    ///
    /// Returns the first offending value.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        let MmioLayout {
            slot_size,
            probe_offset,
            ..
        } = self.mmio;

        if slot_size == 0 {
            return Err(ConfigError::EmptySlot);
        }
        if slot_size % 4 != 0 {
            return Err(ConfigError::UnalignedSlot(slot_size));
        }
        if probe_offset >= slot_size {
            return Err(ConfigError::ProbeOutsideSlot {
                probe_offset,
                slot_size,
            });
        }
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if self.window_span == 0 || self.window_span > DEFAULT_WINDOW_SPAN {
            return Err(ConfigError::WindowSpan(self.window_span));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, EngineConfig};
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.page_size, 0x1000);
        assert_eq!(config.window_span, 1 << 32);
    }

    #[rstest]
    #[case(0, 0, ConfigError::EmptySlot)]
    #[case(0x1002, 0, ConfigError::UnalignedSlot(0x1002))]
    #[case(0x1000, 0x1000, ConfigError::ProbeOutsideSlot { probe_offset: 0x1000, slot_size: 0x1000 })]
    fn invalid_slot_geometry_is_rejected(
        #[case] slot_size: u32,
        #[case] probe_offset: u32,
        #[case] expected: ConfigError,
    ) {
        let mut config = EngineConfig::default();
        config.mmio.slot_size = slot_size;
        config.mmio.probe_offset = probe_offset;
        assert_eq!(config.validate(), Err(expected));
    }

    #[test]
    fn page_size_must_be_power_of_two() {
        let config = EngineConfig {
            page_size: 3000,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PageSize(3000)));
    }

    #[test]
    fn window_span_is_bounded_by_32_bits() {
        let config = EngineConfig {
            window_span: (1 << 32) + 1,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::WindowSpan(_))));
        let small = EngineConfig {
            window_span: 0x1_0000,
            ..EngineConfig::default()
        };
        assert_eq!(small.validate(), Ok(()));
    }
}
