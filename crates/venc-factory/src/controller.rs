use std::sync::atomic::{AtomicBool, Ordering};

use venc_config::EncodeConfig;

/// Hardware/software selection flag shared between the host and the
/// encoder factory.
///
/// Read on every factory call, so flipping it affects the next encoder
/// created, never one that already exists.
#[derive(Debug, Default)]
pub struct HwController {
    use_hw: AtomicBool,
}

impl HwController {
    #[must_use]
    pub fn new(use_hw: bool) -> Self {
        Self {
            use_hw: AtomicBool::new(use_hw),
        }
    }

    /// Initial selection from the `prefer_hardware` setting.
    #[must_use]
    pub fn from_config(config: &EncodeConfig) -> Self {
        Self::new(config.prefer_hardware)
    }

    pub fn set_use_hw(&self, use_hw: bool) {
        let previous = self.use_hw.swap(use_hw, Ordering::AcqRel);
        if previous != use_hw {
            tracing::info!(use_hw, "Encoder selection changed");
        }
    }

    #[must_use]
    pub fn use_hw(&self) -> bool {
        self.use_hw.load(Ordering::Acquire)
    }
}
