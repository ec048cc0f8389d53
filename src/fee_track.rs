//! Local admission fee with proportional raise/lower steps.
use crate::config::FeeConfig;
use crate::feedback::{FeeChangeListener, FeeTracker};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct FeeState {
    local_fee: u64,
    /// Consecutive raise requests since the last lower.
    raise_count: u32,
}

/// Reference [`FeeTracker`]: raises by `fee / increase_fraction` once enough
/// consecutive raise requests arrive, lowers by `fee / decrease_fraction`,
/// and stays within `[normal_fee, max_fee]`.
#[derive(Debug)]
pub struct LoadFeeTrack {
    config: FeeConfig,
    state: Mutex<FeeState>,
}

impl LoadFeeTrack {
    pub fn new(config: FeeConfig) -> Self {
        let local_fee = config.normal_fee;
        Self {
            config,
            state: Mutex::new(FeeState {
                local_fee,
                raise_count: 0,
            }),
        }
    }

    pub fn local_fee(&self) -> u64 {
        self.lock().local_fee
    }

    pub fn normal_fee(&self) -> u64 {
        self.config.normal_fee
    }

    pub fn is_loaded(&self) -> bool {
        self.local_fee() != self.config.normal_fee
    }

    fn lock(&self) -> MutexGuard<'_, FeeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FeeTracker for LoadFeeTrack {
    fn raise_local_fee(&self) -> bool {
        let mut state = self.lock();
        state.raise_count = state.raise_count.saturating_add(1);
        if state.raise_count < self.config.raise_threshold {
            return false;
        }

        let original = state.local_fee;
        let raised = original.saturating_add(original / self.config.increase_fraction);
        state.local_fee = raised.min(self.config.max_fee);

        if state.local_fee == original {
            return false;
        }
        tracing::debug!(from = original, to = state.local_fee, "local load fee raised");
        true
    }

    fn lower_local_fee(&self) -> bool {
        let mut state = self.lock();
        state.raise_count = 0;

        let original = state.local_fee;
        let lowered = original - original / self.config.decrease_fraction;
        state.local_fee = lowered.max(self.config.normal_fee);

        if state.local_fee == original {
            return false;
        }
        tracing::debug!(from = original, to = state.local_fee, "local load fee lowered");
        true
    }
}

/// Fee-change listener that reports the new fee in the log.
pub struct LoggingFeeListener {
    fees: Arc<LoadFeeTrack>,
}

impl LoggingFeeListener {
    pub fn new(fees: Arc<LoadFeeTrack>) -> Self {
        Self { fees }
    }
}

impl FeeChangeListener for LoggingFeeListener {
    fn fee_changed(&self) {
        tracing::info!(
            local_fee = self.fees.local_fee(),
            normal_fee = self.fees.normal_fee(),
            "local fee changed"
        );
    }
}
