//! Reconnection timers.
//!
//! Each slot owns at most one timer. Scheduling replaces (and aborts) the
//! previous one; every replacement or cancellation bumps the slot's epoch so
//! a timer that already fired and is waiting on the lifecycle lock notices
//! it was superseded.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::debug;

use crate::registry::RegistryInner;
use crate::supervisor::ProviderSlot;

/// Arm a reconnection attempt for `slot` after `delay`.
///
/// Returns the number the attempt will carry once it runs.
pub(crate) fn schedule(registry: &Arc<RegistryInner>, slot: &Arc<ProviderSlot>, delay: Duration) -> u32 {
    let registry: Weak<RegistryInner> = Arc::downgrade(registry);
    let target: Weak<ProviderSlot> = Arc::downgrade(slot);

    let mut state = slot.state();
    state.cancel_reconnect();
    let epoch = state.epoch;
    let attempt = state.reconnect.attempt_count + 1;
    state.pending_delay = Some(delay);
    state.reconnect_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let (Some(registry), Some(slot)) = (registry.upgrade(), target.upgrade()) else {
            return;
        };
        registry.run_scheduled_attempt(&slot, epoch).await;
    }));

    debug!(provider = %slot.id(), attempt, epoch, "Reconnect timer armed");
    attempt
}

/// Abort the pending timer of `slot`, if any.
pub(crate) fn cancel(slot: &ProviderSlot) -> bool {
    let mut state = slot.state();
    let had_timer = state.reconnect_timer.is_some();
    state.cancel_reconnect();
    had_timer
}
