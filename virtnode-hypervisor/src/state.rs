//! Normalization of driver state codes.

use crate::types::{RunState, VmState};

/// Map a raw driver state code to `(state, run_state)`.
///
/// # Panics
///
/// Panics on codes outside 0..=6. Drivers guarantee that range, so an unknown
/// code means the driver binding itself is broken.
pub fn normalize(code: u32) -> (VmState, RunState) {
    let run_state = RunState::from_code(code)
        .unwrap_or_else(|| panic!("driver reported out-of-range domain state {}", code));
    (run_state.lifecycle(), run_state)
}
