//! Stock calculators shipped with the runtime.
//!
//! Registration is explicit: call [`register_builtin`] once during program
//! init (tests do the same). Each calculator is also usable as a pattern
//! for writing your own.

use std::sync::Once;

use crate::runtime::register_calculator;

mod constant_side_packet;
mod pass_through;

pub use constant_side_packet::ConstantSidePacketCalculator;
pub use pass_through::PassThroughCalculator;

/// Register every stock calculator. Safe to call more than once.
pub fn register_builtin() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register_calculator(
            "PassThroughCalculator",
            pass_through::contract,
            pass_through::factory,
        );
        register_calculator(
            "ConstantSidePacketCalculator",
            constant_side_packet::contract,
            constant_side_packet::factory,
        );
    });
}
