//! The calculator capability and its process-global registry.
//!
//! A calculator is user code invoked by the scheduler: `open` once per node
//! instance, `process` once per ready input set, `close` once at the end.
//! Types register under a name with plain function calls at program init;
//! graph configurations refer to that name.

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use crate::core::CalculatorContract;

use super::context::CalculatorContext;
use super::error::{CalculatorError, ConfigError};

pub trait Calculator: Send {
    /// Runs before any streaming data, with side packets resolved. May emit
    /// at `Timestamp::PRE_STREAM`.
    fn open(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        Ok(())
    }

    /// Runs once per ready input set.
    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError>;

    /// Runs after all upstreams closed, or during shutdown. May still emit.
    fn close(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        Ok(())
    }
}

/// Inputs to a contract function: the node as configured.
pub struct ContractRequest<'a> {
    pub node: &'a str,
    pub options: &'a serde_json::Value,
}

pub type ContractFn = fn(&ContractRequest<'_>) -> Result<CalculatorContract, ConfigError>;
pub type FactoryFn = fn() -> Box<dyn Calculator>;

#[derive(Clone, Copy)]
pub struct CalculatorEntry {
    pub contract: ContractFn,
    pub factory: FactoryFn,
}

fn registry() -> &'static RwLock<HashMap<String, CalculatorEntry>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, CalculatorEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a calculator type under `name`. Idempotent; the last
/// registration wins, which keeps repeated init paths harmless.
pub fn register_calculator(name: impl Into<String>, contract: ContractFn, factory: FactoryFn) {
    let mut map = registry().write().unwrap_or_else(PoisonError::into_inner);
    map.insert(name.into(), CalculatorEntry { contract, factory });
}

pub(crate) fn lookup_calculator(name: &str) -> Option<CalculatorEntry> {
    let map = registry().read().unwrap_or_else(PoisonError::into_inner);
    map.get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Calculator for Nop {
        fn process(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
            Ok(())
        }
    }

    fn nop_contract(_req: &ContractRequest<'_>) -> Result<CalculatorContract, ConfigError> {
        let mut contract = CalculatorContract::new();
        contract.input_any("IN");
        Ok(contract)
    }

    fn nop_factory() -> Box<dyn Calculator> {
        Box::new(Nop)
    }

    #[test]
    fn registration_is_by_name_and_idempotent() {
        register_calculator("NopCalculator", nop_contract, nop_factory);
        register_calculator("NopCalculator", nop_contract, nop_factory);
        assert!(lookup_calculator("NopCalculator").is_some());
        assert!(lookup_calculator("NeverRegistered").is_none());
    }
}
