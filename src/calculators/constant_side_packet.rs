//! Side-packet generator: publishes a constant from its options during
//! `open`, then closes. The constant is the node's `options.value` JSON.

use crate::core::{CalculatorContract, Packet, Timestamp};
use crate::runtime::{
    Calculator, CalculatorContext, CalculatorError, ConfigError, ContractRequest,
};

pub struct ConstantSidePacketCalculator;

pub(super) fn contract(req: &ContractRequest<'_>) -> Result<CalculatorContract, ConfigError> {
    if req.options.get("value").is_none() {
        return Err(ConfigError::BadNodeOptions {
            node: req.node.to_string(),
            reason: "options.value is required".to_string(),
        });
    }
    let mut contract = CalculatorContract::new();
    contract.produce_side_packet::<serde_json::Value>("PACKET");
    Ok(contract)
}

pub(super) fn factory() -> Box<dyn Calculator> {
    Box::new(ConstantSidePacketCalculator)
}

impl Calculator for ConstantSidePacketCalculator {
    fn open(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        let value = ctx
            .options()
            .get("value")
            .cloned()
            .ok_or_else(|| CalculatorError::msg("options.value missing"))?;
        ctx.set_output_side_packet("PACKET", Packet::new(value, Timestamp::UNSTARTED))
    }

    fn process(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        Ok(())
    }
}
