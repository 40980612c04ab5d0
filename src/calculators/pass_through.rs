//! Forwards its input stream unchanged. The identity element of a graph:
//! handy for fan-out points, renames and tests.

use crate::core::CalculatorContract;
use crate::runtime::{
    Calculator, CalculatorContext, CalculatorError, ConfigError, ContractRequest,
};

pub struct PassThroughCalculator;

pub(super) fn contract(_req: &ContractRequest<'_>) -> Result<CalculatorContract, ConfigError> {
    let mut contract = CalculatorContract::new();
    contract.input_any("IN").output_any("OUT");
    Ok(contract)
}

pub(super) fn factory() -> Box<dyn Calculator> {
    Box::new(PassThroughCalculator)
}

impl Calculator for PassThroughCalculator {
    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        let packet = ctx.inputs().tag("IN")?.clone();
        if !packet.is_empty() {
            ctx.outputs().tag("OUT")?.add_packet(packet)?;
        }
        Ok(())
    }
}
