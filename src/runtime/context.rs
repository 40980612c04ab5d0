//! The per-invocation window handed to a calculator.
//!
//! Contexts are passed explicitly; there is no thread-local "current
//! context" slot. Outputs are buffered in scratch space and flushed by the
//! scheduler after the entry point returns, so no stream lock is ever held
//! across user code.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{CalculatorContract, DeclaredType, Packet, PacketError, Timestamp};

use super::error::{CalculatorError, StreamError};

/// One-shot configuration values resolved before `open`.
#[derive(Clone, Default)]
pub struct SidePacketSet {
    by_tag: HashMap<String, Packet>,
}

impl SidePacketSet {
    pub(crate) fn new(by_tag: HashMap<String, Packet>) -> SidePacketSet {
        SidePacketSet { by_tag }
    }

    pub fn get(&self, tag: &str) -> Option<&Packet> {
        self.by_tag.get(tag)
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

/// External service singletons requested via the contract.
#[derive(Clone, Default)]
pub struct ServiceSet {
    by_name: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceSet {
    pub(crate) fn new(by_name: HashMap<String, Arc<dyn Any + Send + Sync>>) -> ServiceSet {
        ServiceSet { by_name }
    }

    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        let service = self.by_name.get(name)?;
        Arc::clone(service).downcast::<T>().ok()
    }
}

/// Which entry point this context serves. Governs what outputs may do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Open,
    Process,
    Close,
}

/// Buffered effects of one invocation, drained by the scheduler.
pub(crate) struct OutputScratch {
    pub(crate) ports: Vec<PortScratch>,
    pub(crate) side_packets: Vec<(usize, Packet)>,
    phase: Phase,
}

pub(crate) struct PortScratch {
    pub(crate) packets: Vec<Packet>,
    pub(crate) bound: Option<Timestamp>,
    pub(crate) close: bool,
    /// Working copy of the port's last emitted timestamp.
    pub(crate) last: Timestamp,
}

impl OutputScratch {
    pub(crate) fn new(phase: Phase, last_emitted: &[Timestamp]) -> OutputScratch {
        OutputScratch {
            ports: last_emitted
                .iter()
                .map(|&last| PortScratch {
                    packets: Vec::new(),
                    bound: None,
                    close: false,
                    last,
                })
                .collect(),
            side_packets: Vec::new(),
            phase,
        }
    }
}

/// The per-invocation view passed to calculator entry points.
pub struct CalculatorContext<'a> {
    node_name: &'a str,
    input_timestamp: Timestamp,
    inputs: &'a [Packet],
    headers: &'a [Option<Packet>],
    contract: &'a CalculatorContract,
    side_packets: &'a SidePacketSet,
    services: &'a ServiceSet,
    options: &'a serde_json::Value,
    scratch: &'a mut OutputScratch,
}

impl<'a> CalculatorContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_name: &'a str,
        input_timestamp: Timestamp,
        inputs: &'a [Packet],
        headers: &'a [Option<Packet>],
        contract: &'a CalculatorContract,
        side_packets: &'a SidePacketSet,
        services: &'a ServiceSet,
        options: &'a serde_json::Value,
        scratch: &'a mut OutputScratch,
    ) -> CalculatorContext<'a> {
        CalculatorContext {
            node_name,
            input_timestamp,
            inputs,
            headers,
            contract,
            side_packets,
            services,
            options,
            scratch,
        }
    }

    pub fn node_name(&self) -> &str {
        self.node_name
    }

    /// Timestamp of this invocation's input set. `UNSTARTED` during `open`
    /// and `close`.
    pub fn input_timestamp(&self) -> Timestamp {
        self.input_timestamp
    }

    pub fn inputs(&self) -> Inputs<'_> {
        Inputs {
            packets: self.inputs,
            contract: self.contract,
            node_name: self.node_name,
        }
    }

    pub fn outputs(&mut self) -> Outputs<'_> {
        Outputs {
            contract: self.contract,
            node_name: self.node_name,
            input_timestamp: self.input_timestamp,
            scratch: &mut *self.scratch,
        }
    }

    pub fn side_packets(&self) -> &SidePacketSet {
        self.side_packets
    }

    pub fn services(&self) -> &ServiceSet {
        self.services
    }

    pub fn options(&self) -> &serde_json::Value {
        self.options
    }

    /// Header of the input stream bound to `tag`, if one was supplied.
    pub fn input_header(&self, tag: &str) -> Option<&Packet> {
        let index = self.contract.input_index(tag)?;
        self.headers.get(index).and_then(Option::as_ref)
    }

    /// Publish a side packet declared in the contract's outputs. Only legal
    /// during `open`.
    pub fn set_output_side_packet(
        &mut self,
        tag: &str,
        packet: Packet,
    ) -> Result<(), CalculatorError> {
        if self.scratch.phase != Phase::Open {
            return Err(CalculatorError::msg(format!(
                "node `{}`: side packets can only be produced during open",
                self.node_name
            )));
        }
        let index = self
            .contract
            .output_side_packets()
            .iter()
            .position(|s| s.tag == tag)
            .ok_or_else(|| {
                CalculatorError::msg(format!(
                    "node `{}` does not declare output side packet `{tag}`",
                    self.node_name
                ))
            })?;
        let spec = &self.contract.output_side_packets()[index];
        check_declared(spec.declared, &packet)?;
        if self.scratch.side_packets.iter().any(|(i, _)| *i == index) {
            return Err(CalculatorError::msg(format!(
                "node `{}` produced side packet `{tag}` twice",
                self.node_name
            )));
        }
        self.scratch.side_packets.push((index, packet));
        Ok(())
    }
}

/// Read-only view of the invocation's input set.
pub struct Inputs<'a> {
    packets: &'a [Packet],
    contract: &'a CalculatorContract,
    node_name: &'a str,
}

impl<'a> Inputs<'a> {
    /// The packet on the input bound to `tag`; empty if nothing arrived at
    /// the invocation timestamp.
    pub fn tag(&self, tag: &str) -> Result<&'a Packet, CalculatorError> {
        let index = self.contract.input_index(tag).ok_or_else(|| {
            CalculatorError::msg(format!(
                "node `{}` has no input tag `{tag}`",
                self.node_name
            ))
        })?;
        Ok(&self.packets[index])
    }

    pub fn get(&self, index: usize) -> Option<&'a Packet> {
        self.packets.get(index)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Packet> {
        self.packets.iter()
    }
}

/// Write-side of the context: buffered emissions per output port.
pub struct Outputs<'a> {
    contract: &'a CalculatorContract,
    node_name: &'a str,
    input_timestamp: Timestamp,
    scratch: &'a mut OutputScratch,
}

impl<'a> Outputs<'a> {
    pub fn tag(&mut self, tag: &str) -> Result<OutputPort<'_>, CalculatorError> {
        let index = self.contract.output_index(tag).ok_or_else(|| {
            CalculatorError::msg(format!(
                "node `{}` has no output tag `{tag}`",
                self.node_name
            ))
        })?;
        Ok(OutputPort {
            spec_tag: self.contract.outputs()[index].tag.as_str(),
            declared: self.contract.outputs()[index].declared,
            input_timestamp: self.input_timestamp,
            port: &mut self.scratch.ports[index],
        })
    }

    pub fn len(&self) -> usize {
        self.contract.outputs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contract.outputs().is_empty()
    }
}

/// One output port of the running invocation.
pub struct OutputPort<'a> {
    spec_tag: &'a str,
    declared: DeclaredType,
    input_timestamp: Timestamp,
    port: &'a mut PortScratch,
}

impl<'a> OutputPort<'a> {
    /// Emit a packet on this port.
    ///
    /// Emissions must not precede the invocation's input timestamp and must
    /// be strictly increasing per port.
    pub fn add_packet(&mut self, packet: Packet) -> Result<(), CalculatorError> {
        let timestamp = packet.timestamp();
        if self.port.close {
            return Err(CalculatorError::Stream(StreamError::Closed {
                stream: self.spec_tag.to_string(),
            }));
        }
        if !timestamp.is_allowed_in_stream() {
            return Err(CalculatorError::Stream(StreamError::InvalidTimestamp {
                stream: self.spec_tag.to_string(),
                timestamp,
            }));
        }
        if timestamp < self.input_timestamp || timestamp <= self.port.last {
            return Err(CalculatorError::Stream(StreamError::TimestampMonotonicity {
                port: self.spec_tag.to_string(),
                timestamp,
                last: self.port.last,
                input: self.input_timestamp,
            }));
        }
        if !packet.is_empty() {
            check_declared(self.declared, &packet)?;
        }
        self.port.last = timestamp;
        self.port.packets.push(packet);
        Ok(())
    }

    /// Convenience for `add_packet(Packet::new(value, timestamp))`.
    pub fn add<T: Send + Sync + 'static>(
        &mut self,
        value: T,
        timestamp: Timestamp,
    ) -> Result<(), CalculatorError> {
        self.add_packet(Packet::new(value, timestamp))
    }

    /// Publish "no packet below `bound` will be emitted here".
    pub fn set_next_timestamp_bound(&mut self, bound: Timestamp) -> Result<(), CalculatorError> {
        if bound <= self.port.last {
            return Err(CalculatorError::Stream(StreamError::TimestampMonotonicity {
                port: self.spec_tag.to_string(),
                timestamp: bound,
                last: self.port.last,
                input: self.input_timestamp,
            }));
        }
        self.port.bound = Some(match self.port.bound {
            Some(current) => current.max(bound),
            None => bound,
        });
        Ok(())
    }

    /// Close this port early; downstream sees `DONE` after the flush.
    pub fn close(&mut self) {
        self.port.close = true;
    }
}

fn check_declared(declared: DeclaredType, packet: &Packet) -> Result<(), CalculatorError> {
    match packet.type_tag() {
        Some(tag) if declared.accepts(&tag) => Ok(()),
        Some(tag) => Err(CalculatorError::Packet(PacketError::TypeMismatch {
            expected: declared.name(),
            actual: tag.name(),
        })),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> CalculatorContract {
        let mut c = CalculatorContract::new();
        c.input::<i64>("IN").output::<i64>("OUT");
        c.produce_side_packet::<String>("LABEL");
        c
    }

    fn scratch_for(contract: &CalculatorContract, phase: Phase) -> OutputScratch {
        OutputScratch::new(phase, &vec![Timestamp::UNSTARTED; contract.outputs().len()])
    }

    #[test]
    fn inputs_are_read_by_tag() {
        let contract = contract();
        let inputs = vec![Packet::new(5i64, Timestamp::new(2))];
        let side = SidePacketSet::default();
        let services = ServiceSet::default();
        let options = serde_json::Value::Null;
        let mut scratch = scratch_for(&contract, Phase::Process);
        let ctx = CalculatorContext::new(
            "n",
            Timestamp::new(2),
            &inputs,
            &[None],
            &contract,
            &side,
            &services,
            &options,
            &mut scratch,
        );
        assert_eq!(*ctx.inputs().tag("IN").unwrap().value_as::<i64>().unwrap(), 5);
        assert!(ctx.inputs().tag("NOPE").is_err());
    }

    #[test]
    fn emission_at_the_input_timestamp_is_allowed_once() {
        let contract = contract();
        let inputs = vec![Packet::new(5i64, Timestamp::new(2))];
        let side = SidePacketSet::default();
        let services = ServiceSet::default();
        let options = serde_json::Value::Null;
        let mut scratch = scratch_for(&contract, Phase::Process);
        let mut ctx = CalculatorContext::new(
            "n",
            Timestamp::new(2),
            &inputs,
            &[None],
            &contract,
            &side,
            &services,
            &options,
            &mut scratch,
        );
        let mut outputs = ctx.outputs();
        let mut port = outputs.tag("OUT").unwrap();
        port.add(10i64, Timestamp::new(2)).unwrap();
        let err = port.add(11i64, Timestamp::new(2)).unwrap_err();
        assert!(matches!(
            err,
            CalculatorError::Stream(StreamError::TimestampMonotonicity { .. })
        ));
    }

    #[test]
    fn emission_before_the_input_timestamp_is_rejected() {
        let contract = contract();
        let inputs = vec![Packet::new(5i64, Timestamp::new(7))];
        let side = SidePacketSet::default();
        let services = ServiceSet::default();
        let options = serde_json::Value::Null;
        let mut scratch = scratch_for(&contract, Phase::Process);
        let mut ctx = CalculatorContext::new(
            "n",
            Timestamp::new(7),
            &inputs,
            &[None],
            &contract,
            &side,
            &services,
            &options,
            &mut scratch,
        );
        let err = ctx
            .outputs()
            .tag("OUT")
            .unwrap()
            .add(1i64, Timestamp::new(5))
            .unwrap_err();
        assert!(matches!(
            err,
            CalculatorError::Stream(StreamError::TimestampMonotonicity { .. })
        ));
    }

    #[test]
    fn emitted_type_is_checked_against_the_declaration() {
        let contract = contract();
        let inputs = vec![Packet::new(5i64, Timestamp::new(2))];
        let side = SidePacketSet::default();
        let services = ServiceSet::default();
        let options = serde_json::Value::Null;
        let mut scratch = scratch_for(&contract, Phase::Process);
        let mut ctx = CalculatorContext::new(
            "n",
            Timestamp::new(2),
            &inputs,
            &[None],
            &contract,
            &side,
            &services,
            &options,
            &mut scratch,
        );
        let err = ctx
            .outputs()
            .tag("OUT")
            .unwrap()
            .add("wrong type", Timestamp::new(2))
            .unwrap_err();
        assert!(matches!(err, CalculatorError::Packet(_)));
    }

    #[test]
    fn side_packets_only_during_open() {
        let contract = contract();
        let inputs: Vec<Packet> = Vec::new();
        let side = SidePacketSet::default();
        let services = ServiceSet::default();
        let options = serde_json::Value::Null;

        let mut scratch = scratch_for(&contract, Phase::Open);
        let mut ctx = CalculatorContext::new(
            "n",
            Timestamp::UNSTARTED,
            &inputs,
            &[],
            &contract,
            &side,
            &services,
            &options,
            &mut scratch,
        );
        ctx.set_output_side_packet("LABEL", Packet::new(String::from("x"), Timestamp::UNSTARTED))
            .unwrap();
        assert!(
            ctx.set_output_side_packet(
                "LABEL",
                Packet::new(String::from("y"), Timestamp::UNSTARTED)
            )
            .is_err()
        );

        let mut scratch = scratch_for(&contract, Phase::Process);
        let mut ctx = CalculatorContext::new(
            "n",
            Timestamp::new(1),
            &inputs,
            &[],
            &contract,
            &side,
            &services,
            &options,
            &mut scratch,
        );
        assert!(
            ctx.set_output_side_packet(
                "LABEL",
                Packet::new(String::from("z"), Timestamp::UNSTARTED)
            )
            .is_err()
        );
    }
}
