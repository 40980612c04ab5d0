//! Runtime: streams, handlers, nodes, scheduler, executors, graph.

pub mod calculator;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod handler;
pub(crate) mod node;
pub mod profile;
pub(crate) mod scheduler;
pub(crate) mod stream;

pub use calculator::{
    Calculator, CalculatorEntry, ContractFn, ContractRequest, FactoryFn, register_calculator,
};
pub use context::{CalculatorContext, Inputs, OutputPort, Outputs, ServiceSet, SidePacketSet};
pub use error::{CalculatorError, ConfigError, GraphError, StreamError};
pub use executor::{Executor, InlineExecutor, Task, ThreadPoolExecutor};
pub use graph::Graph;
pub use handler::{HandlerPolicy, Readiness};
pub use profile::{ProfileEvent, ProfilePhase, ProfileSink};
