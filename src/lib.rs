#![forbid(unsafe_code)]

pub mod calculators;
pub mod config;
pub mod core;
pub mod error;
pub mod runtime;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience
pub use crate::config::{
    BackpressureMode, ExecutorConfig, GraphConfig, NodeConfig, PortBinding, SideBinding,
};
pub use crate::core::{
    CalculatorContract, DeclaredType, HandlerChoice, OnFull, Packet, PacketError, Timestamp,
    TypeTag, register_type,
};
pub use crate::runtime::{
    Calculator, CalculatorContext, CalculatorError, ConfigError, ContractRequest, Executor,
    Graph, GraphError, InlineExecutor, ProfileEvent, ProfileSink, StreamError,
    ThreadPoolExecutor, register_calculator,
};
