pub mod config;
pub mod dispatch;
pub mod dtype;
pub mod errors;
pub mod gating;
pub mod kernels;
pub mod moe;
pub mod routing;
// Re-export key structs for easier access
pub use config::RoutingConfig;
pub use dispatch::{DispatchConfig, DispatchPlan, FastDispatcher, fast_decode, fast_encode};
pub use dtype::{DType, DeviceClass, Element};
pub use errors::{DispatchError, Result};
pub use gating::{GatingDecoder, GatingEncoder, GatingGrads};
pub use kernels::{
    HostScatter, KernelExtent, KernelHandle, KernelRegistry, ParallelScatter, ScatterBackend,
    ScatterKernel,
};
pub use moe::{Expert, LinearExpert, MoELayer, Router};
pub use routing::{CriticalData, extract_critical, extract_critical_with, load_balance};
