pub mod backend;
pub mod context;
pub mod error;
pub mod fallback;
pub mod lifecycle;
pub mod load_balancer;
pub mod proxy;
pub mod rate;
pub mod registry;
pub mod runtime;
pub mod selection;

pub use context::{ClientAddr, RequestContext, ResponseState};
pub use error::{BuildError, StageError};
pub use fallback::{FallbackManager, FallbackStage};
pub use lifecycle::ProxyController;
pub use load_balancer::LoadBalancerFactory;
pub use proxy::HttpProxy;
pub use rate::RateCounter;
pub use registry::{StageRegistry, StageSlot};
pub use runtime::{Housekeeping, Runtime, StageRuntime};
pub use selection::Selected;
