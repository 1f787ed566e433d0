//! keel-platform — the cloud services keel reconciles against.
//!
//! Each service is an async trait so reconcilers stay independent of any
//! particular SDK. [`memory::InMemoryPlatform`] implements all of them and
//! records every mutating call.

pub mod error;
pub mod memory;
pub mod service;
pub mod types;

pub use error::{PlatformError, PlatformResult, PlatformResultExt};
pub use memory::InMemoryPlatform;
pub use service::{
    ComputeService, EventService, GatewayService, IdentityService, Platform, RegistryService,
};
pub use types::*;
