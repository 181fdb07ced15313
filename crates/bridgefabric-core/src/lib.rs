//! Multi-instance local dispatch fabric: registry, heartbeat, port binder,
//! HTTP surface, discovery client and lifecycle orchestration for
//! loopback-only editor companions.

pub mod config;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod identity;
pub mod lifecycle;
pub mod port_binder;
pub mod registry;

pub use config::FabricConfig;
pub use error::FabricError;
pub use http::{DeliveryError, DeliveryTarget, FabricState, SurfaceState};
pub use identity::{InstanceIdentity, InstanceRecord};
pub use lifecycle::{Fabric, Status};
