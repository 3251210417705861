//! Broker endpoint providers.
//!
//! An [`EndpointProvider`] answers "where are the brokers right now".
//! [`StaticEndpoints`] is fixed at construction; [`DiscoveryEndpoints`]
//! follows an external [`Discovery`] collaborator and announces changes.

mod discovery;
mod provider;

pub use discovery::{ChangeCallback, Discovery, DiscoveryEndpoints, ManualDiscovery};
pub use provider::{
    //
    EndpointProvider,
    EndpointProviderPtr,
    EndpointSet,
    StaticEndpoints,
    DEFAULT_BROKER_ADDRESS,
};
