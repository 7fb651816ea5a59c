//! # Connectors
//!
//! A connector is a source of events. Each one declares the identity kinds
//! it accepts and may contribute event ingress through webhooks or through
//! the periodic subscription refresher.

pub mod generic;
pub mod github;
pub mod registry;
pub mod time;
pub mod trait_;

pub use generic::GenericConnector;
pub use github::GithubConnector;
pub use registry::{Registry, RegistryError};
pub use time::TimeConnector;
pub use trait_::{
    Connector, ConnectorDef, ConnectorError, ConnectorInitData, IdentityDef, IdentityField,
};
