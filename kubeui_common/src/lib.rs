//! Code shared between the `kubeui` tools: talking to the Kubernetes API,
//! finding a service's endpoints, and proxying to it when we can't reach it
//! directly.

#![warn(missing_docs)]

pub use tokio;
pub use tracing;

pub mod browser;
pub mod connect_via;
pub mod errors;
pub mod kubernetes;
pub mod openui;
pub mod proxy;
pub mod resolver;
pub mod tracing_support;

/// Common imports used by many modules.
pub mod prelude {
    pub use anyhow::{format_err, Context as _};
    pub use serde::{Deserialize, Serialize};
    pub use std::{
        fmt,
        io::Write,
        path::{Path, PathBuf},
    };
    pub use tracing::{debug, error, info, trace, warn};

    pub use super::connect_via::ConnectVia;
    pub use super::errors::OpenUiError;
    pub use super::kubernetes::{ControlPlane, ServiceIdentity};
    pub use super::{Error, Result};
}

/// Error type for this crate's functions.
pub use anyhow::Error;

/// Result type for this crate's functions.
pub use anyhow::Result;
