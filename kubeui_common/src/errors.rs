//! Error-handling code.

use std::{backtrace::BacktraceStatus, fmt, io, process};

use anyhow::Error;
use thiserror::Error as ThisError;

use crate::kubernetes::ServiceIdentity;

/// The ways in which opening a service UI can fail.
///
/// Only [`OpenUiError::EndpointsNotRegistered`] and
/// [`OpenUiError::NoUsableEndpoint`] are recoverable, by falling back to a
/// local proxy. Everything else ends the operation.
#[derive(Debug, ThisError)]
pub enum OpenUiError {
    /// The service itself does not exist, so it can never have endpoints.
    #[error("couldn't find service {service}")]
    ServiceNotRegistered {
        /// The service we looked for.
        service: ServiceIdentity,
    },

    /// There is no endpoints object for the service.
    #[error("no endpoints are registered for {endpoints}")]
    EndpointsNotRegistered {
        /// The endpoints object we looked for.
        endpoints: ServiceIdentity,
    },

    /// The endpoints object exists, but no subset has both an address and
    /// a port.
    #[error("couldn't find any valid endpoints in {endpoints}")]
    NoUsableEndpoint {
        /// The endpoints object we inspected.
        endpoints: ServiceIdentity,
    },

    /// We could not bind our local proxy listener.
    #[error("could not listen on {address}")]
    BindFailure {
        /// The `host:port` we tried to bind.
        address: String,
        /// What went wrong.
        #[source]
        source: io::Error,
    },

    /// The local proxy stopped serving with an error.
    #[error("proxy server failed")]
    ServeFailure {
        /// What went wrong.
        #[source]
        source: Error,
    },

    /// We don't know how to open URLs on this platform.
    #[error("don't know how to open a browser on unsupported platform {os:?}")]
    UnsupportedPlatform {
        /// The platform name, as reported by `std::env::consts::OS`.
        os: String,
    },

    /// The program used to open URLs could not be started.
    #[error("could not run {program:?} to open {url}")]
    Launch {
        /// The program we tried to run.
        program: String,
        /// The URL we were trying to open.
        url: String,
        /// What went wrong.
        #[source]
        source: io::Error,
    },

    /// Talking to the Kubernetes API failed for some reason other than
    /// "not found".
    #[error("error talking to the Kubernetes API")]
    ControlPlane(#[source] Error),
}

impl OpenUiError {
    /// Should we respond to this error by proxying to the service instead?
    pub fn triggers_proxy_fallback(&self) -> bool {
        matches!(
            self,
            OpenUiError::EndpointsNotRegistered { .. }
                | OpenUiError::NoUsableEndpoint { .. }
        )
    }
}

/// Formats an error for a person at a terminal: the error, one line per
/// cause, and the backtrace if `RUST_BACKTRACE` asked for one.
pub struct ErrorReport<'a> {
    err: &'a Error,
    backtrace: bool,
}

impl<'a> ErrorReport<'a> {
    /// Report `err`, including any captured backtrace.
    pub fn new(err: &'a Error) -> Self {
        ErrorReport {
            err,
            backtrace: true,
        }
    }

    /// Leave out the backtrace.
    pub fn without_backtrace(self) -> Self {
        ErrorReport {
            backtrace: false,
            ..self
        }
    }
}

impl fmt::Display for ErrorReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chain = self.err.chain();
        if let Some(top) = chain.next() {
            writeln!(f, "ERROR: {}", top)?;
        }
        for cause in chain {
            writeln!(f, "  caused by: {}", cause)?;
        }

        let backtrace = self.err.backtrace();
        if self.backtrace && backtrace.status() == BacktraceStatus::Captured {
            write!(f, "{}", backtrace)?;
        }
        Ok(())
    }
}

/// Print `err` to standard error and exit with a failing status.
pub fn exit_with_report(err: &Error) -> ! {
    eprint!("{}", ErrorReport::new(err));
    process::exit(1)
}

/// Generate a `main` function which calls `$run`, and which reports any error
/// it returns using [`exit_with_report`].
#[macro_export]
macro_rules! quick_main {
    ($run:ident) => {
        fn main() {
            if let Err(err) = $run() {
                $crate::errors::exit_with_report(&err);
            }
        }
    };
}

#[test]
fn only_missing_endpoints_trigger_fallback() {
    let endpoints = ServiceIdentity::new("kube-system", "kubernetes-dashboard");
    assert!(OpenUiError::EndpointsNotRegistered {
        endpoints: endpoints.clone()
    }
    .triggers_proxy_fallback());
    assert!(OpenUiError::NoUsableEndpoint {
        endpoints: endpoints.clone()
    }
    .triggers_proxy_fallback());
    assert!(!OpenUiError::ServiceNotRegistered { service: endpoints }
        .triggers_proxy_fallback());
    assert!(!OpenUiError::ControlPlane(anyhow::format_err!("timeout"))
        .triggers_proxy_fallback());
}

#[test]
fn error_report_lists_causes() {
    let err: Error = OpenUiError::BindFailure {
        address: "localhost:8084".to_owned(),
        source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
    }
    .into();
    let displayed = format!("{}", ErrorReport::new(&err).without_backtrace());
    assert_eq!(
        displayed,
        "ERROR: could not listen on localhost:8084\n  caused by: address in use\n",
    );
}
