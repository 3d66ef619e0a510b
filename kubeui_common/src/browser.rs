//! Opening URLs in the user's browser.

use std::{env, process::Command};

use crate::prelude::*;

/// Something which can show a URL to the user.
pub trait UrlOpener: Send + Sync {
    /// Open `url`. This should return once the request has been handed off,
    /// without waiting for the browser.
    fn open(&self, url: &str) -> Result<(), OpenUiError>;
}

/// Opens URLs by running a platform helper like `xdg-open`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOpener {
    program: String,
    args: Vec<String>,
}

impl CommandOpener {
    /// Open URLs by running `program`, followed by `args` and then the URL.
    pub fn new(program: &str, args: &[&str]) -> CommandOpener {
        CommandOpener {
            program: program.to_owned(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
        }
    }
}

impl UrlOpener for CommandOpener {
    fn open(&self, url: &str) -> Result<(), OpenUiError> {
        debug!("running {} {:?} {}", self.program, self.args, url);
        Command::new(&self.program)
            .args(&self.args)
            .arg(url)
            .spawn()
            .map_err(|source| OpenUiError::Launch {
                program: self.program.clone(),
                url: url.to_owned(),
                source,
            })?;
        Ok(())
    }
}

/// Used on platforms where we don't know how to open a browser.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnsupportedOpener {
    os: String,
}

impl UrlOpener for UnsupportedOpener {
    fn open(&self, _url: &str) -> Result<(), OpenUiError> {
        Err(OpenUiError::UnsupportedPlatform {
            os: self.os.clone(),
        })
    }
}

/// The helper program which opens URLs on `os`, if we know one.
fn command_for_os(os: &str) -> Option<CommandOpener> {
    match os {
        "linux" | "freebsd" | "openbsd" | "netbsd" | "dragonfly" => {
            Some(CommandOpener::new("xdg-open", &[]))
        }
        "macos" => Some(CommandOpener::new("open", &[])),
        // The URL must not pass through `cmd`, which splits it at `&`.
        "windows" => Some(CommandOpener::new(
            "rundll32",
            &["url.dll,FileProtocolHandler"],
        )),
        _ => None,
    }
}

/// Choose an opener for the named operating system, using the names from
/// `std::env::consts::OS`.
pub fn opener_for_os(os: &str) -> Box<dyn UrlOpener> {
    match command_for_os(os) {
        Some(opener) => Box::new(opener),
        None => Box::new(UnsupportedOpener { os: os.to_owned() }),
    }
}

/// Choose an opener for the platform we're running on.
pub fn system_opener() -> Box<dyn UrlOpener> {
    opener_for_os(env::consts::OS)
}

#[test]
fn unknown_platforms_are_unsupported() {
    let opener = opener_for_os("plan9");
    match opener.open("http://localhost:8084/") {
        Err(OpenUiError::UnsupportedPlatform { os }) => assert_eq!(os, "plan9"),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn windows_urls_are_not_parsed_by_the_shell() {
    let opener = command_for_os("windows").expect("windows should be supported");
    assert_eq!(opener.program, "rundll32");
    assert_eq!(opener.args, vec!["url.dll,FileProtocolHandler"]);
    assert_eq!(
        command_for_os("linux"),
        Some(CommandOpener::new("xdg-open", &[])),
    );
}

#[test]
fn missing_helper_programs_are_reported() {
    let opener = CommandOpener::new("kubeui-no-such-opener", &[]);
    match opener.open("http://localhost:8084/") {
        Err(OpenUiError::Launch { program, url, .. }) => {
            assert_eq!(program, "kubeui-no-such-opener");
            assert_eq!(url, "http://localhost:8084/");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
