//! LE advertising posture control.
//!
//! BlueZ perturbs the low-level advertising state on adapter power and
//! connection events, so the service re-runs this whenever the observed
//! posture may have diverged from the desired one.

use std::io;
use std::process::{Command, ExitStatus, Stdio};

/// Force LE advertising on or off through the HCI configuration tool.
/// The caller inspects the exit status; a missing tool surfaces as an error.
pub fn set_le_advertising(device: &str, enable: bool) -> io::Result<ExitStatus> {
    let verb = if enable { "leadv" } else { "noleadv" };
    Command::new("hciconfig")
        .arg(device)
        .arg(verb)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
}
