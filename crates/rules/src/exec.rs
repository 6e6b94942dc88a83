//! Thin wrapper around the system networking utilities.
//!
//! The rule plane is driven entirely through `ip`, `ipset` and `iptables`;
//! this module runs them and classifies the error text the tools emit so
//! idempotent ensure/cleanup logic can treat "already there" and "already
//! gone" as success.

use common::{Error, Result};
use tokio::process::Command;
use tracing::debug;

/// Run a command, returning stdout on success and a rules error carrying
/// the tool's stderr on failure.
pub(crate) async fn run(program: &str, args: &[String]) -> Result<String> {
    debug!(program, args = ?args, "running");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::rules(format!("failed to execute {}: {}", program, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::rules(format!(
            "{} {} failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether an error means the resource already exists.
pub(crate) fn already_exists(err: &Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("file exists") || msg.contains("already exists")
}

/// Whether an error means the resource is already absent.
pub(crate) fn not_found(err: &Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("no such")
        || msg.contains("does not exist")
        || msg.contains("not found")
        || msg.contains("cannot find")
        || msg.contains("no chain/target/match by that name")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_exists_errors() {
        assert!(already_exists(&Error::rules("RTNETLINK answers: File exists")));
        assert!(already_exists(&Error::rules(
            "iptables: Chain already exists."
        )));
        assert!(!already_exists(&Error::rules("Operation not permitted")));
    }

    #[test]
    fn classifies_not_found_errors() {
        assert!(not_found(&Error::rules("RTNETLINK answers: No such process")));
        assert!(not_found(&Error::rules(
            "iptables: No chain/target/match by that name."
        )));
        assert!(not_found(&Error::rules(
            "ipset v7.15: The set with the given name does not exist"
        )));
        assert!(not_found(&Error::rules("Cannot find device \"vipcare\"")));
        assert!(!not_found(&Error::rules("Operation not permitted")));
    }
}
