//! Translation of `talosctl` text output.
//!
//! talosctl has no stable machine-readable output for these commands, so
//! all interpretation of its tables and messages lives here.

/// Whether `talosctl etcd status` shows at least one member.
///
/// A bootstrapped node prints a table whose header contains `MEMBER`,
/// followed by one row per member.
#[must_use]
pub fn is_bootstrapped(etcd_status: &str) -> bool {
    let mut lines = etcd_status.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.by_ref().find(|l| l.contains("MEMBER")) else {
        return false;
    };
    let columns = header.split_whitespace().count();
    lines.any(|row| row.split_whitespace().count() >= columns.min(3))
}

/// `STATE` field of `talosctl service <id>`.
#[must_use]
pub fn service_state(output: &str) -> Option<&str> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("STATE"), Some(state)) => Some(state),
            _ => None,
        }
    })
}

/// Whether the service reports `Running`.
#[must_use]
pub fn is_service_running(output: &str) -> bool {
    service_state(output) == Some("Running")
}

/// Server `Tag:` of `talosctl version`.
#[must_use]
pub fn server_version(output: &str) -> Option<&str> {
    output
        .lines()
        .skip_while(|l| l.trim() != "Server:")
        .find_map(|l| l.trim().strip_prefix("Tag:").map(str::trim))
        .filter(|tag| !tag.is_empty())
}

/// Errors from `talosctl bootstrap` that mean the work is already done.
#[must_use]
pub fn is_already_bootstrapped(message: &str) -> bool {
    message.contains("already bootstrapped")
        || message.contains("etcd is already running")
        || message.contains("AlreadyExists")
}

/// Errors from `talosctl reset` that mean the node went down as asked.
///
/// A resetting node drops its API mid-call, so the client sees the
/// connection vanish or the deadline pass.
#[must_use]
pub fn is_reset_disconnect(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("connection refused")
        || lower.contains("deadline exceeded")
        || lower.contains("connection reset by peer")
}
