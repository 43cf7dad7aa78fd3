//! Client identifiers exchanged during the handshake.
//!
//! Every connection is named by a stable string: `testproc<processId>` for
//! test processes, `console<daemonId>` for the console link to a daemon and
//! `daemon<daemonId>` for the daemon itself.

pub const TEST_PROCESS_PREFIX: &str = "testproc";
pub const CONSOLE_PREFIX: &str = "console";
pub const DAEMON_PREFIX: &str = "daemon";

pub fn test_process_client_id(process_id: u32) -> String {
    format!("{TEST_PROCESS_PREFIX}{process_id}")
}

pub fn console_client_id(daemon_id: u32) -> String {
    format!("{CONSOLE_PREFIX}{daemon_id}")
}

pub fn daemon_client_id(daemon_id: u32) -> String {
    format!("{DAEMON_PREFIX}{daemon_id}")
}

pub fn is_test_process(client_id: &str) -> bool {
    parse_test_process_id(client_id).is_some()
}

pub fn is_console(client_id: &str) -> bool {
    parse_suffix(client_id, CONSOLE_PREFIX).is_some()
}

/// Extract the process id from a `testproc<id>` client id.
pub fn parse_test_process_id(client_id: &str) -> Option<u32> {
    parse_suffix(client_id, TEST_PROCESS_PREFIX)
}

fn parse_suffix(client_id: &str, prefix: &str) -> Option<u32> {
    client_id.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_ids_round_trip() {
        let id = test_process_client_id(42);
        assert_eq!(id, "testproc42");
        assert_eq!(parse_test_process_id(&id), Some(42));
        assert!(is_test_process(&id));
        assert!(!is_console(&id));
    }

    #[test]
    fn prefixes_without_numeric_suffix_are_rejected() {
        assert!(!is_test_process("testproc"));
        assert!(!is_test_process("testprocs1"));
        assert!(!is_console("console-a"));
        assert!(is_console(&console_client_id(7)));
    }
}
