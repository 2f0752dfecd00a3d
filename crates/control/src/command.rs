use std::collections::HashMap;

use proto::proto::{Command, CommandType};

/// Command envelope builders for the command kinds a coordinator can issue.
/// `command_id` is left empty here; [`crate::stream_manager::StreamManager::send_command_and_wait`]
/// fills it in from the target session's monotonic counter if so.

pub fn setup_exit(client_id: &str, client_pubkey: &str, session_id: &str, allowed_ips: &str) -> Command {
    let mut payload = HashMap::new();
    payload.insert("client_id".to_string(), client_id.to_string());
    payload.insert("client_pubkey".to_string(), client_pubkey.to_string());
    payload.insert("session_id".to_string(), session_id.to_string());
    payload.insert(
        "allowed_ips".to_string(),
        if allowed_ips.is_empty() { "0.0.0.0/0".to_string() } else { allowed_ips.to_string() },
    );

    Command { command_id: String::new(), r#type: CommandType::SetupExit as i32, payload }
}

/// Carries tunnel parameters back down to the requesting peer. Reuses
/// `ROTATE_PEER` rather than inventing a dedicated grant message kind.
pub fn rotate_peer(endpoint: &str, public_key: &str, allowed_ips: &str, allocation_id: &str) -> Command {
    let mut payload = HashMap::new();
    payload.insert("endpoint".to_string(), endpoint.to_string());
    payload.insert("public_key".to_string(), public_key.to_string());
    payload.insert("allowed_ips".to_string(), allowed_ips.to_string());
    payload.insert("allocation_id".to_string(), allocation_id.to_string());

    Command { command_id: String::new(), r#type: CommandType::RotatePeer as i32, payload }
}

pub fn relay_setup(relay_endpoint: &str, relay_client_addr: &str, allocation_id: &str) -> Command {
    let mut payload = HashMap::new();
    payload.insert("relay_endpoint".to_string(), relay_endpoint.to_string());
    payload.insert("relay_client_addr".to_string(), relay_client_addr.to_string());
    payload.insert("allocation_id".to_string(), allocation_id.to_string());

    Command { command_id: String::new(), r#type: CommandType::RelaySetup as i32, payload }
}

/// Instructs a peer to move to a new declared role at runtime (spec §4.6).
pub fn change_role(role: &str) -> Command {
    let mut payload = HashMap::new();
    payload.insert("role".to_string(), role.to_string());

    Command { command_id: String::new(), r#type: CommandType::ChangeRole as i32, payload }
}

pub fn disconnect(allocation_id: &str, reason: &str) -> Command {
    let mut payload = HashMap::new();
    payload.insert("allocation_id".to_string(), allocation_id.to_string());
    payload.insert("reason".to_string(), reason.to_string());

    Command { command_id: String::new(), r#type: CommandType::Disconnect as i32, payload }
}

/// Reads the `target_region` / `prefer_relay` fields a peer's `REQUEST_EXIT`
/// command carries.
pub fn parse_request_exit(payload: &HashMap<String, String>) -> Option<(&str, bool)> {
    let target_region = payload.get("target_region")?.as_str();
    let prefer_relay = payload.get("prefer_relay").map(|v| v == "true").unwrap_or(false);
    Some((target_region, prefer_relay))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_exit_defaults_allowed_ips_when_blank() {
        let command = setup_exit("client-1", "pubkey", "alloc-1", "");
        assert_eq!(command.payload.get("allowed_ips").unwrap(), "0.0.0.0/0");
        assert_eq!(command.r#type, CommandType::SetupExit as i32);
    }

    #[test]
    fn rotate_peer_carries_all_tunnel_parameters() {
        let command = rotate_peer("1.2.3.4:51820", "pubkey", "0.0.0.0/0", "alloc-1");
        assert_eq!(command.payload.get("endpoint").unwrap(), "1.2.3.4:51820");
        assert_eq!(command.payload.get("allocation_id").unwrap(), "alloc-1");
    }

    #[test]
    fn parse_request_exit_reads_region_and_relay_hint() {
        let mut payload = HashMap::new();
        payload.insert("target_region".to_string(), "us".to_string());
        payload.insert("prefer_relay".to_string(), "true".to_string());

        let (region, prefer_relay) = parse_request_exit(&payload).unwrap();
        assert_eq!(region, "us");
        assert!(prefer_relay);
    }

    #[test]
    fn parse_request_exit_missing_region_is_none() {
        assert!(parse_request_exit(&HashMap::new()).is_none());
    }

    #[test]
    fn change_role_carries_the_requested_role() {
        let command = change_role("hybrid");
        assert_eq!(command.payload.get("role").unwrap(), "hybrid");
        assert_eq!(command.r#type, CommandType::ChangeRole as i32);
    }
}
