//! Command handlers this peer registers with its [`sdk::PeerStreamClient`].
//! Each one interprets the `string -> string` payload a coordinator builds
//! in `vpnctl_control::command` and turns it into calls against the
//! data-plane adapter.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use dataplane::DataPlane;
use proto::proto::{Command, CommandResponse};
use sdk::{CommandHandler, Role, RoleController};

fn ok(command_id: &str, result: HashMap<String, String>) -> CommandResponse {
    CommandResponse { command_id: command_id.to_string(), success: true, message: String::new(), result }
}

fn failed(command_id: &str, message: impl Into<String>) -> CommandResponse {
    CommandResponse { command_id: command_id.to_string(), success: false, message: message.into(), result: HashMap::new() }
}

fn require<'a>(payload: &'a HashMap<String, String>, key: &str) -> Result<&'a str, String> {
    payload.get(key).map(String::as_str).ok_or_else(|| format!("missing payload field: {key}"))
}

/// Handles `SETUP_EXIT` on the exit/hybrid side of an allocation: adds the
/// requesting client as a WireGuard peer on the local exit interface and
/// allocates it an address from the exit pool.
///
/// Holds the same mutex `RoleController::transition` holds for the duration
/// of its own data-plane calls (via `hold_for_exit_dataplane_op`) so a
/// `CHANGE_ROLE`-driven teardown of this interface can never race this
/// handler installing a peer onto it (spec §4.6 "serialized against
/// in-flight provisioning").
pub struct SetupExitHandler {
    dataplane: Arc<dyn DataPlane>,
    interface: String,
    pool_name: String,
    endpoint: String,
    public_key: String,
    role_controller: Arc<RoleController>,
}

impl SetupExitHandler {
    pub fn new(
        dataplane: Arc<dyn DataPlane>,
        interface: String,
        pool_name: String,
        endpoint: String,
        public_key: String,
        role_controller: Arc<RoleController>,
    ) -> Self {
        Self { dataplane, interface, pool_name, endpoint, public_key, role_controller }
    }
}

#[async_trait]
impl CommandHandler for SetupExitHandler {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let client_pubkey = match require(&command.payload, "client_pubkey") {
            Ok(v) => v,
            Err(e) => return failed(&command.command_id, e),
        };

        let _role_guard = self.role_controller.hold_for_exit_dataplane_op().await;

        let allocated_ip = match self.dataplane.ip_pool_allocate(&self.pool_name).await {
            Ok(addr) => addr,
            Err(e) => return failed(&command.command_id, format!("ip_pool_allocate: {e}")),
        };

        let allowed = vec![format!("{allocated_ip}/32")];
        if let Err(e) = self.dataplane.peer_add(&self.interface, client_pubkey, &allowed, None).await {
            let _ = self.dataplane.ip_pool_release(&self.pool_name, &allocated_ip).await;
            return failed(&command.command_id, format!("peer_add: {e}"));
        }

        let mut result = HashMap::new();
        result.insert("allocated_ip".to_string(), allocated_ip);
        result.insert("endpoint".to_string(), self.endpoint.clone());
        result.insert("public_key".to_string(), self.public_key.clone());
        ok(&command.command_id, result)
    }
}

/// Handles `ROTATE_PEER` on the client side: configures (or reconfigures)
/// this peer's tunnel toward the granted exit endpoint.
pub struct RotatePeerHandler {
    dataplane: Arc<dyn DataPlane>,
    interface: String,
}

impl RotatePeerHandler {
    pub fn new(dataplane: Arc<dyn DataPlane>, interface: String) -> Self {
        Self { dataplane, interface }
    }
}

#[async_trait]
impl CommandHandler for RotatePeerHandler {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let endpoint = match require(&command.payload, "endpoint") {
            Ok(v) => v,
            Err(e) => return failed(&command.command_id, e),
        };
        let public_key = match require(&command.payload, "public_key") {
            Ok(v) => v,
            Err(e) => return failed(&command.command_id, e),
        };
        let allowed_ips = command.payload.get("allowed_ips").cloned().unwrap_or_else(|| "0.0.0.0/0".to_string());
        let allowed: Vec<String> = allowed_ips.split(',').map(str::to_string).collect();

        if let Err(e) = self.dataplane.peer_add(&self.interface, public_key, &allowed, Some(endpoint)).await {
            return failed(&command.command_id, format!("peer_add: {e}"));
        }

        ok(&command.command_id, HashMap::new())
    }
}

/// Handles `RELAY_SETUP`: points this peer's tunnel at a coordinator-side
/// relay address instead of the exit's own endpoint.
pub struct RelaySetupHandler {
    dataplane: Arc<dyn DataPlane>,
    interface: String,
}

impl RelaySetupHandler {
    pub fn new(dataplane: Arc<dyn DataPlane>, interface: String) -> Self {
        Self { dataplane, interface }
    }
}

#[async_trait]
impl CommandHandler for RelaySetupHandler {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let relay_endpoint = match require(&command.payload, "relay_endpoint") {
            Ok(v) => v,
            Err(e) => return failed(&command.command_id, e),
        };
        let relay_client_addr = match require(&command.payload, "relay_client_addr") {
            Ok(v) => v,
            Err(e) => return failed(&command.command_id, e),
        };

        let relay_client_cidr = format!("{relay_client_addr}/32");
        if let Err(e) = self.dataplane.interface_configure(&self.interface, "", None, Some(relay_client_cidr.as_str())).await {
            return failed(&command.command_id, format!("interface_configure: {e}"));
        }

        log::info!("relay_setup: tunnel now points at relay endpoint {relay_endpoint}");
        ok(&command.command_id, HashMap::new())
    }
}

#[cfg(test)]
mod rotate_peer_tests {
    use super::*;
    use dataplane::MemoryAdapter;

    #[tokio::test]
    async fn rotate_peer_configures_tunnel_peer_with_declared_endpoint() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        dataplane.interface_create("wg0").await.unwrap();
        let handler = RotatePeerHandler::new(dataplane.clone(), "wg0".to_string());

        let mut payload = HashMap::new();
        payload.insert("endpoint".to_string(), "203.0.113.9:51820".to_string());
        payload.insert("public_key".to_string(), "exit-pubkey".to_string());
        payload.insert("allowed_ips".to_string(), "0.0.0.0/0".to_string());

        let response = handler
            .handle(&Command { command_id: "c1".into(), r#type: 2, payload })
            .await;

        assert!(response.success);
        let peers = dataplane.peers("wg0").await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, "exit-pubkey");
        assert_eq!(peers[0].endpoint.as_deref(), Some("203.0.113.9:51820"));
    }

    #[tokio::test]
    async fn rotate_peer_fails_without_required_fields() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let handler = RotatePeerHandler::new(dataplane, "wg0".to_string());

        let response = handler.handle(&Command { command_id: "c1".into(), r#type: 2, payload: HashMap::new() }).await;
        assert!(!response.success);
    }
}

/// Handles `DISCONNECT`: removes the named peer from the local tunnel
/// interface. Builds its response before scheduling the teardown, per the
/// handler contract that command handlers must return promptly.
pub struct DisconnectHandler {
    dataplane: Arc<dyn DataPlane>,
    interface: String,
}

impl DisconnectHandler {
    pub fn new(dataplane: Arc<dyn DataPlane>, interface: String) -> Self {
        Self { dataplane, interface }
    }
}

#[async_trait]
impl CommandHandler for DisconnectHandler {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let Some(public_key) = command.payload.get("public_key").cloned() else {
            return ok(&command.command_id, HashMap::new());
        };

        let dataplane = self.dataplane.clone();
        let interface = self.interface.clone();
        tokio::spawn(async move {
            if let Err(e) = dataplane.peer_remove(&interface, &public_key).await {
                log::warn!("disconnect: peer_remove({public_key}) on {interface}: {e}");
            }
        });

        ok(&command.command_id, HashMap::new())
    }
}

/// Handles `CHANGE_ROLE`: the runtime trigger for spec §4.6's "peers may
/// transition between roles at runtime". This is the only in-tree caller of
/// `RoleController::transition` other than the one-time startup call in
/// `main`, reachable from either an operator-issued command dispatched down
/// from the coordinator or, in principle, a local process that enqueues the
/// same command kind through the registered handler table.
pub struct ChangeRoleHandler {
    role_controller: Arc<RoleController>,
}

impl ChangeRoleHandler {
    pub fn new(role_controller: Arc<RoleController>) -> Self {
        Self { role_controller }
    }
}

#[async_trait]
impl CommandHandler for ChangeRoleHandler {
    async fn handle(&self, command: &Command) -> CommandResponse {
        let role_str = match require(&command.payload, "role") {
            Ok(v) => v,
            Err(e) => return failed(&command.command_id, e),
        };
        let new_role: Role = match role_str.parse() {
            Ok(role) => role,
            Err(e) => return failed(&command.command_id, format!("invalid role: {e}")),
        };

        match self.role_controller.transition(new_role).await {
            Ok(()) => {
                let mut result = HashMap::new();
                result.insert("role".to_string(), new_role.as_str().to_string());
                ok(&command.command_id, result)
            }
            Err(e) => failed(&command.command_id, format!("role transition failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataplane::MemoryAdapter;
    use sdk::{ClientConfig, ExitInterfaceConfig, PeerStreamClient};

    fn role_controller(dataplane: Arc<dyn DataPlane>) -> Arc<RoleController> {
        let client = Arc::new(PeerStreamClient::new(
            ClientConfig::new("peer-1", "us", "127.0.0.1:9000"),
            proto::crypto::Keypair::generate(),
            Role::Client,
        ));
        let config = ExitInterfaceConfig {
            interface: "wg-exit0".to_string(),
            egress_interface: "eth0".to_string(),
            private_key: "private-key".to_string(),
            listen_port: Some(51820),
            pool_name: "exit-pool".to_string(),
            pool_cidr: "10.60.0.0/24".to_string(),
        };
        Arc::new(RoleController::new(dataplane, client, config, Role::Exit))
    }

    #[tokio::test]
    async fn setup_exit_allocates_and_adds_peer() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        dataplane.interface_create("wg-exit0").await.unwrap();
        dataplane.ip_pool_create("exit-pool", "10.60.0.0/24").await.unwrap();

        let handler = SetupExitHandler::new(
            dataplane.clone(),
            "wg-exit0".to_string(),
            "exit-pool".to_string(),
            "203.0.113.1:51820".to_string(),
            "exit-pubkey".to_string(),
            role_controller(dataplane.clone()),
        );

        let mut payload = HashMap::new();
        payload.insert("client_pubkey".to_string(), "client-pubkey".to_string());

        let response = handler.handle(&Command { command_id: "c1".into(), r#type: 1, payload }).await;

        assert!(response.success);
        assert_eq!(response.result.get("public_key").unwrap(), "exit-pubkey");
        assert!(response.result.contains_key("allocated_ip"));

        let peers = dataplane.peers("wg-exit0").await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, "client-pubkey");
    }

    #[tokio::test]
    async fn setup_exit_releases_allocated_ip_when_peer_add_fails() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        // No interface_create: peer_add fails with NotFound, exercising the
        // rollback path.
        dataplane.ip_pool_create("exit-pool", "10.61.0.0/30").await.unwrap();

        let handler = SetupExitHandler::new(
            dataplane.clone(),
            "wg-exit0".to_string(),
            "exit-pool".to_string(),
            "203.0.113.1:51820".to_string(),
            "exit-pubkey".to_string(),
            role_controller(dataplane.clone()),
        );

        let mut payload = HashMap::new();
        payload.insert("client_pubkey".to_string(), "client-pubkey".to_string());

        let response = handler.handle(&Command { command_id: "c1".into(), r#type: 1, payload }).await;
        assert!(!response.success);

        // The /30 pool has exactly two host addresses; if the failed attempt
        // had leaked its allocation, one of these would exhaust the pool.
        let a = dataplane.ip_pool_allocate("exit-pool").await.unwrap();
        let b = dataplane.ip_pool_allocate("exit-pool").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn setup_exit_fails_without_client_pubkey() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let handler = SetupExitHandler::new(
            dataplane.clone(),
            "wg-exit0".to_string(),
            "exit-pool".to_string(),
            "203.0.113.1:51820".to_string(),
            "exit-pubkey".to_string(),
            role_controller(dataplane),
        );

        let response = handler.handle(&Command { command_id: "c1".into(), r#type: 1, payload: HashMap::new() }).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn disconnect_without_public_key_succeeds_trivially() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let handler = DisconnectHandler::new(dataplane, "wg0".to_string());

        let response = handler.handle(&Command { command_id: "c1".into(), r#type: 4, payload: HashMap::new() }).await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn change_role_transitions_and_stands_up_exit_interface() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let client = Arc::new(PeerStreamClient::new(
            ClientConfig::new("peer-1", "us", "127.0.0.1:9000"),
            proto::crypto::Keypair::generate(),
            Role::Client,
        ));
        let config = ExitInterfaceConfig {
            interface: "wg-exit0".to_string(),
            egress_interface: "eth0".to_string(),
            private_key: "private-key".to_string(),
            listen_port: Some(51820),
            pool_name: "exit-pool".to_string(),
            pool_cidr: "10.70.0.0/24".to_string(),
        };
        let controller = Arc::new(RoleController::new(dataplane.clone(), client, config, Role::Client));
        let handler = ChangeRoleHandler::new(controller.clone());

        let mut payload = HashMap::new();
        payload.insert("role".to_string(), "hybrid".to_string());

        let response = handler.handle(&Command { command_id: "c1".into(), r#type: 6, payload }).await;

        assert!(response.success);
        assert_eq!(response.result.get("role").unwrap(), "hybrid");
        assert_eq!(controller.current_role().await, Role::Hybrid);
        assert!(dataplane.peers("wg-exit0").await.is_ok());
    }

    #[tokio::test]
    async fn change_role_rejects_unknown_role_string() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let handler = ChangeRoleHandler::new(role_controller(dataplane));

        let mut payload = HashMap::new();
        payload.insert("role".to_string(), "superuser".to_string());

        let response = handler.handle(&Command { command_id: "c1".into(), r#type: 6, payload }).await;
        assert!(!response.success);
    }
}
