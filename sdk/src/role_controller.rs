//! Role/mode controller.
//!
//! Owns the decision of whether this peer currently needs an exit tunnel
//! interface stood up, and serializes every role transition against the
//! data plane so two transitions can never race each other's interface
//! create/delete calls. The controller re-asserts the new role upward by
//! calling [`PeerStreamClient::rebind_role`], which forces a fresh
//! `AuthRequest` on the next authenticated frame.

use std::sync::Arc;

use dataplane::DataPlane;
use tokio::sync::Mutex;

use crate::{client::PeerStreamClient, error::{Error, Result}, role::Role};

/// Parameters for the exit-side WireGuard interface this peer stands up
/// when it takes on `Exit` or `Hybrid`.
#[derive(Clone)]
pub struct ExitInterfaceConfig {
    pub interface: String,
    pub egress_interface: String,
    pub private_key: String,
    pub listen_port: Option<u16>,
    pub pool_name: String,
    pub pool_cidr: String,
}

/// One instance per peer process, held behind an `Arc` for the process's
/// lifetime so both the startup role assignment and the `CHANGE_ROLE`
/// command handler (`vpnctl_peer::handlers::ChangeRoleHandler`) call into the
/// same instance. `transition` is the normal entry point and is safe to call
/// concurrently from multiple callers (e.g. a `CHANGE_ROLE` command racing
/// an inbound `SETUP_EXIT` that targets this peer's own exit interface)
/// because the whole stand-up/tear-down sequence runs under a single async
/// mutex; [`RoleController::hold_for_exit_dataplane_op`] lets a caller that
/// isn't itself transitioning the role (e.g. `SetupExitHandler`) take that
/// same mutex before touching the exit interface.
pub struct RoleController {
    dataplane: Arc<dyn DataPlane>,
    client: Arc<PeerStreamClient>,
    config: ExitInterfaceConfig,
    role: Mutex<Role>,
}

impl RoleController {
    pub fn new(dataplane: Arc<dyn DataPlane>, client: Arc<PeerStreamClient>, config: ExitInterfaceConfig, initial_role: Role) -> Self {
        Self { dataplane, client, config, role: Mutex::new(initial_role) }
    }

    pub async fn current_role(&self) -> Role {
        *self.role.lock().await
    }

    /// Takes the same mutex `transition` holds for the duration of its own
    /// data-plane calls, without changing the role. A caller that touches
    /// this peer's exit interface from outside a transition (the `SETUP_EXIT`
    /// handler, when this peer is acting as someone else's exit) holds the
    /// returned guard for the duration of its own data-plane calls so a role
    /// flip can never race it.
    pub async fn hold_for_exit_dataplane_op(&self) -> tokio::sync::MutexGuard<'_, Role> {
        self.role.lock().await
    }

    /// Moves this peer to `new_role`. A no-op if already in `new_role`.
    /// Standing up or tearing down the exit interface happens only on the
    /// four edges that cross the exit/non-exit boundary (`client<->exit`,
    /// `client<->hybrid`); `exit<->hybrid` changes only the declared role
    /// (spec §4.6 "six edges").
    pub async fn transition(&self, new_role: Role) -> Result<()> {
        let mut current = self.role.lock().await;
        if *current == new_role {
            return Ok(());
        }

        let was_exit = current.requires_exit_interface();
        let now_exit = new_role.requires_exit_interface();

        if !was_exit && now_exit {
            self.stand_up_exit_interface().await?;
        } else if was_exit && !now_exit {
            self.tear_down_exit_interface().await;
        }

        log::info!("role transition {} -> {}", *current, new_role);
        *current = new_role;
        drop(current);

        self.client.rebind_role(new_role);
        Ok(())
    }

    async fn stand_up_exit_interface(&self) -> Result<()> {
        let cfg = &self.config;

        self.dataplane
            .interface_create(&cfg.interface)
            .await
            .map_err(|e| Error::unavailable(format!("interface_create({}): {e}", cfg.interface)))?;

        if let Err(e) = self
            .dataplane
            .interface_configure(&cfg.interface, &cfg.private_key, cfg.listen_port, Some(&cfg.pool_cidr))
            .await
        {
            let _ = self.dataplane.interface_delete(&cfg.interface).await;
            return Err(Error::unavailable(format!("interface_configure({}): {e}", cfg.interface)));
        }

        if let Err(e) = self.dataplane.ip_pool_create(&cfg.pool_name, &cfg.pool_cidr).await {
            let _ = self.dataplane.interface_delete(&cfg.interface).await;
            return Err(Error::unavailable(format!("ip_pool_create({}): {e}", cfg.pool_name)));
        }

        if let Err(e) = self.dataplane.forwarding_enable().await {
            let _ = self.dataplane.interface_delete(&cfg.interface).await;
            return Err(Error::unavailable(format!("forwarding_enable: {e}")));
        }

        if let Err(e) = self.dataplane.nat_add(&cfg.pool_cidr, &cfg.egress_interface).await {
            let _ = self.dataplane.interface_delete(&cfg.interface).await;
            return Err(Error::unavailable(format!("nat_add({} -> {}): {e}", cfg.pool_cidr, cfg.egress_interface)));
        }

        log::info!("exit interface {} stood up, pool {}", cfg.interface, cfg.pool_name);
        Ok(())
    }

    /// Best-effort: every step runs even if an earlier one fails, so a
    /// partially-provisioned interface never lingers past this call.
    async fn tear_down_exit_interface(&self) {
        let cfg = &self.config;

        if let Err(e) = self.dataplane.nat_remove(&cfg.pool_cidr, &cfg.egress_interface).await {
            log::warn!("nat_remove({} -> {}) during teardown: {e}", cfg.pool_cidr, cfg.egress_interface);
        }

        match self.dataplane.peers(&cfg.interface).await {
            Ok(peers) => {
                for peer in peers {
                    if let Err(e) = self.dataplane.peer_remove(&cfg.interface, &peer.public_key).await {
                        log::warn!("peer_remove({}) during teardown: {e}", peer.public_key);
                    }
                }
            }
            Err(e) => log::warn!("could not list peers on {} during teardown: {e}", cfg.interface),
        }

        if let Err(e) = self.dataplane.interface_delete(&cfg.interface).await {
            log::warn!("interface_delete({}) during teardown: {e}", cfg.interface);
        }

        log::info!("exit interface {} torn down", cfg.interface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataplane::MemoryAdapter;

    fn config() -> ExitInterfaceConfig {
        ExitInterfaceConfig {
            interface: "wg-exit0".to_string(),
            egress_interface: "eth0".to_string(),
            private_key: "private-key".to_string(),
            listen_port: Some(51820),
            pool_name: "exit-pool".to_string(),
            pool_cidr: "10.50.0.0/24".to_string(),
        }
    }

    fn client() -> Arc<PeerStreamClient> {
        Arc::new(PeerStreamClient::new(
            crate::client::ClientConfig::new("peer-1", "us", "127.0.0.1:9000"),
            proto::crypto::Keypair::generate(),
            Role::Client,
        ))
    }

    #[tokio::test]
    async fn transition_to_exit_stands_up_interface_and_pool() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let controller = RoleController::new(dataplane.clone(), client(), config(), Role::Client);

        controller.transition(Role::Exit).await.unwrap();

        assert_eq!(controller.current_role().await, Role::Exit);
        assert!(dataplane.peers("wg-exit0").await.is_ok());
        assert!(dataplane.ip_pool_allocate("exit-pool").await.is_ok());
    }

    #[tokio::test]
    async fn transition_back_to_client_tears_down_interface() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let controller = RoleController::new(dataplane.clone(), client(), config(), Role::Client);

        controller.transition(Role::Exit).await.unwrap();
        controller.transition(Role::Client).await.unwrap();

        assert_eq!(controller.current_role().await, Role::Client);
        assert!(dataplane.peers("wg-exit0").await.is_err());
    }

    #[tokio::test]
    async fn exit_to_hybrid_does_not_touch_interface() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let controller = RoleController::new(dataplane.clone(), client(), config(), Role::Client);

        controller.transition(Role::Exit).await.unwrap();
        controller.transition(Role::Hybrid).await.unwrap();

        assert_eq!(controller.current_role().await, Role::Hybrid);
        assert!(dataplane.peers("wg-exit0").await.is_ok());
    }

    #[tokio::test]
    async fn transition_to_same_role_is_a_no_op() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let controller = RoleController::new(dataplane, client(), config(), Role::Client);

        controller.transition(Role::Client).await.unwrap();
        assert_eq!(controller.current_role().await, Role::Client);
    }

    #[tokio::test]
    async fn hold_for_exit_dataplane_op_blocks_a_concurrent_transition() {
        let dataplane: Arc<dyn DataPlane> = Arc::new(MemoryAdapter::default());
        let controller = Arc::new(RoleController::new(dataplane, client(), config(), Role::Exit));
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = controller.hold_for_exit_dataplane_op().await;
        order.lock().await.push("guard-acquired");

        let controller2 = controller.clone();
        let order2 = order.clone();
        let transition = tokio::spawn(async move {
            controller2.transition(Role::Client).await.unwrap();
            order2.lock().await.push("transition-complete");
        });

        // Give the spawned task a chance to run; it should block on the
        // mutex rather than complete while we're still holding the guard.
        tokio::task::yield_now().await;
        assert_eq!(*order.lock().await, vec!["guard-acquired"]);

        order.lock().await.push("guard-released");
        drop(guard);
        transition.await.unwrap();

        assert_eq!(*order.lock().await, vec!["guard-acquired", "guard-released", "transition-complete"]);
        assert_eq!(controller.current_role().await, Role::Client);
    }
}
