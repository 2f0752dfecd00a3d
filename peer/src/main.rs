#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod config;
mod handlers;

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use config::Config;
use dataplane::{DataPlane, MemoryAdapter};
use ed25519_dalek::SigningKey;
use proto::{crypto::Keypair, proto::CommandType};
use sdk::{ClientConfig, ExitInterfaceConfig, PeerStreamClient, Role, RoleController};

fn load_keypair(config: &Config) -> anyhow::Result<Keypair> {
    let bytes = STANDARD.decode(&config.identity.auth_private_key_b64)?;
    let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| anyhow::anyhow!("auth_private_key_b64 must decode to 32 bytes"))?;
    Ok(Keypair { signing_key: SigningKey::from_bytes(&bytes) })
}

fn exit_interface_config(config: &Config) -> Option<ExitInterfaceConfig> {
    config.exit.as_ref().map(|exit| ExitInterfaceConfig {
        interface: exit.interface.clone(),
        egress_interface: exit.egress_interface.clone(),
        private_key: exit.private_key.clone(),
        listen_port: exit.listen_port,
        pool_name: exit.pool_name.clone(),
        pool_cidr: exit.pool_cidr.clone(),
    })
}

#[cfg(feature = "os-dataplane")]
fn dataplane_adapter() -> Arc<dyn DataPlane> {
    Arc::new(dataplane::OsAdapter::new())
}

#[cfg(not(feature = "os-dataplane"))]
fn dataplane_adapter() -> Arc<dyn DataPlane> {
    Arc::new(MemoryAdapter::new())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let role: Role = config.initial_role.parse().map_err(|e| anyhow::anyhow!("invalid initial-role: {e:?}"))?;
    let keypair = load_keypair(&config)?;
    let dataplane = dataplane_adapter();

    let client_config = ClientConfig::new(config.peer_id.clone(), config.region.clone(), config.coordinator_address.clone());
    let client = Arc::new(PeerStreamClient::new(client_config, keypair, role));

    // `role_controller` is kept alive for the whole process (not just this
    // function's startup sequence): it backs `ChangeRoleHandler`, the
    // runtime trigger for spec §4.6's "peers may transition between roles
    // at runtime" (Scenario F). Without an `exit` section in config there is
    // no interface to ever stand up, so there is nothing for a role
    // transition to do and no controller is built.
    let role_controller = if let Some(exit) = &config.exit {
        let exit_config = exit_interface_config(&config).expect("exit_interface_config mirrors config.exit");
        let controller = Arc::new(RoleController::new(dataplane.clone(), client.clone(), exit_config, Role::Client));

        let public_key = exit.public_key.clone();
        let endpoint = exit.public_endpoint.clone();
        client.register_command_handler(
            CommandType::SetupExit,
            Arc::new(handlers::SetupExitHandler::new(
                dataplane.clone(),
                exit.interface.clone(),
                exit.pool_name.clone(),
                endpoint,
                public_key,
                controller.clone(),
            )),
        );
        client.register_command_handler(CommandType::RelaySetup, Arc::new(handlers::RelaySetupHandler::new(dataplane.clone(), exit.interface.clone())));
        client.register_command_handler(CommandType::Disconnect, Arc::new(handlers::DisconnectHandler::new(dataplane.clone(), exit.interface.clone())));
        client.register_command_handler(CommandType::ChangeRole, Arc::new(handlers::ChangeRoleHandler::new(controller.clone())));

        Some(controller)
    } else {
        None
    };

    client.register_command_handler(
        CommandType::RotatePeer,
        Arc::new(handlers::RotatePeerHandler::new(dataplane.clone(), config.client_interface.clone())),
    );

    if let Some(controller) = &role_controller {
        if let Err(e) = controller.transition(role).await {
            log::warn!("could not stand up exit interface for initial role {role}: {e}");
        }
    }

    client.start();
    log::info!("peer_id={} region={} connecting to {}", config.peer_id, config.region, config.coordinator_address);

    std::future::pending::<()>().await
}
