//! In order to let integration tests drive a coordinator without exec'ing a
//! binary, `startup` is the same entry point `main.rs` calls.

pub mod config;
pub mod rpc;

use std::sync::Arc;

use control::{ConfiguredPolicy, Directory, ExitOrchestrator, RelayConfig, StreamManager};
use dataplane::DataPlane;
use proto::proto::{
    RegisterCoordinatorRequest, control_server::ControlServer, directory_client::DirectoryClient, directory_server::DirectoryServer,
    inter_coordinator_server::InterCoordinatorServer,
};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Endpoint, Server};

use self::{
    config::Config,
    rpc::{ControlService, DirectoryService, InterCoordinatorService},
};

fn dataplane_adapter() -> Arc<dyn dataplane::DataPlane> {
    #[cfg(feature = "os-dataplane")]
    {
        Arc::new(dataplane::OsAdapter::new())
    }

    #[cfg(not(feature = "os-dataplane"))]
    {
        Arc::new(dataplane::MemoryAdapter::new())
    }
}

/// Announces this coordinator to every configured `directory_peers` entry.
/// Best-effort: an unreachable peer is logged and skipped, since the
/// Directory itself converges through each side's periodic re-registration
/// once the peer comes back (spec §4.2 has no startup-ordering requirement).
async fn announce_to_peers(config: &Config) {
    for peer in &config.directory_peers {
        let (address, port) = match config.advertise_address.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
            None => (config.advertise_address.clone(), 0),
        };

        let uri = if peer.address.starts_with("http://") || peer.address.starts_with("https://") {
            peer.address.clone()
        } else {
            format!("http://{}", peer.address)
        };

        let endpoint = match Endpoint::from_shared(uri) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::warn!("malformed directory peer address {}: {e}", peer.address);
                continue;
            }
        };

        let mut client = match endpoint.connect().await {
            Ok(channel) => DirectoryClient::new(channel),
            Err(e) => {
                log::warn!("could not reach directory peer {}: {e}", peer.address);
                continue;
            }
        };

        let request = RegisterCoordinatorRequest {
            coordinator_id: config.coordinator_id.clone(),
            region: config.region.clone(),
            address,
            port,
            current_load: 0,
            max_capacity: config.max_capacity,
        };

        if let Err(status) = client.register_coordinator(request).await {
            log::warn!("directory peer {} rejected registration: {status}", peer.address);
        }
    }
}

pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let stream_manager = Arc::new(StreamManager::default());
    let directory = Arc::new(Directory::new());
    let dataplane = dataplane_adapter();
    let reachability = Arc::new(ConfiguredPolicy { relay_by_default: config.reachability.relay_by_default });

    let relay = config.relay.as_ref();
    let relay_config = RelayConfig {
        relay_iface: relay.map(|r| r.iface.clone()).unwrap_or_default(),
        relay_pool_name: relay.map(|r| r.pool_name.clone()).unwrap_or_default(),
        egress_iface: relay.map(|r| r.egress_iface.clone()).unwrap_or_default(),
        relay_public_endpoint: relay.map(|r| r.public_endpoint.clone()).unwrap_or_default(),
    };

    let orchestrator = Arc::new(ExitOrchestrator::new(
        config.coordinator_id.clone(),
        config.region.clone(),
        stream_manager.clone(),
        directory.clone(),
        dataplane.clone(),
        reachability,
        relay_config,
    ));

    let cancellation = CancellationToken::new();
    tokio::spawn(
        stream_manager
            .clone()
            .run_sweeper(control::stream_manager::SESSION_SWEEP_INTERVAL, cancellation.clone()),
    );
    tokio::spawn(directory.clone().run_sweeper(
        control::directory::DIRECTORY_SWEEP_INTERVAL,
        control::directory::DIRECTORY_TTL,
        cancellation.clone(),
    ));

    if let Some(relay) = relay {
        if let Err(e) = dataplane.interface_create(&relay.iface).await {
            log::warn!("relay interface_create({}): {e}", relay.iface);
        }
        if let Err(e) = dataplane.ip_pool_create(&relay.pool_name, &relay.pool_cidr).await {
            log::warn!("relay ip_pool_create({}, {}): {e}", relay.pool_name, relay.pool_cidr);
        }
    }

    directory.register(&config.coordinator_id, &config.region, &config.advertise_address, 0, config.max_capacity);
    announce_to_peers(&config).await;

    log::info!(
        "vpnctl-coordinator coordinator_id={} region={} listening on {}",
        config.coordinator_id,
        config.region,
        config.bind
    );

    let control_server: ControlServer<ControlService> =
        ControlService::new(stream_manager, orchestrator.clone(), config.coordinator_id.clone()).into_server();
    let directory_server: DirectoryServer<DirectoryService> = DirectoryService::new(directory).into_server();
    let inter_coordinator_server: InterCoordinatorServer<InterCoordinatorService> = InterCoordinatorService::new(orchestrator).into_server();

    Server::builder()
        .add_service(control_server)
        .add_service(directory_server)
        .add_service(inter_coordinator_server)
        .serve(config.bind)
        .await?;

    Ok(())
}
