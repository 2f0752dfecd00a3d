//! The `Directory` service: coordinator registration and candidate lookup
//! (spec §4.2, component C2's wire-facing half). [`control::Directory`]
//! stores one `address` string per entry; this module is the only place that
//! splits it into the wire's separate `address`/`port` fields and back.

use std::sync::Arc;

use control::{Directory, DirectoryEntry};
use proto::proto::{
    CandidatesRequest, CandidatesResponse, CoordinatorInfo, ListAllRequest, ListAllResponse, RegisterCoordinatorRequest,
    RegisterCoordinatorResponse,
    directory_server::{Directory as DirectoryRpc, DirectoryServer},
};
use tonic::{Request, Response, Status};

pub struct DirectoryService {
    directory: Arc<Directory>,
}

impl DirectoryService {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }

    pub fn into_server(self) -> DirectoryServer<Self> {
        DirectoryServer::new(self)
    }
}

#[tonic::async_trait]
impl DirectoryRpc for DirectoryService {
    async fn register_coordinator(&self, request: Request<RegisterCoordinatorRequest>) -> Result<Response<RegisterCoordinatorResponse>, Status> {
        let request = request.into_inner();
        if request.coordinator_id.is_empty() || request.region.is_empty() || request.address.is_empty() {
            return Err(Status::invalid_argument("coordinator_id, region, and address are required"));
        }

        let address = join_host_port(&request.address, request.port);
        self.directory
            .register(&request.coordinator_id, &request.region, &address, request.current_load, request.max_capacity);

        Ok(Response::new(RegisterCoordinatorResponse { success: true, message: String::new() }))
    }

    async fn candidates(&self, request: Request<CandidatesRequest>) -> Result<Response<CandidatesResponse>, Status> {
        let request = request.into_inner();
        let candidates = self
            .directory
            .candidates(&request.target_region)
            .into_iter()
            .filter(|c| c.coordinator_id != request.requesting_coordinator_id)
            .map(into_coordinator_info)
            .collect();

        Ok(Response::new(CandidatesResponse { candidates }))
    }

    async fn list_all(&self, _request: Request<ListAllRequest>) -> Result<Response<ListAllResponse>, Status> {
        let coordinators = self.directory.list_all().into_iter().map(into_coordinator_info).collect();
        Ok(Response::new(ListAllResponse { coordinators }))
    }
}

fn into_coordinator_info(entry: DirectoryEntry) -> CoordinatorInfo {
    let (address, port) = split_host_port(&entry.address);
    CoordinatorInfo {
        coordinator_id: entry.coordinator_id,
        region: entry.region,
        address,
        port,
        current_load: entry.load,
        max_capacity: entry.capacity,
    }
}

fn join_host_port(address: &str, port: u32) -> String {
    format!("{address}:{port}")
}

fn split_host_port(address: &str) -> (String, u32) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (address.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_round_trips() {
        let joined = join_host_port("10.0.0.1", 9000);
        assert_eq!(joined, "10.0.0.1:9000");
        assert_eq!(split_host_port(&joined), ("10.0.0.1".to_string(), 9000));
    }

    #[test]
    fn split_falls_back_to_port_zero_without_a_colon() {
        assert_eq!(split_host_port("10.0.0.1"), ("10.0.0.1".to_string(), 0));
    }
}
