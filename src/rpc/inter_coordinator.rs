//! The `InterCoordinator` service: the remote/exit side of the two-coordinator
//! exit-allocation protocol (spec §4.5 step 2). A thin proxy over
//! [`control::ExitOrchestrator::handle_allocate_exit_peer`], which never
//! returns `Err` — every outcome, including "no exit session available", is
//! reported through `AllocateExitPeerResponse.success`.

use std::sync::Arc;

use control::ExitOrchestrator;
use proto::proto::{
    AllocateExitPeerRequest, AllocateExitPeerResponse,
    inter_coordinator_server::{InterCoordinator, InterCoordinatorServer},
};
use tonic::{Request, Response, Status};

pub struct InterCoordinatorService {
    orchestrator: Arc<ExitOrchestrator>,
}

impl InterCoordinatorService {
    pub fn new(orchestrator: Arc<ExitOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn into_server(self) -> InterCoordinatorServer<Self> {
        InterCoordinatorServer::new(self)
    }
}

#[tonic::async_trait]
impl InterCoordinator for InterCoordinatorService {
    async fn allocate_exit_peer(&self, request: Request<AllocateExitPeerRequest>) -> Result<Response<AllocateExitPeerResponse>, Status> {
        let response = self.orchestrator.handle_allocate_exit_peer(request.into_inner()).await;
        Ok(Response::new(response))
    }
}
