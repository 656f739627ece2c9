use std::collections::HashMap;

use async_trait::async_trait;

use super::client::{DockerClient, DockerError};
use super::container::{container_state, network_inspect_info};
use crate::endpoint::resolve_endpoint;
use crate::{
    ConnectMode, ContainerSpec, ContainerState, ContainerStatusInfo, Driver, DriverError,
    ImagePullPolicy, RuntimeInstance,
};

/// Local container engine driver. Holds the endpoint-resolution policy
/// alongside the raw Docker client.
pub struct DockerDriver {
    client: DockerClient,
    connect_mode: ConnectMode,
    network: Option<String>,
    host_address: String,
}

impl DockerDriver {
    pub fn new(
        socket_path: &str,
        connect_mode: ConnectMode,
        network: Option<String>,
        host_address: String,
    ) -> Result<Self, DriverError> {
        let client = DockerClient::new(socket_path).map_err(map_err)?;
        Ok(Self { client, connect_mode, network, host_address })
    }
}

fn map_err(e: DockerError) -> DriverError {
    match e {
        DockerError::ContainerNotFound(id) => DriverError::ContainerNotFound(id),
        DockerError::VolumeNotFound(name) => DriverError::VolumeNotFound(name),
        DockerError::ConnectionFailed(msg) => DriverError::Unavailable(msg),
        DockerError::PermissionDenied => DriverError::Backend("permission denied".to_string()),
        DockerError::BollardError(err) => DriverError::Backend(err.to_string()),
    }
}

#[async_trait]
impl Driver for DockerDriver {
    async fn create(
        &self,
        spec: &ContainerSpec,
        labels: HashMap<String, String>,
        pull_policy: ImagePullPolicy,
    ) -> Result<String, DriverError> {
        self.client
            .ensure_image(&spec.image, pull_policy)
            .await
            .map_err(|e| DriverError::ImagePullFailed { image: spec.image.clone(), source: Box::new(map_err(e)) })?;
        self.client.create_container(spec, labels).await.map_err(map_err)
    }

    async fn start(&self, container_id: &str, runtime_port: u16) -> Result<String, DriverError> {
        self.client.start_container(container_id).await.map_err(map_err)?;
        let details = self.client.inspect_container_raw(container_id).await.map_err(map_err)?;
        let info = network_inspect_info(&details);
        resolve_endpoint(
            self.connect_mode,
            &info,
            runtime_port,
            self.network.as_deref(),
            &self.host_address,
        )
        .ok_or_else(|| DriverError::NoEndpoint(container_id.to_string()))
    }

    async fn stop(&self, container_id: &str) -> Result<(), DriverError> {
        self.client.stop_container(container_id, Some(10)).await.map_err(map_err)
    }

    async fn destroy(&self, container_id: &str) -> Result<(), DriverError> {
        self.client.remove_container(container_id, true).await.map_err(map_err)
    }

    async fn status(
        &self,
        container_id: &str,
        runtime_port: Option<u16>,
    ) -> Result<ContainerStatusInfo, DriverError> {
        let details = match self.client.inspect_container_raw(container_id).await {
            Ok(d) => d,
            Err(DockerError::ContainerNotFound(_)) => {
                return Ok(ContainerStatusInfo { state: ContainerState::NotFound, endpoint: None, exit_code: None })
            }
            Err(e) => return Err(map_err(e)),
        };
        let (state, exit_code) = container_state(&details);
        let endpoint = runtime_port.and_then(|port| {
            let info = network_inspect_info(&details);
            resolve_endpoint(self.connect_mode, &info, port, self.network.as_deref(), &self.host_address)
        });
        Ok(ContainerStatusInfo { state, endpoint, exit_code })
    }

    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> Result<(), DriverError> {
        self.client.create_volume(name, labels).await.map_err(map_err)
    }

    async fn delete_volume(&self, name: &str) -> Result<(), DriverError> {
        self.client.remove_volume(name, true).await.map_err(map_err)
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, DriverError> {
        self.client.volume_exists(name).await.map_err(map_err)
    }

    async fn create_network(&self, session_id: &str) -> Result<String, DriverError> {
        self.client.create_network(&format!("bay-net-{session_id}")).await.map_err(map_err)
    }

    async fn remove_network(&self, network_id: &str) -> Result<(), DriverError> {
        self.client.remove_network(network_id).await.map_err(map_err)
    }

    async fn list_runtime_instances(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<RuntimeInstance>, DriverError> {
        let filters: Vec<String> =
            labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let containers = self.client.list_containers(filters).await.map_err(map_err)?;
        Ok(containers
            .into_iter()
            .map(|c| RuntimeInstance { id: c.id, name: c.name, labels: c.labels, state: c.state })
            .collect())
    }

    async fn destroy_runtime_instance(&self, id: &str) -> Result<(), DriverError> {
        self.client.remove_container(id, true).await.map_err(map_err)
    }
}
