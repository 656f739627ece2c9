//! Container domain — create, inspect, lifecycle.

use std::collections::HashMap;

use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding as BollardPortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};

use super::client::{DockerClient, DockerError};
use super::inventory::ContainerInfo;
use crate::endpoint::{NetworkInspectInfo, PortBinding};
use crate::{ContainerSpec, VolumeMount};

impl DockerClient {
    pub async fn list_containers(
        &self,
        label_filters: Vec<String>,
    ) -> Result<Vec<ContainerInfo>, DockerError> {
        let mut filters = HashMap::new();
        if !label_filters.is_empty() {
            filters.insert("label".to_string(), label_filters);
        }
        let options = Some(ListContainersOptions { all: true, filters: Some(filters), ..Default::default() });
        let containers = self.client.list_containers(options).await?;
        Ok(containers.into_iter().map(ContainerInfo::from).collect())
    }

    pub async fn create_container(
        &self,
        spec: &ContainerSpec,
        labels: HashMap<String, String>,
    ) -> Result<String, DockerError> {
        use bollard::models::ContainerCreateBody;

        let binds: Vec<String> = spec
            .volume_mounts
            .iter()
            .map(|m: &VolumeMount| {
                let mode = if m.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", m.volume_name, m.mount_path, mode)
            })
            .collect();

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            network_mode: spec.network.clone(),
            nano_cpus: spec.cpu_limit.map(|c| (c * 1_000_000_000.0) as i64),
            memory: spec.memory_limit_mb.map(|mb| (mb as i64) * 1024 * 1024),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let response = self.client.create_container(options, config).await?;
        Ok(response.id)
    }

    pub async fn start_container(&self, container_id: &str) -> Result<(), DockerError> {
        self.client
            .start_container(container_id, None::<StartContainerOptions>)
            .await
            .map_err(|e| map_not_found(container_id, e))
    }

    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout_secs: Option<i32>,
    ) -> Result<(), DockerError> {
        let options = timeout_secs.map(|t| StopContainerOptions { t: Some(t), ..Default::default() });
        self.client
            .stop_container(container_id, options)
            .await
            .map_err(|e| map_not_found(container_id, e))
    }

    pub async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
    ) -> Result<(), DockerError> {
        let options = Some(RemoveContainerOptions { force, v: false, ..Default::default() });
        match self.client.remove_container(container_id, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(other) => Err(DockerError::from(other)),
        }
    }

    pub async fn inspect_container_raw(
        &self,
        id: &str,
    ) -> Result<ContainerInspectResponse, DockerError> {
        match self.client.inspect_container(id, None::<InspectContainerOptions>).await {
            Ok(info) => Ok(info),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Err(DockerError::ContainerNotFound(id.to_string()))
            }
            Err(other) => Err(DockerError::from(other)),
        }
    }
}

fn map_not_found(container_id: &str, e: bollard::errors::Error) -> DockerError {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
            DockerError::ContainerNotFound(container_id.to_string())
        }
        other => DockerError::BollardError(other),
    }
}

/// Build the pure-function input for endpoint resolution out of a full
/// inspect response, with Docker's nested `Option`s collapsed.
pub fn network_inspect_info(details: &ContainerInspectResponse) -> NetworkInspectInfo {
    let networks = details
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.as_ref())
        .map(|nets| {
            nets.iter()
                .filter_map(|(name, settings)| {
                    settings.ip_address.clone().filter(|ip| !ip.is_empty()).map(|ip| (name.clone(), ip))
                })
                .collect()
        })
        .unwrap_or_default();

    let ports = details
        .network_settings
        .as_ref()
        .and_then(|ns| ns.ports.as_ref())
        .map(|port_map| {
            port_map
                .iter()
                .map(|(port_key, bindings)| {
                    let converted: Vec<PortBinding> = bindings
                        .as_deref()
                        .unwrap_or(&[])
                        .iter()
                        .map(|b: &BollardPortBinding| PortBinding {
                            host_ip: b.host_ip.clone(),
                            host_port: b.host_port.clone(),
                        })
                        .collect();
                    (port_key.clone(), converted)
                })
                .collect()
        })
        .unwrap_or_default();

    NetworkInspectInfo { networks, ports }
}

pub fn container_state(details: &ContainerInspectResponse) -> (crate::ContainerState, Option<i32>) {
    let status = details.state.as_ref().and_then(|s| s.status.as_ref());
    let exit_code = details.state.as_ref().and_then(|s| s.exit_code).map(|c| c as i32);
    let state = match status.map(|s| s.to_string()).as_deref() {
        Some("running") => crate::ContainerState::Running,
        Some("created") => crate::ContainerState::Created,
        Some("exited") | Some("dead") => crate::ContainerState::Exited,
        _ => crate::ContainerState::NotFound,
    };
    (state, exit_code)
}
