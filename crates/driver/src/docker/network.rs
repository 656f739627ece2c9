//! Network domain — create/remove a per-session bridge network.

use super::client::{DockerClient, DockerError};

impl DockerClient {
    pub async fn create_network(&self, name: &str) -> Result<String, DockerError> {
        use bollard::models::NetworkCreateRequest;

        let config = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            ..Default::default()
        };

        let response = self.client.create_network(config).await?;
        if response.id.is_empty() { Ok(name.to_string()) } else { Ok(response.id) }
    }

    pub async fn remove_network(&self, network_id: &str) -> Result<(), DockerError> {
        match self.client.remove_network(network_id).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(other) => Err(DockerError::from(other)),
        }
    }
}
