//! Volume domain — create, remove, existence check.

use std::collections::HashMap;

use super::client::{DockerClient, DockerError};

impl DockerClient {
    pub async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), DockerError> {
        use bollard::models::VolumeCreateRequest;

        let config = VolumeCreateRequest {
            name: Some(name.to_string()),
            driver: Some("local".to_string()),
            labels: Some(labels),
            ..Default::default()
        };

        self.client.create_volume(config).await?;
        Ok(())
    }

    pub async fn remove_volume(&self, name: &str, force: bool) -> Result<(), DockerError> {
        use bollard::query_parameters::RemoveVolumeOptions;

        let options = Some(RemoveVolumeOptions { force });
        match self.client.remove_volume(name, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(other) => Err(DockerError::from(other)),
        }
    }

    pub async fn volume_exists(&self, name: &str) -> Result<bool, DockerError> {
        match self.client.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(other) => Err(DockerError::from(other)),
        }
    }
}
