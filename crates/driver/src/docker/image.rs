//! Image domain — pull, honoring the configured pull policy.

use futures_util::stream::StreamExt;

use super::client::{DockerClient, DockerError};
use crate::ImagePullPolicy;

impl DockerClient {
    pub async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(other) => Err(DockerError::from(other)),
        }
    }

    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        use bollard::query_parameters::CreateImageOptions;

        let (from_image, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));

        let options = Some(CreateImageOptions {
            from_image: Some(from_image.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => tracing::debug!(status = ?info.status, "image pull progress"),
                Err(e) => return Err(DockerError::from(e)),
            }
        }
        Ok(())
    }

    /// Ensure `image` is available locally according to `policy`, pulling if needed.
    pub async fn ensure_image(&self, image: &str, policy: ImagePullPolicy) -> Result<(), DockerError> {
        match policy {
            ImagePullPolicy::Never => Ok(()),
            ImagePullPolicy::Always => self.pull_image(image).await,
            ImagePullPolicy::IfNotPresent => {
                if self.image_exists(image).await? {
                    Ok(())
                } else {
                    self.pull_image(image).await
                }
            }
        }
    }
}
