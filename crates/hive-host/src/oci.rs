//! OCI registry artifact fetching.
//!
//! [`RegistryFetcher`] pulls single-layer WASM artifacts from an OCI
//! registry. References may carry the `oci://` prefix used by WASI
//! packaging conventions; it is stripped before parsing.

use async_trait::async_trait;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tracing::{debug, instrument};

use hive_common::FetchError;
use hive_core::control::OciFetcher;

const OCI_WASM_MEDIA_TYPE: &str = "application/wasm";
const WASM_MEDIA_TYPE: &str = "application/vnd.wasm.content.layer.v1+wasm";
const WASM_MEDIA_TYPE_LEGACY: &str = "application/vnd.module.wasm.content.layer.v1+wasm";

/// Anonymous OCI registry fetcher for WASM artifacts.
#[derive(Debug, Default)]
pub struct RegistryFetcher;

impl RegistryFetcher {
    /// Create a fetcher.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OciFetcher for RegistryFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, image: &str) -> Result<Vec<u8>, FetchError> {
        let reference_str = image.strip_prefix("oci://").unwrap_or(image);
        let reference: Reference = reference_str.parse().map_err(|e| FetchError::BadArtifact {
            image: image.to_string(),
            reason: format!("invalid reference: {e}"),
        })?;

        let client = Client::default();
        let accepted = vec![
            OCI_WASM_MEDIA_TYPE,
            WASM_MEDIA_TYPE,
            WASM_MEDIA_TYPE_LEGACY,
        ];

        let pulled = client
            .pull(&reference, &RegistryAuth::Anonymous, accepted)
            .await
            .map_err(|e| classify_error(image, &e))?;

        if pulled.layers.len() != 1 {
            return Err(FetchError::BadArtifact {
                image: image.to_string(),
                reason: format!("expected one layer, got {}", pulled.layers.len()),
            });
        }
        let layer = pulled.layers.into_iter().next().ok_or_else(|| {
            FetchError::BadArtifact {
                image: image.to_string(),
                reason: "expected one layer, got none".to_string(),
            }
        })?;

        debug!(image, bytes = layer.data.len(), "Artifact fetched");
        Ok(layer.data)
    }
}

/// Map registry client failures onto the fetch taxonomy.
fn classify_error(
    image: &str,
    error: &oci_distribution::errors::OciDistributionError,
) -> FetchError {
    use oci_distribution::errors::OciDistributionError;

    match error {
        OciDistributionError::AuthenticationFailure(_) => FetchError::AuthFailed {
            image: image.to_string(),
        },
        OciDistributionError::ImageManifestNotFoundError(_) => FetchError::NotFound {
            image: image.to_string(),
        },
        other => FetchError::Network {
            image: image.to_string(),
            reason: other.to_string(),
        },
    }
}
