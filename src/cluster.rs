use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use thiserror::Error;
use tracing::info;

use crate::config::ClientCaConfig;

#[derive(Debug, Error)]
pub enum ClientCaError {
    #[error("failed to create in-cluster client: {0}")]
    Client(#[source] kube::Error),
    #[error("failed to fetch configmap {namespace}/{name}: {source}")]
    Fetch {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[error("cannot find key '{key}' in configmap {namespace}/{name}")]
    MissingKey {
        namespace: String,
        name: String,
        key: String,
    },
}

/// Reads the API server's request-header client CA bundle from the cluster.
/// Called once at startup.
pub async fn fetch_client_ca(config: &ClientCaConfig) -> Result<String, ClientCaError> {
    let client = Client::try_default().await.map_err(ClientCaError::Client)?;
    let config_maps: Api<ConfigMap> = Api::namespaced(client, &config.namespace);

    let config_map = config_maps
        .get(&config.config_map)
        .await
        .map_err(|source| ClientCaError::Fetch {
            namespace: config.namespace.clone(),
            name: config.config_map.clone(),
            source,
        })?;

    let pem = client_ca_from(&config_map, config)?;
    info!(
        namespace = %config.namespace,
        config_map = %config.config_map,
        key = %config.key,
        bytes = pem.len(),
        "loaded client CA bundle"
    );
    Ok(pem)
}

fn client_ca_from(config_map: &ConfigMap, config: &ClientCaConfig) -> Result<String, ClientCaError> {
    config_map
        .data
        .as_ref()
        .and_then(|data| data.get(&config.key))
        .cloned()
        .ok_or_else(|| ClientCaError::MissingKey {
            namespace: config.namespace.clone(),
            name: config.config_map.clone(),
            key: config.key.clone(),
        })
}
