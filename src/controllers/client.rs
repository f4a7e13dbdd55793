use async_trait::async_trait;
use kube::api::PostParams;
use kube::{Api, Client};
use log::debug;
#[cfg(test)]
use mockall::automock;

use crate::models::key::ObjectKey;
use crate::models::queue::Queue;
use crate::models::workload::Workload;
use crate::utils::error::Error;

/// Kubernetes API writes the reconcilers make. Objects are read from the
/// watch stores instead.
///
/// Status writes carry the resourceVersion of the object they were computed
/// from, so a concurrent writer makes them fail with a conflict instead of
/// being overwritten.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn replace_workload_status(&self, workload: &Workload) -> Result<(), Error>;

    async fn replace_queue_status(&self, queue: &Queue) -> Result<(), Error>;
}

/// `KubeClient` over a live API server.
pub struct KubeApiClient {
    client: Client,
}

impl KubeApiClient {
    pub fn new(client: Client) -> Self {
        KubeApiClient { client }
    }
}

fn namespace_of(key: &ObjectKey) -> Result<&str, Error> {
    if key.namespace.is_empty() {
        return Err(Error::MissingNamespace(key.to_string()));
    }
    Ok(&key.namespace)
}

#[async_trait]
impl KubeClient for KubeApiClient {
    async fn replace_workload_status(&self, workload: &Workload) -> Result<(), Error> {
        let key = workload.key();
        debug!("Updating status of Workload {}", key);

        let api: Api<Workload> = Api::namespaced(self.client.clone(), namespace_of(&key)?);
        let data = serde_json::to_vec(workload)?;
        api.replace_status(&key.name, &PostParams::default(), data).await?;
        Ok(())
    }

    async fn replace_queue_status(&self, queue: &Queue) -> Result<(), Error> {
        let key = queue.key();
        debug!("Updating status of Queue {}", key);

        let api: Api<Queue> = Api::namespaced(self.client.clone(), namespace_of(&key)?);
        let data = serde_json::to_vec(queue)?;
        api.replace_status(&key.name, &PostParams::default(), data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::namespace_of;
    use crate::models::key::ObjectKey;

    #[test]
    fn namespaced_calls_require_namespace() {
        assert!(namespace_of(&ObjectKey::cluster_scoped("q1")).is_err());
        assert_eq!(namespace_of(&ObjectKey::new("default", "q1")).unwrap(), "default");
    }
}
