use std::fmt;

use kube::Resource;

/// Namespace/name pair identifying a namespaced object, or a cluster scoped
/// one when `namespace` is empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        ObjectKey {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn cluster_scoped(name: &str) -> Self {
        ObjectKey::new("", name)
    }

    pub fn from_resource<K: Resource>(resource: &K) -> Self {
        ObjectKey {
            namespace: resource.meta().namespace.clone().unwrap_or_default(),
            name: resource.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}
