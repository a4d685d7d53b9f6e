//! The `Resource` trait and the untyped storage representation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ApiError, ObjectKey, ObjectMeta};

/// A typed kind stored in the object store.
///
/// Every kind is `{ metadata, spec, status }`. Implementations are generated
/// with `impl_resource!`.
pub trait Resource:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind tag stored alongside every object of this type.
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Store key of this object.
    fn key(&self) -> ObjectKey {
        let meta = self.metadata();
        ObjectKey::new(Self::KIND, meta.namespace.clone(), meta.name.clone())
    }
}

macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl $crate::Resource for $ty {
            const KIND: &'static str = $kind;

            fn metadata(&self) -> &$crate::ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut $crate::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

pub(crate) use impl_resource;

/// An object of any kind, with `spec` and `status` left as raw JSON.
///
/// This is what the store persists and streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicObject {
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: Value,
}

impl DynamicObject {
    /// Convert a typed resource into its storage form.
    pub fn from_resource<K: Resource>(resource: &K) -> Result<Self, ApiError> {
        let mut value = serde_json::to_value(resource)?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| ApiError::Invalid(format!("{} is not a JSON object", K::KIND)))?;
        let spec = map.remove("spec").unwrap_or(Value::Null);
        let status = map.remove("status").unwrap_or(Value::Null);
        Ok(Self {
            kind: K::KIND.to_string(),
            metadata: resource.metadata().clone(),
            spec,
            status,
        })
    }

    /// Convert back into a typed resource, checking the kind tag.
    pub fn into_resource<K: Resource>(self) -> Result<K, ApiError> {
        if self.kind != K::KIND {
            return Err(ApiError::KindMismatch {
                expected: K::KIND,
                actual: self.kind,
            });
        }
        let mut map = serde_json::Map::new();
        map.insert("metadata".to_string(), serde_json::to_value(&self.metadata)?);
        map.insert("spec".to_string(), self.spec);
        if !self.status.is_null() {
            map.insert("status".to_string(), self.status);
        }
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.kind.clone(),
            self.metadata.namespace.clone(),
            self.metadata.name.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Lease, LeaseSpec, Node, Pod};

    #[test]
    fn test_dynamic_roundtrip_keeps_status() {
        let mut pod = Pod::new("default", "web");
        pod.status.nominated_node_name = Some("a".to_string());

        let dynamic = DynamicObject::from_resource(&pod).unwrap();
        assert_eq!(dynamic.kind, "Pod");
        assert_eq!(dynamic.status["nominatedNodeName"], "a");

        let back: Pod = dynamic.into_resource().unwrap();
        assert_eq!(back, pod);
    }

    #[test]
    fn test_kind_mismatch() {
        let dynamic = DynamicObject::from_resource(&Node::new("a")).unwrap();
        let err = dynamic.into_resource::<Pod>().unwrap_err();
        assert!(matches!(err, ApiError::KindMismatch { expected: "Pod", .. }));
    }

    #[test]
    fn test_unit_status_roundtrip() {
        let lease = Lease::new("kube-system", "scheduler", LeaseSpec::default());
        let dynamic = DynamicObject::from_resource(&lease).unwrap();
        let back: Lease = dynamic.into_resource().unwrap();
        assert_eq!(back.metadata.name, "scheduler");
    }

    #[test]
    fn test_key() {
        let pod = Pod::new("default", "web");
        assert_eq!(pod.key(), ObjectKey::new("Pod", "default", "web"));
        let dynamic = DynamicObject::from_resource(&pod).unwrap();
        assert_eq!(dynamic.key(), pod.key());
    }
}
