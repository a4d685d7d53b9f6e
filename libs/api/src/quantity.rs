//! Resource quantities.
//!
//! CPU is tracked in millicores, memory in bytes and pods as a count.

use serde::{Deserialize, Serialize};

/// Named resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Memory,
    Pods,
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Memory => write!(f, "memory"),
            Self::Pods => write!(f, "pods"),
        }
    }
}

/// A vector of resource quantities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    /// CPU in millicores.
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes.
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub pods: u64,
}

impl ResourceList {
    pub const fn new(cpu_millis: u64, memory_bytes: u64, pods: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            pods,
        }
    }

    pub fn get(&self, name: ResourceName) -> u64 {
        match name {
            ResourceName::Cpu => self.cpu_millis,
            ResourceName::Memory => self.memory_bytes,
            ResourceName::Pods => self.pods,
        }
    }

    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            pods: self.pods.saturating_add(other.pods),
        }
    }

    #[must_use]
    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            pods: self.pods.saturating_sub(other.pods),
        }
    }

    /// Dimensions where `request` exceeds what is left of `self` after `used`.
    pub fn insufficient(&self, used: &Self, request: &Self) -> Vec<ResourceName> {
        [ResourceName::Cpu, ResourceName::Memory, ResourceName::Pods]
            .into_iter()
            .filter(|&name| {
                let free = self.get(name).saturating_sub(used.get(name));
                request.get(name) > free
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn resources(max: u64) -> impl Strategy<Value = ResourceList> {
        (0..=max, 0..=max, 0..=max).prop_map(|(c, m, p)| ResourceList::new(c, m, p))
    }

    #[test]
    fn test_add_and_sub() {
        let a = ResourceList::new(500, 1024, 1);
        let b = ResourceList::new(250, 2048, 1);
        assert_eq!(a.add(&b), ResourceList::new(750, 3072, 2));
        assert_eq!(a.saturating_sub(&b), ResourceList::new(250, 0, 0));
    }

    #[test]
    fn test_insufficient_reports_each_dimension() {
        let allocatable = ResourceList::new(1000, 4096, 10);
        let used = ResourceList::new(800, 1024, 10);
        let request = ResourceList::new(300, 1024, 1);
        assert_eq!(
            allocatable.insufficient(&used, &request),
            vec![ResourceName::Cpu, ResourceName::Pods]
        );
    }

    #[test]
    fn test_exact_fit_is_sufficient() {
        let allocatable = ResourceList::new(1000, 4096, 10);
        let used = ResourceList::new(500, 2048, 9);
        let request = ResourceList::new(500, 2048, 1);
        assert!(allocatable.insufficient(&used, &request).is_empty());
    }

    proptest! {
        #[test]
        fn prop_sub_undoes_add(a in resources(u64::MAX / 2), b in resources(u64::MAX / 2)) {
            prop_assert_eq!(a.add(&b).saturating_sub(&b), a);
        }

        #[test]
        fn prop_sub_never_wraps(a in resources(u64::MAX), b in resources(u64::MAX)) {
            let left = a.saturating_sub(&b);
            for name in [ResourceName::Cpu, ResourceName::Memory, ResourceName::Pods] {
                prop_assert!(left.get(name) <= a.get(name));
                prop_assert_eq!(left.get(name), a.get(name).checked_sub(b.get(name)).unwrap_or(0));
            }
        }

        #[test]
        fn prop_add_saturates(a in resources(u64::MAX), b in resources(u64::MAX)) {
            let sum = a.add(&b);
            prop_assert!(sum.cpu_millis >= a.cpu_millis.max(b.cpu_millis));
            prop_assert!(sum.memory_bytes >= a.memory_bytes.max(b.memory_bytes));
            prop_assert!(sum.pods >= a.pods.max(b.pods));
        }

        #[test]
        fn prop_fits_iff_sum_within_allocatable(
            allocatable in resources(1 << 40),
            used in resources(1 << 40),
            request in resources(1 << 40),
        ) {
            let short = allocatable.insufficient(&used, &request);
            for name in [ResourceName::Cpu, ResourceName::Memory, ResourceName::Pods] {
                let fits = used.get(name) + request.get(name) <= allocatable.get(name)
                    || request.get(name) == 0;
                prop_assert_eq!(!short.contains(&name), fits);
            }
        }

        #[test]
        fn prop_json_round_trip(list in resources(u64::MAX)) {
            let json = serde_json::to_string(&list).unwrap();
            prop_assert_eq!(serde_json::from_str::<ResourceList>(&json).unwrap(), list);
        }
    }
}
