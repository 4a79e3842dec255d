//! Reference dependency manager: records which derived objects consumed
//! which named resources (address sets, port groups, template variables,
//! datapaths), so a change to one resource republishes only the objects
//! that actually reference it.

use flowsync_types::uuid::Uuid;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct ObjDepMgr {
    by_resource: HashMap<String, HashSet<Uuid>>,
    by_object: HashMap<Uuid, HashSet<String>>,
}

impl ObjDepMgr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the resource set of `object` with `resources`.
    pub fn record<I, S>(&mut self, object: Uuid, resources: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remove_object(&object);
        let resources: HashSet<String> = resources.into_iter().map(Into::into).collect();
        for resource in &resources {
            self.by_resource
                .entry(resource.clone())
                .or_default()
                .insert(object);
        }
        if !resources.is_empty() {
            self.by_object.insert(object, resources);
        }
    }

    pub fn remove_object(&mut self, object: &Uuid) {
        if let Some(resources) = self.by_object.remove(object) {
            for resource in resources {
                if let Some(objects) = self.by_resource.get_mut(&resource) {
                    objects.remove(object);
                    if objects.is_empty() {
                        self.by_resource.remove(&resource);
                    }
                }
            }
        }
    }

    /// Objects referencing `resource`, in unspecified order.
    pub fn objects_for(&self, resource: &str) -> impl Iterator<Item = Uuid> + '_ {
        self.by_resource.get(resource).into_iter().flatten().copied()
    }

    pub fn has_dependents(&self, resource: &str) -> bool {
        self.by_resource
            .get(resource)
            .is_some_and(|objects| !objects.is_empty())
    }

    pub fn clear(&mut self) {
        self.by_resource.clear();
        self.by_object.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_rerecord() {
        let mut mgr = ObjDepMgr::new();
        let obj = Uuid::new_v4();
        mgr.record(obj, ["as:internal", "pg:web"]);
        assert!(mgr.has_dependents("as:internal"));
        assert_eq!(mgr.objects_for("pg:web").collect::<Vec<_>>(), vec![obj]);

        // Re-recording drops stale references.
        mgr.record(obj, ["as:external"]);
        assert!(!mgr.has_dependents("as:internal"));
        assert!(mgr.has_dependents("as:external"));

        mgr.remove_object(&obj);
        assert!(!mgr.has_dependents("as:external"));
    }
}
