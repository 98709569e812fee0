use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rpb_contracts::{Chassis, ErrorKind, FaultKind, Host};

const CHASSIS_ID_PREFIX: &str = "chassis:";
const SEED_DIMENSIONS: &str = "20in x 30in x 17in";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    DuplicateName(String),
    HasActiveRelations(String),
    NotFound(String),
    InvalidRecord(&'static str),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        self.fault().into()
    }

    /// Fault recorded on a tracked task that this error ended.
    pub fn fault(&self) -> FaultKind {
        match self {
            StoreError::DuplicateName(_) => FaultKind::DuplicateName,
            StoreError::HasActiveRelations(_) => FaultKind::HasActiveRelations,
            StoreError::NotFound(_) => FaultKind::NotFound,
            StoreError::InvalidRecord(_) => FaultKind::InvalidArgument,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateName(name) => {
                write!(f, "the chassis with name '{}' already exists", name)
            }
            StoreError::HasActiveRelations(id) => {
                write!(f, "chassis {} cannot be deleted because it has related hosts", id)
            }
            StoreError::NotFound(id) => write!(f, "chassis object with the id '{}' does not exist", id),
            StoreError::InvalidRecord(reason) => write!(f, "invalid chassis record: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of reconciling one host's chassis relations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Desired chassis ids that name no current record.
    pub unknown: Vec<String>,
}

impl Reconciliation {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    chassis: BTreeMap<String, Chassis>,
    hosts: BTreeMap<String, Host>,
    next_index: u64,
}

impl StoreInner {
    fn name_taken(&self, name: &str, except_id: Option<&str>) -> bool {
        self.chassis
            .values()
            .any(|c| c.name == name && Some(c.id.as_str()) != except_id)
    }

    fn link(&mut self, chassis_id: &str, host_id: &str) {
        if let Some(chassis) = self.chassis.get_mut(chassis_id) {
            chassis.related_host_ids.insert(host_id.to_string());
        }
        self.hosts
            .entry(host_id.to_string())
            .or_insert_with(|| Host {
                id: host_id.to_string(),
                related_chassis_ids: BTreeSet::new(),
            })
            .related_chassis_ids
            .insert(chassis_id.to_string());
    }

    fn unlink(&mut self, chassis_id: &str, host_id: &str) {
        if let Some(chassis) = self.chassis.get_mut(chassis_id) {
            chassis.related_host_ids.remove(host_id);
        }
        if let Some(host) = self.hosts.get_mut(host_id) {
            host.related_chassis_ids.remove(chassis_id);
        }
    }
}

/// In-memory chassis records and their many-to-many relation with hosts.
///
/// Every mutation runs under one write lock, so the duplicate-name check and
/// the relation invariant (a host id appears in a chassis' list iff that
/// chassis id appears in the host's list) hold between calls. Readers get
/// cloned snapshots.
#[derive(Clone, Default)]
pub struct ChassisStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ChassisStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `count` inactive demo records.
    pub fn with_seed_data(count: usize) -> Self {
        let store = Self::new();
        for i in 0..count {
            let seeded = store.create(Chassis {
                id: String::new(),
                name: format!("Chassis {}", i),
                dimensions: SEED_DIMENSIONS.to_string(),
                server_type: format!("Server_Type {}", i),
                is_active: false,
                related_host_ids: BTreeSet::new(),
            });
            if let Err(err) = seeded {
                tracing::warn!(error = %err, "skipping seed chassis");
            }
        }
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn list(&self) -> Vec<Chassis> {
        self.read().chassis.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Chassis> {
        self.read().chassis.get(id).cloned()
    }

    pub fn get_host(&self, host_id: &str) -> Option<Host> {
        self.read().hosts.get(host_id).cloned()
    }

    /// Every host that has ever been related to a chassis, including hosts
    /// whose relations have since been cleared.
    pub fn list_hosts(&self) -> Vec<Host> {
        self.read().hosts.values().cloned().collect()
    }

    /// Host records on the other side of `chassis_id`'s relation.
    pub fn related_hosts(&self, chassis_id: &str) -> Result<Vec<Host>, StoreError> {
        let inner = self.read();
        let chassis = inner
            .chassis
            .get(chassis_id)
            .ok_or_else(|| StoreError::NotFound(chassis_id.to_string()))?;
        Ok(chassis
            .related_host_ids
            .iter()
            .filter_map(|host_id| inner.hosts.get(host_id).cloned())
            .collect())
    }

    pub fn related_chassis(&self, host_id: &str) -> Vec<Chassis> {
        self.read()
            .chassis
            .values()
            .filter(|c| c.related_host_ids.contains(host_id))
            .cloned()
            .collect()
    }

    /// Adds a record under a freshly generated id. Relations supplied by the
    /// caller are ignored; they are only changed through [`reconcile`] and
    /// [`set_related_hosts`].
    ///
    /// [`reconcile`]: Self::reconcile
    /// [`set_related_hosts`]: Self::set_related_hosts
    pub fn create(&self, chassis: Chassis) -> Result<Chassis, StoreError> {
        if chassis.name.trim().is_empty() {
            return Err(StoreError::InvalidRecord("name must be non-empty"));
        }

        let mut inner = self.write();
        if inner.name_taken(&chassis.name, None) {
            return Err(StoreError::DuplicateName(chassis.name));
        }

        let id = format!("{}{}", CHASSIS_ID_PREFIX, inner.next_index);
        inner.next_index += 1;

        let record = Chassis {
            id: id.clone(),
            related_host_ids: BTreeSet::new(),
            ..chassis
        };
        inner.chassis.insert(id, record.clone());
        Ok(record)
    }

    /// Replaces the attributes of an existing record. The relation list is
    /// kept from the stored record.
    pub fn update(&self, chassis: Chassis) -> Result<Chassis, StoreError> {
        if chassis.name.trim().is_empty() {
            return Err(StoreError::InvalidRecord("name must be non-empty"));
        }

        let mut inner = self.write();
        let Some(existing) = inner.chassis.get(&chassis.id) else {
            return Err(StoreError::NotFound(chassis.id));
        };

        if existing.name != chassis.name && inner.name_taken(&chassis.name, Some(&chassis.id)) {
            return Err(StoreError::DuplicateName(chassis.name));
        }

        let record = Chassis {
            related_host_ids: existing.related_host_ids.clone(),
            ..chassis
        };
        inner.chassis.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn delete(&self, id: &str) -> Result<Chassis, StoreError> {
        let mut inner = self.write();
        let Some(existing) = inner.chassis.get(id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };

        if !existing.related_host_ids.is_empty() {
            return Err(StoreError::HasActiveRelations(id.to_string()));
        }

        inner
            .chassis
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Brings every chassis' relation with `host_id` in line with
    /// `desired_chassis_ids`, touching only the records whose membership
    /// differs. The host's own list is updated alongside.
    pub fn reconcile(&self, host_id: &str, desired_chassis_ids: &BTreeSet<String>) -> Reconciliation {
        let mut inner = self.write();
        let mut out = Reconciliation::default();

        let current = inner
            .chassis
            .values()
            .map(|c| (c.id.clone(), c.related_host_ids.contains(host_id)))
            .collect::<Vec<_>>();

        for (chassis_id, related) in current {
            let wanted = desired_chassis_ids.contains(&chassis_id);
            if wanted && !related {
                inner.link(&chassis_id, host_id);
                out.added.push(chassis_id);
            } else if related && !wanted {
                inner.unlink(&chassis_id, host_id);
                out.removed.push(chassis_id);
            }
        }

        out.unknown = desired_chassis_ids
            .iter()
            .filter(|id| !inner.chassis.contains_key(*id))
            .cloned()
            .collect();

        out
    }

    /// Sets the full host list of one chassis, mirroring each added or
    /// removed host on the host side. Returns whether anything changed.
    pub fn set_related_hosts(&self, chassis_id: &str, host_ids: &BTreeSet<String>) -> Result<bool, StoreError> {
        let mut inner = self.write();
        let Some(existing) = inner.chassis.get(chassis_id) else {
            return Err(StoreError::NotFound(chassis_id.to_string()));
        };

        if &existing.related_host_ids == host_ids {
            return Ok(false);
        }

        let removed = existing
            .related_host_ids
            .difference(host_ids)
            .cloned()
            .collect::<Vec<_>>();
        let added = host_ids
            .difference(&existing.related_host_ids)
            .cloned()
            .collect::<Vec<_>>();

        for host_id in removed {
            inner.unlink(chassis_id, &host_id);
        }
        for host_id in added {
            inner.link(chassis_id, &host_id);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chassis(name: &str) -> Chassis {
        Chassis {
            id: String::new(),
            name: name.to_string(),
            dimensions: SEED_DIMENSIONS.to_string(),
            server_type: "Server_Type X".to_string(),
            is_active: true,
            related_host_ids: BTreeSet::new(),
        }
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn seed_data_creates_sequential_ids() {
        let store = ChassisStore::with_seed_data(4);
        let all = store.list();
        assert_eq!(all.len(), 4);
        assert_eq!(store.get("chassis:0").unwrap().name, "Chassis 0");
        assert_eq!(store.get("chassis:3").unwrap().server_type, "Server_Type 3");
        assert!(all.iter().all(|c| !c.is_active));
    }

    #[test]
    fn create_ignores_client_supplied_id_and_relations() {
        let store = ChassisStore::new();
        let mut input = chassis("Rack-1");
        input.id = "forged".to_string();
        input.related_host_ids = ids(&["host-1"]);

        let created = store.create(input).expect("create should succeed");
        assert_eq!(created.id, "chassis:0");
        assert!(created.related_host_ids.is_empty());
        assert!(store.get_host("host-1").is_none());
    }

    #[test]
    fn create_rejects_blank_name() {
        let store = ChassisStore::new();
        let err = store.create(chassis("  ")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn duplicate_name_is_case_sensitive() {
        let store = ChassisStore::new();
        store.create(chassis("Rack-1")).unwrap();
        store
            .create(chassis("rack-1"))
            .expect("names differing in case are distinct");
    }

    #[test]
    fn update_keeps_name_when_unchanged_and_preserves_relations() {
        let store = ChassisStore::new();
        let created = store.create(chassis("Rack-1")).unwrap();
        store.reconcile("host-1", &ids(&[created.id.as_str()]));

        let mut edit = created.clone();
        edit.dimensions = "1x1x1".to_string();
        edit.related_host_ids = BTreeSet::new();
        let updated = store.update(edit).expect("same-name update should succeed");

        assert_eq!(updated.dimensions, "1x1x1");
        assert_eq!(updated.related_host_ids, ids(&["host-1"]));
    }

    #[test]
    fn update_rejects_rename_onto_existing_name() {
        let store = ChassisStore::new();
        store.create(chassis("Rack-1")).unwrap();
        let second = store.create(chassis("Rack-2")).unwrap();

        let mut edit = second;
        edit.name = "Rack-1".to_string();
        assert_eq!(
            store.update(edit).unwrap_err(),
            StoreError::DuplicateName("Rack-1".to_string())
        );
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let store = ChassisStore::new();
        let mut edit = chassis("Rack-9");
        edit.id = "chassis:42".to_string();
        assert_eq!(
            store.update(edit).unwrap_err(),
            StoreError::NotFound("chassis:42".to_string())
        );
    }

    #[test]
    fn reconcile_only_touches_differing_records() {
        let store = ChassisStore::with_seed_data(3);
        let first = store.reconcile("host-1", &ids(&["chassis:0", "chassis:1"]));
        assert_eq!(first.added, vec!["chassis:0", "chassis:1"]);
        assert!(first.removed.is_empty());

        let second = store.reconcile("host-1", &ids(&["chassis:1", "chassis:2", "chassis:77"]));
        assert_eq!(second.added, vec!["chassis:2"]);
        assert_eq!(second.removed, vec!["chassis:0"]);
        assert_eq!(second.unknown, vec!["chassis:77"]);

        let host = store.get_host("host-1").unwrap();
        assert_eq!(host.related_chassis_ids, ids(&["chassis:1", "chassis:2"]));

        let unchanged = store.reconcile("host-1", &ids(&["chassis:1", "chassis:2"]));
        assert!(!unchanged.changed());
    }

    #[test]
    fn reconcile_leaves_other_hosts_alone() {
        let store = ChassisStore::with_seed_data(1);
        store.reconcile("host-1", &ids(&["chassis:0"]));
        store.reconcile("host-2", &ids(&["chassis:0"]));
        store.reconcile("host-1", &BTreeSet::new());

        assert_eq!(store.get("chassis:0").unwrap().related_host_ids, ids(&["host-2"]));
        assert!(store.get_host("host-1").unwrap().related_chassis_ids.is_empty());
    }

    #[test]
    fn set_related_hosts_mirrors_host_side() {
        let store = ChassisStore::with_seed_data(1);
        assert!(store.set_related_hosts("chassis:0", &ids(&["h1", "h2"])).unwrap());
        assert!(!store.set_related_hosts("chassis:0", &ids(&["h1", "h2"])).unwrap());
        assert!(store.set_related_hosts("chassis:0", &ids(&["h2", "h3"])).unwrap());

        assert!(store.get_host("h1").unwrap().related_chassis_ids.is_empty());
        assert_eq!(store.get_host("h3").unwrap().related_chassis_ids, ids(&["chassis:0"]));
        assert_eq!(
            store.related_chassis("h2").into_iter().map(|c| c.id).collect::<Vec<_>>(),
            vec!["chassis:0"]
        );
    }

    #[test]
    fn related_hosts_reads_the_host_side() {
        let store = ChassisStore::with_seed_data(2);
        store.reconcile("h1", &ids(&["chassis:0", "chassis:1"]));
        store.reconcile("h2", &ids(&["chassis:1"]));

        let hosts = store.related_hosts("chassis:1").unwrap();
        assert_eq!(hosts.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), vec!["h1", "h2"]);
        assert_eq!(hosts[0].related_chassis_ids, ids(&["chassis:0", "chassis:1"]));
        assert_eq!(
            store.related_hosts("chassis:9").unwrap_err(),
            StoreError::NotFound("chassis:9".to_string())
        );

        store.reconcile("h2", &BTreeSet::new());
        assert_eq!(store.list_hosts().len(), 2);
        assert_eq!(store.related_hosts("chassis:1").unwrap().len(), 1);
    }
}
