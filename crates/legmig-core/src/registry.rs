use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::Config;
use crate::error::MigrationError;
use crate::migrator::Migrator;
use crate::migrators::TableCopy;

/// Group name reserved for listing groups.
pub const RESERVED_GROUP: &str = "show";

/// Compile-time migrator registration collected with `inventory`.
///
/// ```ignore
/// inventory::submit! {
///     legmig_core::MigratorRegistration { name: "users", build: || Arc::new(Users) }
/// }
/// ```
pub struct MigratorRegistration {
    pub name: &'static str,
    pub build: fn() -> Arc<dyn Migrator>,
}

inventory::collect!(MigratorRegistration);

/// Maps stable migrator names to implementations.
#[derive(Clone, Default)]
pub struct Registry {
    migrators: BTreeMap<String, Arc<dyn Migrator>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, migrator: Arc<dyn Migrator>) -> Result<(), MigrationError> {
        let name = migrator.name().to_string();
        if name.trim().is_empty() {
            return Err(MigrationError::Registry("migrator name is empty".into()));
        }
        if migrator.group().eq_ignore_ascii_case(RESERVED_GROUP) {
            return Err(MigrationError::Registry(format!(
                "[{name}] uses the reserved group `{RESERVED_GROUP}`"
            )));
        }
        if self.migrators.contains_key(&name) {
            return Err(MigrationError::Registry(format!(
                "[{name}] is registered twice"
            )));
        }
        self.migrators.insert(name, migrator);
        Ok(())
    }

    /// Everything submitted through [`MigratorRegistration`].
    pub fn from_inventory() -> Result<Self, MigrationError> {
        let mut registry = Self::new();
        for reg in inventory::iter::<MigratorRegistration> {
            let migrator = (reg.build)();
            if migrator.name() != reg.name {
                return Err(MigrationError::Registry(format!(
                    "registration `{}` built a migrator named `{}`",
                    reg.name,
                    migrator.name()
                )));
            }
            registry.register(migrator)?;
        }
        Ok(registry)
    }

    /// Inventory registrations plus `[[table_copy]]` entries from config.
    pub fn load(cfg: &Config) -> Result<Self, MigrationError> {
        let mut registry = Self::from_inventory()?;
        for entry in &cfg.table_copy {
            let migrator = TableCopy::from_config(entry)
                .map_err(|e| MigrationError::Registry(format!("[{}]: {e:#}", entry.name)))?;
            registry.register(Arc::new(migrator))?;
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Migrator>> {
        self.migrators.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn Migrator>, MigrationError> {
        self.get(name)
            .ok_or_else(|| MigrationError::UnknownMigrator(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.migrators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrators.is_empty()
    }

    /// Run order: names from `sequence` first, then `queue_index` holders in
    /// their slots (a taken slot shifts to the next free one), then the rest
    /// by name.
    pub fn ordered(&self, sequence: &[String]) -> Vec<Arc<dyn Migrator>> {
        let mut placed: HashSet<&str> = HashSet::new();
        let mut out: Vec<Arc<dyn Migrator>> = Vec::with_capacity(self.migrators.len());

        for name in sequence {
            if let Some(m) = self.migrators.get(name) {
                if placed.insert(name.as_str()) {
                    out.push(m.clone());
                }
            }
        }

        let mut slots: BTreeMap<u64, Arc<dyn Migrator>> = BTreeMap::new();
        for (name, m) in &self.migrators {
            if placed.contains(name.as_str()) {
                continue;
            }
            let Some(index) = m.queue_index() else {
                continue;
            };
            let mut slot = u64::from(index.saturating_sub(1));
            while slots.contains_key(&slot) {
                slot += 1;
            }
            slots.insert(slot, m.clone());
            placed.insert(name.as_str());
        }
        out.extend(slots.into_values());

        out.extend(
            self.migrators
                .iter()
                .filter(|(name, _)| !placed.contains(name.as_str()))
                .map(|(_, m)| m.clone()),
        );
        out
    }

    /// Group name to ordered member names.
    pub fn groups(&self, sequence: &[String]) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for m in self.ordered(sequence) {
            groups
                .entry(m.group().to_string())
                .or_default()
                .push(m.name().to_string());
        }
        groups
    }

    pub fn in_group(&self, group: &str, sequence: &[String]) -> Vec<Arc<dyn Migrator>> {
        self.ordered(sequence)
            .into_iter()
            .filter(|m| m.group() == group)
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.migrators.keys()).finish()
    }
}
