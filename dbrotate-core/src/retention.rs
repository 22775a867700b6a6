/*!
Retention stores.

A retention store owns the three tiers of one backup set in one place (the
local backup root or the remote one). Tier membership is rebuilt on open by
listing the backend's tier directories and parsing file names; from then on
the in-memory [`Inventory`] is kept in step with every write the store makes.

Admission is planned on a copy of the inventory first, then applied:
entries are installed for every tier the artifact ends up a member of, and
the planned evictions are removed. Because each tier holds its own entry, a
payload physically disappears from the store exactly when its last tier
entry is removed.
*/

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactName, Tier, TierSet};
use crate::classifier;
use crate::config::RetentionPolicy;
use crate::storage::{StoreBackend, StoreKind};
use crate::Result;

/// Per-tier members of one store, each tier ordered oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    tiers: BTreeMap<Tier, Vec<ArtifactName>>,
}

impl Inventory {
    /// Members of `tier`, oldest first
    pub fn members(&self, tier: Tier) -> &[ArtifactName] {
        self.tiers.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tiers that currently reference `name`
    pub fn tiers_of(&self, name: &ArtifactName) -> TierSet {
        Tier::ALL
            .into_iter()
            .filter(|tier| self.members(*tier).contains(name))
            .collect()
    }

    /// Whether `name` is a member of any tier
    pub fn contains(&self, name: &ArtifactName) -> bool {
        !self.tiers_of(name).is_empty()
    }

    /// Every distinct artifact held by the store, oldest first
    pub fn artifacts(&self) -> Vec<ArtifactName> {
        let mut all: Vec<ArtifactName> = self.tiers.values().flatten().cloned().collect();
        all.sort();
        all.dedup();
        all
    }

    /// Total number of tier entries
    pub fn entry_count(&self) -> usize {
        self.tiers.values().map(Vec::len).sum()
    }

    /// Add `name` to `tier`, keeping the tier ordered
    ///
    /// Returns false if it was already a member.
    pub fn insert(&mut self, tier: Tier, name: ArtifactName) -> bool {
        let members = self.tiers.entry(tier).or_default();
        match members.binary_search(&name) {
            Ok(_) => false,
            Err(pos) => {
                members.insert(pos, name);
                true
            }
        }
    }

    /// Drop `name` from `tier`
    pub fn remove(&mut self, tier: Tier, name: &ArtifactName) -> bool {
        match self.tiers.get_mut(&tier) {
            Some(members) => match members.binary_search(name) {
                Ok(pos) => {
                    members.remove(pos);
                    true
                }
                Err(_) => false,
            },
            None => false,
        }
    }

    /// A name for `name` that no member of this store already uses
    ///
    /// Artifacts captured in the same millisecond get increasing sequence
    /// numbers, so they still order by insertion.
    pub fn unique_name(&self, name: &ArtifactName) -> ArtifactName {
        let taken = self
            .tiers
            .values()
            .flatten()
            .filter(|m| m.set_key == name.set_key && m.captured_at == name.captured_at)
            .map(|m| m.seq)
            .max();
        match taken {
            Some(seq) if seq >= name.seq => name.clone().with_seq(seq + 1),
            _ => name.clone(),
        }
    }

    /// Plan the admission of `name` into `joining` without touching anything
    ///
    /// Every tier is trimmed to its capacity, not only the ones being joined,
    /// so lowering a capacity takes effect at the next admission.
    pub fn plan(&self, name: &ArtifactName, joining: &TierSet, policy: &RetentionPolicy) -> EvictionReport {
        let mut report = EvictionReport::default();
        if joining.is_empty() {
            return report;
        }

        let mut after = self.clone();
        for tier in joining.iter() {
            after.insert(tier, name.clone());
        }

        for tier in Tier::ALL {
            let capacity = policy.capacity(tier);
            while after.members(tier).len() > capacity {
                let oldest = after.members(tier)[0].clone();
                after.remove(tier, &oldest);
                report.evicted.push(Eviction {
                    tier,
                    artifact: oldest.file_name(),
                });
                report.evicted_names.push((tier, oldest));
            }
        }

        report.joined = after.tiers_of(name);
        if !report.joined.is_empty() {
            report.admitted_as = Some(name.file_name());
        }

        let mut deleted: Vec<ArtifactName> = report
            .evicted_names
            .iter()
            .map(|(_, n)| n.clone())
            .filter(|n| n != name && !after.contains(n))
            .collect();
        deleted.sort();
        deleted.dedup();
        report.deleted = deleted.iter().map(ArtifactName::file_name).collect();
        report
    }
}

/// A single membership removed by an admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eviction {
    pub tier: Tier,
    /// File name of the evicted member
    pub artifact: String,
}

/// Outcome of one admission into a store.
///
/// Informational only: evictions and deletions are never errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// File name the artifact was stored under, if it joined any tier
    pub admitted_as: Option<String>,
    /// Tiers the artifact is a member of after admission
    pub joined: TierSet,
    /// Memberships removed, in the order they were removed
    pub evicted: Vec<Eviction>,
    /// Artifacts whose payload left the store
    pub deleted: Vec<String>,
    #[serde(skip)]
    evicted_names: Vec<(Tier, ArtifactName)>,
}

impl EvictionReport {
    /// Whether the admission changed nothing
    pub fn is_noop(&self) -> bool {
        self.admitted_as.is_none() && self.evicted.is_empty()
    }
}

/// The tiers of one backup set in one store.
pub struct RetentionStore<B: StoreBackend> {
    backend: B,
    policy: RetentionPolicy,
    set_key: String,
    inventory: Inventory,
}

impl<B: StoreBackend> RetentionStore<B> {
    /// Open the store, rebuilding tier membership from the backend
    ///
    /// Files that do not parse as artifact names, and artifacts of other
    /// backup sets, are ignored and never evicted.
    ///
    /// # Errors
    /// `BackupError::StoreIo` if a tier cannot be listed
    pub async fn open<S: Into<String>>(backend: B, policy: RetentionPolicy, set_key: S) -> Result<Self> {
        let set_key = set_key.into();
        let mut inventory = Inventory::default();
        let mut ignored = 0usize;

        for tier in Tier::ALL {
            for file_name in backend.list(tier).await? {
                match ArtifactName::parse(&file_name) {
                    Some(name) if name.set_key == set_key => {
                        inventory.insert(tier, name);
                    }
                    _ => ignored += 1,
                }
            }
        }

        debug!(
            store = %backend.kind(),
            location = %backend.location(),
            set = %set_key,
            entries = inventory.entry_count(),
            ignored,
            "opened retention store"
        );

        Ok(Self {
            backend,
            policy,
            set_key,
            inventory,
        })
    }

    pub fn kind(&self) -> StoreKind {
        self.backend.kind()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn set_key(&self) -> &str {
        &self.set_key
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Tiers an artifact captured at `captured_at` would join in this store
    pub fn classify(&self, captured_at: DateTime<Utc>) -> TierSet {
        classifier::classify(captured_at, &self.inventory, &self.policy)
    }

    /// Dry admission: what `admit` would do, with nothing written
    pub fn plan(&self, name: &ArtifactName, joining: &TierSet) -> EvictionReport {
        let name = self.inventory.unique_name(name);
        self.inventory.plan(&name, joining, &self.policy)
    }

    /// Admit `artifact` into `joining` and evict what no longer fits
    ///
    /// The artifact's payload is read from `artifact.payload_ref`. An empty
    /// `joining` set is a no-op.
    ///
    /// # Errors
    /// `BackupError::StoreIo` if an entry cannot be installed or removed.
    /// Entries already written stay in place and are picked up by the next
    /// open.
    pub async fn admit(&mut self, artifact: &Artifact, joining: &TierSet) -> Result<EvictionReport> {
        if joining.is_empty() {
            debug!(store = %self.kind(), artifact = %artifact.name, "nothing to admit");
            return Ok(EvictionReport::default());
        }

        let name = self.inventory.unique_name(&artifact.name);
        if name != artifact.name {
            warn!(
                store = %self.kind(),
                requested = %artifact.name,
                stored_as = %name,
                "artifact name already taken, using next sequence number"
            );
        }
        let report = self.inventory.plan(&name, joining, &self.policy);
        let file_name = name.file_name();

        for tier in report.joined.iter() {
            self.backend
                .install(&artifact.payload_ref, tier, &file_name)
                .await?;
            self.inventory.insert(tier, name.clone());
            debug!(store = %self.kind(), %tier, artifact = %file_name, "joined tier");
        }

        for (tier, evicted) in &report.evicted_names {
            self.backend.remove(*tier, &evicted.file_name()).await?;
            self.inventory.remove(*tier, evicted);
            debug!(store = %self.kind(), %tier, artifact = %evicted, "evicted");
        }

        info!(
            store = %self.kind(),
            artifact = %file_name,
            tiers = %report.joined,
            evicted = report.evicted.len(),
            deleted = report.deleted.len(),
            "admitted"
        );
        Ok(report)
    }

    /// Remove temporaries left by interrupted installs
    pub async fn sweep_partials(&self) -> Result<usize> {
        let removed = self.backend.sweep_partials().await?;
        if removed > 0 {
            warn!(store = %self.kind(), removed, "removed leftovers of an interrupted run");
        }
        Ok(removed)
    }
}
