//! Model sets and inventory
//!
//! [`ModelSetSelector`] picks the minimal models a request needs so lighter
//! tiers never wait on downloads they will not use. Sets are cumulative:
//! every tier includes everything the tiers below it need.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::classifier::Tier;

/// Default general-purpose checkpoint
pub const BASE_CHECKPOINT: &str = "dreamshaper_8.safetensors";
/// Photoreal checkpoint added from Medium up
pub const REALISM_CHECKPOINT: &str = "RealVisXL_V5.0.safetensors";
/// AnimateDiff motion module added at Ultra
pub const MOTION_MODULE: &str = "mm_sd_v15_v2.ckpt";
/// Checkpoint for NSFW workloads
pub const NSFW_CHECKPOINT: &str = "ponyDiffusionV6XL.safetensors";
/// LoRA paired with the NSFW checkpoint
pub const NSFW_LORA: &str = "pony_realism_v2.1.safetensors";

/// Models an instance must have on disk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSet {
    /// Checkpoint files
    pub checkpoints: BTreeSet<String>,
    /// LoRA files
    pub loras: BTreeSet<String>,
    /// Motion modules
    pub motion_modules: BTreeSet<String>,
}

impl ModelSet {
    /// Total number of files
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.len() + self.loras.len() + self.motion_modules.len()
    }

    /// No files at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every file in `other` is also in `self`
    #[must_use]
    pub fn covers(&self, other: &ModelSet) -> bool {
        other.checkpoints.is_subset(&self.checkpoints)
            && other.loras.is_subset(&self.loras)
            && other.motion_modules.is_subset(&self.motion_modules)
    }
}

/// Chooses the models a `(tier, nsfw)` pair needs
#[derive(Clone, Copy, Debug, Default)]
pub struct ModelSetSelector;

impl ModelSetSelector {
    /// Minimal model set
    #[must_use]
    pub fn select(&self, tier: Tier, nsfw: bool) -> ModelSet {
        let mut set = ModelSet::default();
        set.checkpoints.insert(BASE_CHECKPOINT.to_string());
        if tier >= Tier::Medium {
            set.checkpoints.insert(REALISM_CHECKPOINT.to_string());
        }
        if tier >= Tier::Ultra {
            set.motion_modules.insert(MOTION_MODULE.to_string());
        }
        if nsfw {
            set.checkpoints.insert(NSFW_CHECKPOINT.to_string());
            set.loras.insert(NSFW_LORA.to_string());
        }
        set
    }

    /// Everything any request could need
    #[must_use]
    pub fn full(&self) -> ModelSet {
        self.select(Tier::Ultra, true)
    }
}

/// Read-only view of installed models
pub trait ModelInventory: Send + Sync {
    /// Installed checkpoint identifiers
    fn checkpoints(&self) -> BTreeSet<String>;
    /// Installed LoRA identifiers
    fn loras(&self) -> BTreeSet<String>;
}

/// A fixed inventory snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    /// Installed checkpoints
    pub checkpoints: BTreeSet<String>,
    /// Installed LoRAs
    pub loras: BTreeSet<String>,
}

impl InventorySnapshot {
    /// Build from lists
    pub fn new<C, L>(checkpoints: C, loras: L) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        L: IntoIterator,
        L::Item: Into<String>,
    {
        Self {
            checkpoints: checkpoints.into_iter().map(Into::into).collect(),
            loras: loras.into_iter().map(Into::into).collect(),
        }
    }

    /// What an instance provisioned with `set` will have
    #[must_use]
    pub fn from_model_set(set: &ModelSet) -> Self {
        Self {
            checkpoints: set.checkpoints.clone(),
            loras: set.loras.clone(),
        }
    }
}

impl ModelInventory for InventorySnapshot {
    fn checkpoints(&self) -> BTreeSet<String> {
        self.checkpoints.clone()
    }

    fn loras(&self) -> BTreeSet<String> {
        self.loras.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sets_are_cumulative() {
        let selector = ModelSetSelector;
        let basic = selector.select(Tier::Basic, false);
        let medium = selector.select(Tier::Medium, false);
        let ultra = selector.select(Tier::Ultra, false);

        assert_eq!(basic.len(), 1);
        assert!(medium.covers(&basic));
        assert!(ultra.covers(&medium));
        assert!(ultra.motion_modules.contains(MOTION_MODULE));
        assert!(!medium.motion_modules.contains(MOTION_MODULE));
    }

    #[test]
    fn test_nsfw_adds_pony_stack() {
        let set = ModelSetSelector.select(Tier::Basic, true);
        assert!(set.checkpoints.contains(NSFW_CHECKPOINT));
        assert!(set.loras.contains(NSFW_LORA));
        assert!(!ModelSetSelector.select(Tier::Ultra, false).loras.contains(NSFW_LORA));
    }

    #[test]
    fn test_snapshot_from_full_set() {
        let inventory = InventorySnapshot::from_model_set(&ModelSetSelector.full());
        assert!(inventory.checkpoints().contains(BASE_CHECKPOINT));
        assert!(inventory.checkpoints().contains(NSFW_CHECKPOINT));
        assert!(inventory.loras().contains(NSFW_LORA));
    }
}
