// =============================================================================
// MOBMIND CORE — tiers.rs
// «Tier Progression Merge»
// =============================================================================
//
// Прогресс обучения мобов по серверам: experience и тир на mobType.
// Слияние — чистый max-wins CRDT: выигрывает больший experience,
// тир следует за победителем. Безопасно при любом порядке прихода.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// -----------------------------------------------------------------------------
// MobTier — ступень обученности моба
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MobTier {
    Untrained,
    Learning,
    Trained,
    Expert,
    Master,
}

impl Default for MobTier {
    fn default() -> Self {
        MobTier::Untrained
    }
}

// -----------------------------------------------------------------------------
// TierState — experience и тиры всех мобов
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierState {
    pub experience: HashMap<String, u64>,
    pub tiers: HashMap<String, MobTier>,
}

impl TierState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Слить входящий снапшот: на каждый mobType больший experience
    /// замещает и experience, и тир. Возвращает число обновлённых мобов.
    pub fn merge(&mut self, incoming: &TierState) -> usize {
        let mut updated = 0;
        for (mob, &exp) in &incoming.experience {
            let current = self.experience.get(mob).copied().unwrap_or(0);
            if exp > current {
                self.experience.insert(mob.clone(), exp);
                self.tiers.insert(
                    mob.clone(),
                    incoming.tiers.get(mob).copied().unwrap_or_default(),
                );
                updated += 1;
            }
        }
        updated
    }
}
