// =============================================================================
// MOBMIND CORE — episodes.rs
// «Combat Episode Telemetry & EMA Weight Learning»
// =============================================================================
//
// Кольцевая история боевых эпизодов (моб против игрока) плюс медленное
// EMA-обучение тактических весов по исходу эпизода.
//
// Веса живут в ТОЙ ЖЕ карте mobType → action → w, которую пишет
// деривация из глобальной модели (weights.rs): оба писателя блендят
// в одно состояние, эпизоды могут уводить вес в минус.
// =============================================================================

use crate::constants::{EPISODE_EMA_ALPHA, EPISODE_LOSS_MULT, EPISODE_WIN_MULT, MAX_EPISODE_HISTORY};
use crate::model::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

// -----------------------------------------------------------------------------
// EpisodeRecord — один боевой эпизод
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeRecord {
    pub mob_type: String,
    #[serde(default)]
    pub sample_count: u64,
    #[serde(default)]
    pub episode_reward: f64,
    #[serde(default)]
    pub was_successful: bool,
    #[serde(default)]
    pub damage_dealt: f64,
    #[serde(default)]
    pub damage_taken: f64,
    #[serde(default)]
    pub duration_ticks: u64,
    /// action → сколько раз применено за эпизод
    #[serde(default)]
    pub tactics_used: HashMap<String, u64>,
    #[serde(default)]
    pub timestamp: i64,
}

// -----------------------------------------------------------------------------
// TacticalData — веса и эпизодная история (общая карта обоих писателей)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TacticalData {
    /// mobType → action → вес в [−1, +1]
    pub weights: HashMap<String, HashMap<String, f64>>,
    pub total_episodes: u64,
    pub total_samples: u64,
    pub episodes: VecDeque<EpisodeRecord>,
}

impl TacticalData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Принять эпизод: кольцо, счётчики, EMA-сдвиг весов применённых
    /// действий. Возвращает номер эпизода.
    pub fn ingest(&mut self, mut episode: EpisodeRecord) -> u64 {
        if episode.timestamp == 0 {
            episode.timestamp = now_ms();
        }
        self.total_episodes += 1;
        self.total_samples += episode.sample_count;

        let mult = if episode.was_successful {
            EPISODE_WIN_MULT
        } else {
            EPISODE_LOSS_MULT
        };
        let total_tactics: u64 = episode.tactics_used.values().sum();
        if total_tactics > 0 {
            let mob_weights = self.weights.entry(episode.mob_type.clone()).or_default();
            for (action, &used) in &episode.tactics_used {
                let contribution = (used as f64 / total_tactics as f64) * mult;
                let current = mob_weights.get(action).copied().unwrap_or(0.0);
                let next = current * (1.0 - EPISODE_EMA_ALPHA) + contribution * EPISODE_EMA_ALPHA;
                mob_weights.insert(action.clone(), next.max(-1.0).min(1.0));
            }
        }

        self.episodes.push_back(episode);
        while self.episodes.len() > MAX_EPISODE_HISTORY {
            self.episodes.pop_front();
        }
        self.total_episodes
    }

    /// Сводка для /tactical-stats: по каждому mobType — эпизоды в кольце,
    /// доля побед и средняя награда.
    pub fn summary(&self) -> HashMap<String, MobEpisodeSummary> {
        let mut out: HashMap<String, MobEpisodeSummary> = HashMap::new();
        for ep in &self.episodes {
            let s = out.entry(ep.mob_type.clone()).or_default();
            s.episodes += 1;
            if ep.was_successful {
                s.wins += 1;
            }
            s.total_reward += ep.episode_reward;
        }
        for (mob, s) in out.iter_mut() {
            s.avg_reward = s.total_reward / s.episodes as f64;
            s.win_rate = s.wins as f64 / s.episodes as f64;
            s.tracked_actions = self.weights.get(mob).map(|w| w.len()).unwrap_or(0);
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobEpisodeSummary {
    pub episodes: u64,
    pub wins: u64,
    pub win_rate: f64,
    pub avg_reward: f64,
    pub tracked_actions: usize,
    #[serde(skip)]
    total_reward: f64,
}
