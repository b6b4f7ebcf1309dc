// =============================================================================
// MOBMIND CORE — config.rs
// «Brain Configuration»
// =============================================================================
//
// Иммутабельная конфигурация агрегации и деривации весов.
// Загружается из env один раз при старте процесса; каждое числовое
// значение зажимается в допустимый диапазон. Непарсимое значение —
// warn и дефолт.
// =============================================================================

use serde::{Deserialize, Serialize};

pub const DEFAULT_MOMENTUM: f64 = 0.25;
pub const DEFAULT_PRIOR_A: f64 = 2.0;
pub const DEFAULT_PRIOR_B: f64 = 2.0;
pub const DEFAULT_IQR_K: f64 = 2.5;
pub const DEFAULT_MAX_ACTIONS: usize = 64;
pub const DEFAULT_WEIGHT_BLEND: f64 = 0.35;
pub const DEFAULT_WEIGHT_LR: f64 = 0.08;
pub const DEFAULT_SOFTMAX_TEMP: f64 = 0.85;
pub const DEFAULT_MIN_MODELS: usize = 3;
pub const DEFAULT_AGG_INTERVAL_SECS: u64 = 300;

// -----------------------------------------------------------------------------
// BrainConfig — все ручки агрегатора и дериватора весов
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrainConfig {
    /// Вес предыдущего раунда при блендинге [0, 0.95]
    pub momentum: f64,
    /// Beta(a, b) prior на successRate [0, 25]
    pub prior_a: f64,
    pub prior_b: f64,
    /// Ширина забора Тьюки [0, 10]
    pub iqr_k: f64,
    /// Лимит действий на моба [8, 256]
    pub max_actions: usize,
    /// Доля softmax-веса в первой ступени бленда [0, 1]
    pub weight_blend: f64,
    /// Скорость обучения второй ступени [0, 1]
    pub weight_lr: f64,
    /// Температура softmax [0.05, 3]
    pub softmax_temp: f64,
    /// Минимум вкладов для закрытия раунда [1, 64]
    pub min_models: usize,
    /// Минимальный интервал между агрегациями, сек [0, 86400]
    pub agg_interval_secs: u64,
}

impl Default for BrainConfig {
    fn default() -> Self {
        BrainConfig {
            momentum: DEFAULT_MOMENTUM,
            prior_a: DEFAULT_PRIOR_A,
            prior_b: DEFAULT_PRIOR_B,
            iqr_k: DEFAULT_IQR_K,
            max_actions: DEFAULT_MAX_ACTIONS,
            weight_blend: DEFAULT_WEIGHT_BLEND,
            weight_lr: DEFAULT_WEIGHT_LR,
            softmax_temp: DEFAULT_SOFTMAX_TEMP,
            min_models: DEFAULT_MIN_MODELS,
            agg_interval_secs: DEFAULT_AGG_INTERVAL_SECS,
        }
    }
}

impl BrainConfig {
    /// Чтение конфигурации из env. Формат: BRAIN_* переменные,
    /// отсутствующие — дефолт, вне диапазона — clamp с warn.
    pub fn from_env() -> Self {
        BrainConfig {
            momentum: env_f64("BRAIN_MOMENTUM", DEFAULT_MOMENTUM, 0.0, 0.95),
            prior_a: env_f64("BRAIN_PRIOR_A", DEFAULT_PRIOR_A, 0.0, 25.0),
            prior_b: env_f64("BRAIN_PRIOR_B", DEFAULT_PRIOR_B, 0.0, 25.0),
            iqr_k: env_f64("BRAIN_OUTLIER_IQR_K", DEFAULT_IQR_K, 0.0, 10.0),
            max_actions: env_usize("BRAIN_MAX_ACTIONS", DEFAULT_MAX_ACTIONS, 8, 256),
            weight_blend: env_f64("BRAIN_WEIGHT_BLEND", DEFAULT_WEIGHT_BLEND, 0.0, 1.0),
            weight_lr: env_f64("BRAIN_WEIGHT_LR", DEFAULT_WEIGHT_LR, 0.0, 1.0),
            softmax_temp: env_f64("BRAIN_SOFTMAX_TEMP", DEFAULT_SOFTMAX_TEMP, 0.05, 3.0),
            min_models: env_usize("BRAIN_MIN_MODELS", DEFAULT_MIN_MODELS, 1, 64),
            agg_interval_secs: env_u64(
                "BRAIN_AGG_INTERVAL_SECS",
                DEFAULT_AGG_INTERVAL_SECS,
                0,
                86400,
            ),
        }
    }
}

fn env_f64(name: &str, default: f64, min: f64, max: f64) -> f64 {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => {
                let clamped = v.max(min).min(max);
                if clamped != v {
                    log::warn!("{}={} вне диапазона [{}, {}], clamp до {}", name, v, min, max, clamped);
                }
                clamped
            }
            _ => {
                log::warn!("{} не парсится ({}), дефолт {}", name, raw, default);
                default
            }
        },
    }
}

fn env_usize(name: &str, default: usize, min: usize, max: usize) -> usize {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(v) => {
                let clamped = v.max(min).min(max);
                if clamped != v {
                    log::warn!("{}={} вне диапазона [{}, {}], clamp до {}", name, v, min, max, clamped);
                }
                clamped
            }
            _ => {
                log::warn!("{} не парсится ({}), дефолт {}", name, raw, default);
                default
            }
        },
    }
}

fn env_u64(name: &str, default: u64, min: u64, max: u64) -> u64 {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) => {
                let clamped = v.max(min).min(max);
                if clamped != v {
                    log::warn!("{}={} вне диапазона [{}, {}], clamp до {}", name, v, min, max, clamped);
                }
                clamped
            }
            _ => {
                log::warn!("{} не парсится ({}), дефолт {}", name, raw, default);
                default
            }
        },
    }
}
