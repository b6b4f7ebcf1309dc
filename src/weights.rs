// =============================================================================
// MOBMIND CORE — weights.rs
// «Tactical Weight Derivation»
// =============================================================================
//
// Чистая функция: агрегированные тактики моба → распределение весов
// действий, пригодное клиентам напрямую (bias выбора действия).
//
//   score(A) = (0.55·(2·sr − 1) + 0.45·tanh(reward / 8)) · ln(1 + count)
//   softmax с температурой, затем двухступенчатый бленд с текущими весами.
//
// Веса живут в [−1, +1]: отрицательные значения осмысленны, потому что
// эпизодное обучение (episodes.rs) пишет в ту же карту и может увести
// вес действия в минус.
// =============================================================================

use crate::config::BrainConfig;
use crate::model::TacticTable;
use std::collections::HashMap;

/// Веса компонент скоринга: successRate против reward
const SCORE_RATE_SHARE: f64 = 0.55;
const SCORE_REWARD_SHARE: f64 = 0.45;

/// Нормировка reward внутри tanh
const REWARD_TANH_SCALE: f64 = 8.0;

/// Предохранитель экспоненты softmax
const MAX_SOFTMAX_EXPONENT: f64 = 50.0;

/// score действия по его агрегированной статистике
fn action_score(sr: f64, avg_reward: f64, count: f64) -> f64 {
    let rate_term = SCORE_RATE_SHARE * (2.0 * sr - 1.0);
    let reward_term = SCORE_REWARD_SHARE * (avg_reward / REWARD_TANH_SCALE).tanh();
    (rate_term + reward_term) * (1.0 + count).ln()
}

/// softmax с температурой и вычитанием максимума (численная стабильность)
fn softmax(scores: &[(String, f64)], temp: f64) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    if scores.is_empty() {
        return out;
    }
    let max_score = scores
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    let mut exps: Vec<(String, f64)> = Vec::with_capacity(scores.len());
    for (name, score) in scores {
        let exponent = ((score - max_score) / temp)
            .max(-MAX_SOFTMAX_EXPONENT)
            .min(MAX_SOFTMAX_EXPONENT);
        let e = exponent.exp();
        sum += e;
        exps.push((name.clone(), e));
    }
    for (name, e) in exps {
        out.insert(name, e / sum);
    }
    out
}

// -----------------------------------------------------------------------------
// derive_weights — обновление весов моба по свежей агрегации
// -----------------------------------------------------------------------------

/// Вернуть обновлённую карту весов моба. Действия вне свежей таблицы
/// сохраняют текущий вес (их трогает только эпизодное обучение).
pub fn derive_weights(
    mob_tactics: &TacticTable,
    current: &HashMap<String, f64>,
    cfg: &BrainConfig,
) -> HashMap<String, f64> {
    let scores: Vec<(String, f64)> = mob_tactics
        .iter()
        .map(|(name, s)| {
            (
                name.clone(),
                action_score(s.effective_success_rate(), s.avg_reward, s.count as f64),
            )
        })
        .filter(|(_, score)| score.is_finite())
        .collect();

    let soft = softmax(&scores, cfg.softmax_temp);

    let mut next = current.clone();
    for (action, soft_w) in soft {
        let cur = current.get(&action).copied().unwrap_or(0.0);
        // ступень 1: подмешиваем свежий softmax
        let mixed = cur * (1.0 - cfg.weight_blend) + soft_w * cfg.weight_blend;
        // ступень 2: медленный дрейф текущего веса к смеси
        let blended = cur * (1.0 - cfg.weight_lr) + mixed * cfg.weight_lr;
        if blended.is_finite() {
            next.insert(action, blended.max(-1.0).min(1.0));
        } else {
            next.remove(&action);
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TacticStats;

    fn tactics(entries: &[(&str, u64, f64, u64, u64)]) -> TacticTable {
        entries
            .iter()
            .map(|(name, count, reward, succ, fail)| {
                (
                    name.to_string(),
                    TacticStats {
                        count: *count,
                        avg_reward: *reward,
                        success_count: *succ,
                        failure_count: *fail,
                        success_rate: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let scores = vec![
            ("a".to_string(), 1.0),
            ("b".to_string(), 2.0),
            ("c".to_string(), -1.0),
        ];
        let soft = softmax(&scores, 0.85);
        let sum: f64 = soft.values().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(soft["b"] > soft["a"] && soft["a"] > soft["c"]);
    }

    #[test]
    fn test_softmax_survives_extreme_scores() {
        let scores = vec![("a".to_string(), 1e9), ("b".to_string(), -1e9)];
        let soft = softmax(&scores, 0.05);
        assert!(soft.values().all(|w| w.is_finite()));
        assert!(soft["a"] > 0.99);
    }

    #[test]
    fn test_weights_stay_in_range() {
        let t = tactics(&[("flank", 500, 100.0, 500, 0), ("idle", 500, -100.0, 0, 500)]);
        let cfg = BrainConfig::default();
        let mut w = HashMap::new();
        w.insert("flank".to_string(), 1.0);
        w.insert("idle".to_string(), -1.0);
        for _ in 0..50 {
            w = derive_weights(&t, &w, &cfg);
        }
        for v in w.values() {
            assert!((-1.0..=1.0).contains(v));
        }
    }

    #[test]
    fn test_repeated_derivation_converges() {
        let t = tactics(&[
            ("flank", 40, 3.0, 30, 10),
            ("rush", 40, 1.0, 15, 25),
            ("circle", 10, 0.0, 5, 5),
        ]);
        let cfg = BrainConfig::default();
        let mut w: HashMap<String, f64> = HashMap::new();
        for _ in 0..2000 {
            w = derive_weights(&t, &w, &cfg);
        }
        let next = derive_weights(&t, &w, &cfg);
        for (action, v) in &next {
            assert!((v - w[action]).abs() < 1e-9, "вес {} не сошёлся", action);
        }
        // неподвижная точка — сам softmax-вес; лучший скор получает больший вес
        assert!(w["flank"] > w["rush"]);
        assert!(w["rush"] > 0.0);
    }

    #[test]
    fn test_actions_outside_update_keep_weight() {
        let t = tactics(&[("flank", 10, 2.0, 7, 3)]);
        let cfg = BrainConfig::default();
        let mut current = HashMap::new();
        current.insert("legacy".to_string(), -0.4);
        let next = derive_weights(&t, &current, &cfg);
        assert_eq!(next["legacy"], -0.4);
        assert!(next.contains_key("flank"));
    }

    #[test]
    fn test_empty_tactics_noop() {
        let t = TacticTable::new();
        let cfg = BrainConfig::default();
        let mut current = HashMap::new();
        current.insert("flank".to_string(), 0.3);
        let next = derive_weights(&t, &current, &cfg);
        assert_eq!(next.len(), 1);
        assert_eq!(next["flank"], 0.3);
    }
}
