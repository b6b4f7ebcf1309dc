// =============================================================================
// MOBMIND CORE — aggregator.rs
// «Robust Federated Averaging (FedAvg)»
// =============================================================================
//
// Чистая функция: список клиентских таблиц тактик → одна глобальная таблица.
//
//   1. Санитизация   — отбрасываем count=0 и NaN/∞
//   2. Взвешивание   — wᵢ = max(1, √countᵢ), сублинейно: ни один
//                      высоконагруженный сервер не доминирует
//   3. Забор Тьюки   — выбросы по avgReward и successRate режутся
//                      независимо; нижние квартили, вырожденный забор
//                      при IQR=0 оставляет только кластер
//   4. Среднее       — Σ(wᵢ·rᵢ)/Σwᵢ + байесовское сглаживание
//                      successRate через Beta(priorA, priorB)
//   5. Momentum      — бленд с предыдущей глобальной моделью
// =============================================================================

use crate::config::BrainConfig;
use crate::model::{clamp01, GlobalModel, Submission, TacticStats, TacticTable};
use std::collections::{BTreeSet, HashMap};

/// Минимум наблюдений для включения забора Тьюки
const MIN_OBS_FOR_TRIM: usize = 3;

// -----------------------------------------------------------------------------
// Observation — одно клиентское наблюдение действия после санитизации
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Observation {
    count: f64,
    avg_reward: f64,
    successes: f64,
    failures: f64,
    success_rate_raw: f64,
    weight: f64,
}

impl Observation {
    fn from_stats(s: &TacticStats) -> Option<Self> {
        if !s.is_sane() {
            return None;
        }
        let count = s.count as f64;
        let successes = s.success_count as f64;
        let failures = s.failure_count as f64;
        let denom = count.max(successes + failures).max(1.0);
        let success_rate_raw = clamp01(successes / denom);
        Some(Observation {
            count,
            avg_reward: s.avg_reward,
            successes,
            failures,
            success_rate_raw,
            weight: count.sqrt().max(1.0),
        })
    }
}

// -----------------------------------------------------------------------------
// Квартили и забор Тьюки
// -----------------------------------------------------------------------------

/// Квартиль по нижнему индексу отсортированного набора.
/// Для маленьких наборов (3 наблюдения, 2 против 1) кластер большинства
/// задаёт оба квартиля, и одиночный экстремум оказывается за забором.
fn quartile_lower(sorted: &[f64], p: f64) -> f64 {
    let idx = (p * (sorted.len() - 1) as f64).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Забор Тьюки [Q1 − k·IQR, Q3 + k·IQR] по значениям value(obs).
/// IQR=0 даёт вырожденный забор [Q1, Q3] — остаётся только кластер.
fn tukey_fence(values: &[f64], k: f64) -> (f64, f64) {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let q1 = quartile_lower(&sorted, 0.25);
    let q3 = quartile_lower(&sorted, 0.75);
    let iqr = q3 - q1;
    (q1 - k * iqr, q3 + k * iqr)
}

/// Отрезать выбросы по avgReward и successRateRaw независимо.
/// Если после отрезания не осталось никого — откат на сырой набор.
fn trim_outliers(obs: Vec<Observation>, k: f64) -> Vec<Observation> {
    if obs.len() < MIN_OBS_FOR_TRIM {
        return obs;
    }
    let rewards: Vec<f64> = obs.iter().map(|o| o.avg_reward).collect();
    let rates: Vec<f64> = obs.iter().map(|o| o.success_rate_raw).collect();
    let (r_lo, r_hi) = tukey_fence(&rewards, k);
    let (s_lo, s_hi) = tukey_fence(&rates, k);

    let kept: Vec<Observation> = obs
        .iter()
        .filter(|o| {
            o.avg_reward >= r_lo
                && o.avg_reward <= r_hi
                && o.success_rate_raw >= s_lo
                && o.success_rate_raw <= s_hi
        })
        .cloned()
        .collect();

    if kept.is_empty() {
        obs
    } else {
        kept
    }
}

// -----------------------------------------------------------------------------
// Байесовское сглаживание successRate
// -----------------------------------------------------------------------------

/// (Σуспехов + a) / (Σпопыток + a + b) — Beta(a, b) prior.
/// Пустой набор даёт prior mean a/(a+b).
pub fn bayes_success_rate(successes: f64, total: f64, prior_a: f64, prior_b: f64) -> f64 {
    let rate = (successes + prior_a) / (total + prior_a + prior_b);
    if rate.is_finite() {
        clamp01(rate)
    } else {
        0.5
    }
}

// -----------------------------------------------------------------------------
// aggregate_mob — агрегация по одному mobType
// -----------------------------------------------------------------------------

/// Слить клиентские таблицы одного моба в одну. `prev` — тактики этого
/// моба из предыдущей глобальной модели (momentum-бленд); `None` для
/// первого раунда.
pub fn aggregate_mob(
    tables: &[&TacticTable],
    prev: Option<&TacticTable>,
    cfg: &BrainConfig,
) -> TacticTable {
    // Объединение имён действий в стабильном порядке, с лимитом
    let mut actions: BTreeSet<&str> = BTreeSet::new();
    for table in tables {
        for name in table.keys() {
            actions.insert(name.as_str());
        }
    }
    let actions: Vec<&str> = actions.into_iter().take(cfg.max_actions).collect();

    let mut out = TacticTable::new();
    for action in actions {
        let obs: Vec<Observation> = tables
            .iter()
            .filter_map(|t| t.get(action))
            .filter_map(Observation::from_stats)
            .collect();
        if obs.is_empty() {
            // пустой или полностью невалидный набор — действия нет в выходе
            continue;
        }

        let obs = trim_outliers(obs, cfg.iqr_k);

        let sum_w: f64 = obs.iter().map(|o| o.weight).sum();
        let sum_wr: f64 = obs.iter().map(|o| o.weight * o.avg_reward).sum();
        let sum_count: f64 = obs.iter().map(|o| o.count).sum();
        let sum_succ: f64 = obs.iter().map(|o| o.successes).sum();
        let sum_fail: f64 = obs.iter().map(|o| o.failures).sum();

        let mut reward_new = sum_wr / sum_w;
        if !reward_new.is_finite() {
            reward_new = 0.0;
        }
        let rate_new = bayes_success_rate(sum_succ, sum_count, cfg.prior_a, cfg.prior_b);

        let (reward_out, rate_out) = match prev.and_then(|p| p.get(action)) {
            Some(p) => {
                let m = cfg.momentum;
                let prev_reward = if p.avg_reward.is_finite() { p.avg_reward } else { 0.0 };
                let prev_rate = p.effective_success_rate();
                (
                    m * prev_reward + (1.0 - m) * reward_new,
                    clamp01(m * prev_rate + (1.0 - m) * rate_new),
                )
            }
            None => (reward_new, rate_new),
        };

        out.insert(
            action.to_string(),
            TacticStats {
                count: sum_count as u64,
                avg_reward: reward_out,
                success_count: sum_succ as u64,
                failure_count: sum_fail as u64,
                success_rate: Some(rate_out),
            },
        );
    }
    out
}

// -----------------------------------------------------------------------------
// aggregate_submissions — агрегация всего раунда по всем мобам
// -----------------------------------------------------------------------------

/// mobType → агрегированная таблица. Симметрична по порядку вкладов.
pub fn aggregate_submissions(
    submissions: &[Submission],
    prev: Option<&GlobalModel>,
    cfg: &BrainConfig,
) -> HashMap<String, TacticTable> {
    let mut by_mob: HashMap<&str, Vec<&TacticTable>> = HashMap::new();
    for sub in submissions {
        by_mob.entry(sub.mob_type.as_str()).or_default().push(&sub.tactics);
    }

    let mut out = HashMap::new();
    for (mob, tables) in by_mob {
        let prev_tactics = prev.and_then(|g| g.tactics.get(mob));
        let merged = aggregate_mob(&tables, prev_tactics, cfg);
        if !merged.is_empty() {
            out.insert(mob.to_string(), merged);
        }
    }
    out
}
