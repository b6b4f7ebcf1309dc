// =============================================================================
// MOBMIND CORE — model.rs
// «Data Model of the Collective Mind»
// =============================================================================
//
// Реализует:
//   1. TacticStats / TacticTable — статистика действий моба за раунд
//   2. Submission               — вклад одного сервера (serverId, mobType)
//   3. Contributor              — учёт живости пары (serverId, mobType)
//   4. GlobalModel              — опубликованная глобальная модель раунда
//
// Все структуры сериализуются в camelCase — это wire-схема клиентов
// и одновременно схема персистентного состояния.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Текущее время в миллисекундах с эпохи
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

/// clamp в [0, 1]
pub fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    x.max(0.0).min(1.0)
}

/// Ключ вклада в текущем раунде: "serverId:mobType"
pub fn submission_key(server_id: &str, mob_type: &str) -> String {
    format!("{}:{}", server_id, mob_type)
}

// -----------------------------------------------------------------------------
// TacticStats — агрегированная статистика одного действия
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TacticStats {
    pub count: u64,
    pub avg_reward: f64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
}

impl TacticStats {
    /// successRate: явный, либо выводится из счётчиков успехов/провалов
    pub fn effective_success_rate(&self) -> f64 {
        match self.success_rate {
            Some(r) => clamp01(r),
            None => {
                let total = (self.success_count + self.failure_count).max(1);
                self.success_count as f64 / total as f64
            }
        }
    }

    /// Валидность для ингеста: положительный count, конечные числа
    pub fn is_sane(&self) -> bool {
        if self.count == 0 {
            return false;
        }
        if !self.avg_reward.is_finite() {
            return false;
        }
        if let Some(r) = self.success_rate {
            if !r.is_finite() {
                return false;
            }
        }
        true
    }
}

/// action → TacticStats
pub type TacticTable = HashMap<String, TacticStats>;

/// Обрезать таблицу тактик до лимита действий (стабильный порядок по имени).
/// Защита от клиентов, раздувающих таблицу произвольными действиями.
pub fn cap_tactic_table(tactics: TacticTable, max_actions: usize) -> TacticTable {
    if tactics.len() <= max_actions {
        return tactics;
    }
    let mut names: Vec<String> = tactics.keys().cloned().collect();
    names.sort();
    names.truncate(max_actions);
    let mut out = TacticTable::new();
    let mut tactics = tactics;
    for name in names {
        if let Some(stats) = tactics.remove(&name) {
            out.insert(name, stats);
        }
    }
    out
}

// -----------------------------------------------------------------------------
// Submission — вклад сервера в текущий раунд
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub server_id: String,
    pub mob_type: String,
    pub tactics: TacticTable,
    #[serde(default)]
    pub bootstrap: bool,
    pub received_at: i64,
}

// -----------------------------------------------------------------------------
// Contributor — живость пары (serverId, mobType)
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contributor {
    pub server_id: String,
    pub mob_type: String,
    pub first_seen: i64,
    pub last_upload: i64,
    pub upload_count: u64,
}

impl Contributor {
    pub fn new(server_id: &str, mob_type: &str) -> Self {
        let now = now_ms();
        Contributor {
            server_id: server_id.to_string(),
            mob_type: mob_type.to_string(),
            first_seen: now,
            last_upload: now,
            upload_count: 1,
        }
    }

    pub fn touch(&mut self) {
        self.last_upload = now_ms();
        self.upload_count += 1;
    }
}

// -----------------------------------------------------------------------------
// GlobalModel — единственная опубликованная модель закрытого раунда
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalModel {
    pub round: u64,
    pub timestamp: i64,
    pub contributor_count: usize,
    /// mobType → TacticTable
    pub tactics: HashMap<String, TacticTable>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(count: u64, reward: f64, succ: u64, fail: u64) -> TacticStats {
        TacticStats {
            count,
            avg_reward: reward,
            success_count: succ,
            failure_count: fail,
            success_rate: None,
        }
    }

    #[test]
    fn test_success_rate_derived_from_counts() {
        let s = stats(10, 1.0, 7, 3);
        assert!((s.effective_success_rate() - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_success_rate_explicit_clamped() {
        let mut s = stats(10, 1.0, 0, 0);
        s.success_rate = Some(1.7);
        assert_eq!(s.effective_success_rate(), 1.0);
    }

    #[test]
    fn test_success_rate_zero_counts() {
        // без счётчиков и явного значения — 0 / max(1, 0) = 0
        let s = stats(5, 1.0, 0, 0);
        assert_eq!(s.effective_success_rate(), 0.0);
    }

    #[test]
    fn test_sanity_rejects_zero_count_and_nan() {
        assert!(!stats(0, 1.0, 0, 0).is_sane());
        assert!(!stats(5, f64::NAN, 0, 0).is_sane());
        assert!(!stats(5, f64::INFINITY, 0, 0).is_sane());
        assert!(stats(5, -2.5, 1, 4).is_sane());
    }

    #[test]
    fn test_cap_tactic_table_stable_order() {
        let mut t = TacticTable::new();
        for name in ["charge", "ambush", "flank", "retreat", "burrow"] {
            t.insert(name.to_string(), stats(1, 0.0, 0, 0));
        }
        let capped = cap_tactic_table(t, 3);
        // отсортированный порядок: ambush, burrow, charge
        assert_eq!(capped.len(), 3);
        assert!(capped.contains_key("ambush"));
        assert!(capped.contains_key("burrow"));
        assert!(capped.contains_key("charge"));
    }

    #[test]
    fn test_submission_roundtrip_json() {
        let mut tactics = TacticTable::new();
        tactics.insert("flank".into(), stats(10, 2.0, 7, 3));
        let sub = Submission {
            server_id: "srv-a".into(),
            mob_type: "zombie".into(),
            tactics,
            bootstrap: true,
            received_at: now_ms(),
        };
        let json = serde_json::to_string(&sub).unwrap();
        assert!(json.contains("serverId"));
        assert!(json.contains("mobType"));
        assert!(json.contains("avgReward"));
        let back: Submission = serde_json::from_str(&json).unwrap();
        assert_eq!(back.server_id, "srv-a");
        assert!(back.bootstrap);
        assert_eq!(back.tactics["flank"].count, 10);
    }
}
