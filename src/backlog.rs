// =============================================================================
// MOBMIND CORE — backlog.rs
// «Observability Backlog of Completed Rounds»
// =============================================================================
//
// Персистентная очередь снапшотов завершённых раундов с доставкой
// at-least-once во внешнее лог-хранилище. Уникальность — по номеру
// раунда; ёмкость ограничена, старые записи вытесняются.
//
// Сброс идёт строго по возрастанию раундов и останавливается на первой
// ошибке sink'а: раунд N+1 никогда не публикуется раньше раунда N.
// =============================================================================

use crate::constants::MAX_BACKLOG_ROUNDS;
use crate::model::TacticTable;
use crate::sink::LogSink;
use crate::store::{self, KvStore, KEY_LAST_LOG_ERROR, KEY_PENDING_ROUND_LOGS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// -----------------------------------------------------------------------------
// BacklogEntry — снапшот одного завершённого раунда
// -----------------------------------------------------------------------------

/// Сводка по одному mobType внутри раунда (без идентификаторов серверов)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobSummary {
    pub actions: usize,
    pub samples: u64,
    pub avg_success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogEntry {
    pub round: u64,
    pub timestamp: String,
    pub server_count: usize,
    pub model_count: usize,
    pub mobs: HashMap<String, MobSummary>,
    pub tactics: HashMap<String, TacticTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogError {
    pub timestamp: String,
    pub message: String,
}

impl LogError {
    pub fn now(message: String) -> Self {
        LogError {
            timestamp: chrono::Utc::now().to_rfc3339(),
            message,
        }
    }
}

// -----------------------------------------------------------------------------
// RoundBacklog — очередь с вытеснением и last-error
// -----------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RoundBacklog {
    entries: Vec<BacklogEntry>,
    last_error: Option<LogError>,
}

impl RoundBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавить снапшот раунда. Повтор того же раунда замещает старую
    /// запись; при переполнении вытесняются самые старые раунды.
    pub fn enqueue(&mut self, entry: BacklogEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.round == entry.round) {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
        if self.entries.len() > MAX_BACKLOG_ROUNDS {
            self.entries.sort_by_key(|e| e.round);
            let excess = self.entries.len() - MAX_BACKLOG_ROUNDS;
            self.entries.drain(0..excess);
        }
    }

    /// Снапшот записей в порядке возрастания раунда (для сброса)
    pub fn snapshot_sorted(&self) -> Vec<BacklogEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| e.round);
        entries
    }

    /// Применить результат сброса: убрать доставленные раунды,
    /// зафиксировать (или снять) last-error.
    pub fn apply_flush(&mut self, flushed: &[u64], error: Option<LogError>) {
        self.entries.retain(|e| !flushed.contains(&e.round));
        match error {
            Some(err) => self.last_error = Some(err),
            None => {
                if !flushed.is_empty() {
                    self.last_error = None;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_error(&self) -> Option<&LogError> {
        self.last_error.as_ref()
    }

    pub fn rounds(&self) -> Vec<u64> {
        let mut rounds: Vec<u64> = self.entries.iter().map(|e| e.round).collect();
        rounds.sort_unstable();
        rounds
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_error = None;
    }

    /// Записать очередь и last-error в хранилище
    pub fn persist(&self, kv: &dyn KvStore) -> Result<(), String> {
        store::save_json(kv, KEY_PENDING_ROUND_LOGS, &self.entries)?;
        store::save_json(kv, KEY_LAST_LOG_ERROR, &self.last_error)?;
        Ok(())
    }

    /// Восстановить очередь из хранилища (после рестарта)
    pub fn restore(kv: &dyn KvStore) -> Self {
        RoundBacklog {
            entries: store::load_json(kv, KEY_PENDING_ROUND_LOGS).unwrap_or_default(),
            last_error: store::load_json::<Option<LogError>>(kv, KEY_LAST_LOG_ERROR).flatten(),
        }
    }
}

// -----------------------------------------------------------------------------
// flush_entries — доставка снапшотов в sink
// -----------------------------------------------------------------------------

/// Прогнать записи через sink по возрастанию раундов. Первая ошибка
/// останавливает сброс; недоставленные записи остаются в очереди.
/// Возвращает (доставленные раунды, ошибка-если-была).
pub async fn flush_entries(
    entries: &[BacklogEntry],
    sink: &dyn LogSink,
) -> (Vec<u64>, Option<LogError>) {
    let mut flushed = Vec::new();
    for entry in entries {
        match sink.write_round(entry).await {
            Ok(()) => {
                log::info!("📦 раунд {} выгружен в лог-хранилище", entry.round);
                flushed.push(entry.round);
            }
            Err(msg) => {
                log::warn!("⚠️ выгрузка раунда {} не удалась: {}", entry.round, msg);
                return (flushed, Some(LogError::now(msg)));
            }
        }
    }
    (flushed, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MockSink;
    use crate::store::MemStore;

    fn entry(round: u64) -> BacklogEntry {
        BacklogEntry {
            round,
            timestamp: chrono::Utc::now().to_rfc3339(),
            server_count: 3,
            model_count: 3,
            mobs: HashMap::new(),
            tactics: HashMap::new(),
        }
    }

    #[test]
    fn test_enqueue_replaces_same_round() {
        let mut backlog = RoundBacklog::new();
        backlog.enqueue(entry(5));
        let mut replacement = entry(5);
        replacement.model_count = 9;
        backlog.enqueue(replacement);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog.snapshot_sorted()[0].model_count, 9);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut backlog = RoundBacklog::new();
        for round in 1..=(MAX_BACKLOG_ROUNDS as u64 + 10) {
            backlog.enqueue(entry(round));
        }
        assert_eq!(backlog.len(), MAX_BACKLOG_ROUNDS);
        let rounds = backlog.rounds();
        assert_eq!(rounds[0], 11); // раунды 1..=10 вытеснены
        assert_eq!(*rounds.last().unwrap(), MAX_BACKLOG_ROUNDS as u64 + 10);
    }

    #[tokio::test]
    async fn test_flush_in_ascending_order() {
        let mut backlog = RoundBacklog::new();
        backlog.enqueue(entry(3));
        backlog.enqueue(entry(1));
        backlog.enqueue(entry(2));
        let sink = MockSink::new();
        let (flushed, error) = flush_entries(&backlog.snapshot_sorted(), &sink).await;
        assert!(error.is_none());
        assert_eq!(flushed, vec![1, 2, 3]);
        assert_eq!(*sink.written.lock().unwrap(), vec![1, 2, 3]);
        backlog.apply_flush(&flushed, error);
        assert!(backlog.is_empty());
        assert!(backlog.last_error().is_none());
    }

    #[tokio::test]
    async fn test_flush_halts_on_first_failure() {
        let mut backlog = RoundBacklog::new();
        for round in 1..=4 {
            backlog.enqueue(entry(round));
        }
        let sink = MockSink::new();
        sink.fail_after(2); // третья запись падает
        let (flushed, error) = flush_entries(&backlog.snapshot_sorted(), &sink).await;
        assert_eq!(flushed, vec![1, 2]);
        assert!(error.is_some());
        backlog.apply_flush(&flushed, error);
        // упавший раунд и все более поздние остаются
        assert_eq!(backlog.rounds(), vec![3, 4]);
        assert!(backlog.last_error().is_some());
    }

    #[tokio::test]
    async fn test_successful_flush_clears_last_error() {
        let mut backlog = RoundBacklog::new();
        backlog.enqueue(entry(1));
        let failing = MockSink::new();
        failing.fail_always();
        let (flushed, error) = flush_entries(&backlog.snapshot_sorted(), &failing).await;
        backlog.apply_flush(&flushed, error);
        assert!(backlog.last_error().is_some());
        assert_eq!(backlog.len(), 1);

        let healthy = MockSink::new();
        let (flushed, error) = flush_entries(&backlog.snapshot_sorted(), &healthy).await;
        backlog.apply_flush(&flushed, error);
        assert!(backlog.is_empty());
        assert!(backlog.last_error().is_none());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let kv = MemStore::new();
        let mut backlog = RoundBacklog::new();
        backlog.enqueue(entry(7));
        backlog.enqueue(entry(8));
        backlog.apply_flush(&[], Some(LogError::now("нет связи".into())));
        backlog.persist(&kv).unwrap();

        let restored = RoundBacklog::restore(&kv);
        assert_eq!(restored.rounds(), vec![7, 8]);
        assert_eq!(restored.last_error().unwrap().message, "нет связи");
    }
}
