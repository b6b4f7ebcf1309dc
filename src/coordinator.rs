// =============================================================================
// MOBMIND CORE — coordinator.rs
// «Federated Round Coordinator — the single writer»
// =============================================================================
//
// Актор-координатор: единственный источник истины о раундах. Все
// мутации состояния сериализованы одним мьютексом — переход раунда
// трогает много полей сразу, и они меняются атомарно.
//
// Жизненный цикл раунда:
//   Open(R)    — принимаем вклады (serverId, mobType)
//   Closing(R) — агрегация (внутри лока, чистая математика)
//   Open(R+1)  — вклады очищены, глобальная модель раунда R опубликована
//
// Выгрузка backlog'а в лог-хранилище никогда не держит горячий путь:
// снапшот очереди снимается под локом, сетевые записи идут без лока,
// результат применяется вторым коротким локом.
// =============================================================================

use crate::aggregator;
use crate::backlog::{flush_entries, BacklogEntry, LogError, MobSummary, RoundBacklog};
use crate::config::BrainConfig;
use crate::constants;
use crate::episodes::{EpisodeRecord, MobEpisodeSummary, TacticalData};
use crate::model::{
    cap_tactic_table, now_ms, submission_key, Contributor, GlobalModel, Submission, TacticTable,
};
use crate::sink::LogSink;
use crate::store::{
    self, KvStore, KEY_CONTRIBUTORS, KEY_CURRENT_ROUND, KEY_GLOBAL_MODEL, KEY_LAST_AGGREGATION,
    KEY_MODELS, KEY_TACTICAL_DATA, KEY_TIER_DATA,
};
use crate::tiers::TierState;
use crate::weights::derive_weights;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

// -----------------------------------------------------------------------------
// CoordError — доменная таксономия ошибок (HTTP-статус вешает api.rs)
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CoordError {
    /// Ошибка клиента: не хватает полей, кривой payload
    #[error("{0}")]
    BadRequest(String),
    /// Повторный небутстрапный вклад в текущем раунде
    #[error("Already contributed")]
    AlreadyContributed { round: u64 },
    /// Глобальной модели ещё нет
    #[error("no global model published yet")]
    NoGlobalModel { round: u64 },
    /// Запрошенный mobType отсутствует в глобальной модели
    #[error("unknown mob type: {0}")]
    UnknownMobType(String),
    /// Невалидный или отсутствующий админ-токен
    #[error("unauthorized")]
    Unauthorized,
    /// ADMIN_TOKEN не задан — админ-поверхность выключена
    #[error("admin surface not configured")]
    AdminNotConfigured,
    /// Лог-хранилище не сконфигурировано (нужно для mark-missing)
    #[error("log sink not configured")]
    SinkNotConfigured,
    /// Отказ лог-хранилища на админ-операции
    #[error("log sink failure: {0}")]
    Sink(String),
    /// Отказ персистентного стора
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<String> for CoordError {
    fn from(message: String) -> Self {
        CoordError::Storage(message)
    }
}

// -----------------------------------------------------------------------------
// Запросы и ответы доменного уровня
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub server_id: Option<String>,
    pub mob_type: Option<String>,
    pub tactics: Option<TacticTable>,
    #[serde(default)]
    pub bootstrap: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAck {
    pub success: bool,
    pub round: u64,
    pub contributors: usize,
    pub models_in_round: usize,
}

/// Результат upload: подтверждение + факт закрытия раунда
/// (по нему вызывающая сторона планирует фоновую выгрузку backlog'а)
#[derive(Debug)]
pub struct UploadOutcome {
    pub ack: UploadAck,
    pub aggregated: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub pending_round_logs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_git_hub_log_error: Option<LogError>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    pub round: u64,
    pub updated_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub version: &'static str,
    pub instance_id: String,
    pub round: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_round: Option<u64>,
    pub servers: usize,
    pub contributors: usize,
    pub models_in_round: usize,
    pub total_episodes: u64,
    pub pending_round_logs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_git_hub_log_error: Option<LogError>,
    pub uptime_secs: i64,
    pub timestamp: String,
}

// -----------------------------------------------------------------------------
// CoordState — всё мутабельное состояние под одним замком
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CoordState {
    current_round: u64,
    /// "serverId:mobType" → вклад текущего раунда
    models: HashMap<String, Submission>,
    contributors: HashMap<String, Contributor>,
    global: Option<GlobalModel>,
    last_aggregation: i64,
    tactical: TacticalData,
    tiers: TierState,
    backlog: RoundBacklog,
}

impl CoordState {
    fn fresh(start_round: u64) -> Self {
        CoordState {
            current_round: start_round.max(1),
            ..Default::default()
        }
    }

    fn distinct_servers(&self) -> usize {
        self.contributors
            .values()
            .map(|c| c.server_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

// -----------------------------------------------------------------------------
// Coordinator
// -----------------------------------------------------------------------------

pub struct Coordinator {
    pub cfg: BrainConfig,
    store: Arc<dyn KvStore>,
    sink: Option<Arc<dyn LogSink>>,
    state: Mutex<CoordState>,
    pub instance_id: String,
    pub started_at: i64,
}

impl Coordinator {
    /// Поднять координатор, восстановив состояние из стора
    pub fn new(cfg: BrainConfig, store: Arc<dyn KvStore>, sink: Option<Arc<dyn LogSink>>) -> Self {
        let state = CoordState {
            current_round: store::load_json::<u64>(&*store, KEY_CURRENT_ROUND)
                .unwrap_or(1)
                .max(1),
            models: store::load_json(&*store, KEY_MODELS).unwrap_or_default(),
            contributors: store::load_json(&*store, KEY_CONTRIBUTORS).unwrap_or_default(),
            global: store::load_json(&*store, KEY_GLOBAL_MODEL),
            last_aggregation: store::load_json(&*store, KEY_LAST_AGGREGATION).unwrap_or(0),
            tactical: store::load_json(&*store, KEY_TACTICAL_DATA).unwrap_or_default(),
            tiers: store::load_json(&*store, KEY_TIER_DATA).unwrap_or_default(),
            backlog: RoundBacklog::restore(&*store),
        };
        log::info!(
            "🧠 координатор поднят: раунд {}, вкладов {}, backlog {}",
            state.current_round,
            state.models.len(),
            state.backlog.len()
        );
        Coordinator {
            cfg,
            store,
            sink,
            state: Mutex::new(state),
            instance_id: uuid::Uuid::new_v4().to_string(),
            started_at: now_ms(),
        }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    // -------------------------------------------------------------------------
    // upload — вклад сервера в текущий раунд
    // -------------------------------------------------------------------------

    pub async fn upload(&self, req: UploadRequest) -> Result<UploadOutcome, CoordError> {
        let server_id = non_empty(req.server_id, "serverId")?;
        let mob_type = non_empty(req.mob_type, "mobType")?;
        let raw = req
            .tactics
            .ok_or_else(|| CoordError::BadRequest("tactics is required".into()))?;

        // инвариант ингеста: count > 0 и конечные числа
        let valid: TacticTable = raw.into_iter().filter(|(_, s)| s.is_sane()).collect();
        if valid.is_empty() {
            return Err(CoordError::BadRequest("no valid tactic entries".into()));
        }
        let tactics = cap_tactic_table(valid, self.cfg.max_actions);

        let mut st = self.state.lock().await;
        let round = st.current_round;
        let key = submission_key(&server_id, &mob_type);

        if !req.bootstrap && st.models.contains_key(&key) {
            return Err(CoordError::AlreadyContributed { round });
        }

        st.models.insert(
            key.clone(),
            Submission {
                server_id: server_id.clone(),
                mob_type: mob_type.clone(),
                tactics,
                bootstrap: req.bootstrap,
                received_at: now_ms(),
            },
        );
        st.contributors
            .entry(key)
            .and_modify(|c| c.touch())
            .or_insert_with(|| Contributor::new(&server_id, &mob_type));
        store::save_json(&*self.store, KEY_MODELS, &st.models)?;
        store::save_json(&*self.store, KEY_CONTRIBUTORS, &st.contributors)?;

        let models_in_round = st.models.len();
        let contributors = st.contributors.len();

        let mut aggregated = false;
        if models_in_round >= self.cfg.min_models {
            let interval_ms = self.cfg.agg_interval_secs as i64 * 1000;
            if req.bootstrap || now_ms() - st.last_aggregation >= interval_ms {
                self.close_round(&mut st)?;
                aggregated = true;
            }
        }

        Ok(UploadOutcome {
            ack: UploadAck {
                success: true,
                round,
                contributors,
                models_in_round,
            },
            aggregated,
        })
    }

    /// Closing(R) → Open(R+1): агрегация, публикация, backlog
    fn close_round(&self, st: &mut CoordState) -> Result<(), CoordError> {
        let round = st.current_round;
        let submissions: Vec<Submission> = st.models.values().cloned().collect();
        let server_count = submissions
            .iter()
            .map(|s| s.server_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let model_count = submissions.len();

        let fresh = aggregator::aggregate_submissions(&submissions, st.global.as_ref(), &self.cfg);

        for (mob, table) in &fresh {
            let current = st.tactical.weights.get(mob).cloned().unwrap_or_default();
            let next = derive_weights(table, &current, &self.cfg);
            st.tactical.weights.insert(mob.clone(), next);
        }

        // мобы, не попавшие в этот раунд, сохраняют таблицы прошлой модели
        let mut tactics = st
            .global
            .as_ref()
            .map(|g| g.tactics.clone())
            .unwrap_or_default();
        for (mob, table) in &fresh {
            tactics.insert(mob.clone(), table.clone());
        }

        let global = GlobalModel {
            round,
            timestamp: now_ms(),
            contributor_count: server_count,
            tactics,
        };

        store::save_json(&*self.store, KEY_GLOBAL_MODEL, &global)?;
        store::save_json(&*self.store, KEY_TACTICAL_DATA, &st.tactical)?;
        // side-channel: global:<mobType> для внешних читателей
        for (mob, table) in &fresh {
            store::save_json(&*self.store, &format!("global:{}", mob), table)?;
        }

        st.backlog.enqueue(entry_for_round(&global, model_count));
        if let Err(e) = st.backlog.persist(&*self.store) {
            // наблюдаемость не валит горячий путь
            log::warn!("backlog не персистится: {}", e);
        }

        st.global = Some(global);
        st.models.clear();
        st.current_round = round + 1;
        st.last_aggregation = now_ms();
        store::save_json(&*self.store, KEY_MODELS, &st.models)?;
        store::save_json(&*self.store, KEY_CURRENT_ROUND, &st.current_round)?;
        store::save_json(&*self.store, KEY_LAST_AGGREGATION, &st.last_aggregation)?;

        log::info!(
            "🧠 раунд {} закрыт: {} вкладов от {} серверов, {} мобов",
            round,
            model_count,
            server_count,
            fresh.len()
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Читающие операции
    // -------------------------------------------------------------------------

    pub async fn get_global(&self, mob_type: Option<&str>) -> Result<serde_json::Value, CoordError> {
        let st = self.state.lock().await;
        let global = st
            .global
            .as_ref()
            .ok_or(CoordError::NoGlobalModel {
                round: st.current_round,
            })?;
        match mob_type {
            None => Ok(serde_json::to_value(global).map_err(|e| CoordError::Storage(e.to_string()))?),
            Some(mob) => {
                let table = global
                    .tactics
                    .get(mob)
                    .ok_or_else(|| CoordError::UnknownMobType(mob.to_string()))?;
                Ok(json!({
                    "round": global.round,
                    "timestamp": global.timestamp,
                    "mobType": mob,
                    "tactics": table,
                }))
            }
        }
    }

    pub async fn status(&self) -> StatusReport {
        let st = self.state.lock().await;
        StatusReport {
            version: constants::VERSION,
            instance_id: self.instance_id.clone(),
            round: st.current_round,
            global_round: st.global.as_ref().map(|g| g.round),
            servers: st.distinct_servers(),
            contributors: st.contributors.len(),
            models_in_round: st.models.len(),
            total_episodes: st.tactical.total_episodes,
            pending_round_logs: st.backlog.len(),
            last_git_hub_log_error: st.backlog.last_error().cloned(),
            uptime_secs: (now_ms() - self.started_at) / 1000,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub async fn heartbeat(
        &self,
        server_id: Option<String>,
        active_mobs: Vec<String>,
    ) -> Result<HeartbeatAck, CoordError> {
        let server_id = non_empty(server_id, "serverId")?;
        let mut st = self.state.lock().await;
        let mut updated = 0;
        for mob in &active_mobs {
            let key = submission_key(&server_id, mob);
            if let Some(c) = st.contributors.get_mut(&key) {
                c.touch();
                updated += 1;
            }
        }
        if updated > 0 {
            store::save_json(&*self.store, KEY_CONTRIBUTORS, &st.contributors)?;
        }
        Ok(HeartbeatAck {
            round: st.current_round,
            updated_count: updated,
        })
    }

    // -------------------------------------------------------------------------
    // Backlog: выгрузка и backfill
    // -------------------------------------------------------------------------

    /// Слить backlog в лог-хранилище. Сетевые записи идут без лока.
    pub async fn flush_backlog(&self) -> FlushReport {
        let Some(sink) = self.sink.clone() else {
            let mut st = self.state.lock().await;
            if !st.backlog.is_empty() {
                st.backlog.apply_flush(
                    &[],
                    Some(LogError::now("лог-хранилище не сконфигурировано".into())),
                );
                if let Err(e) = st.backlog.persist(&*self.store) {
                    log::warn!("backlog не персистится: {}", e);
                }
            }
            return FlushReport {
                pending_round_logs: st.backlog.len(),
                last_git_hub_log_error: st.backlog.last_error().cloned(),
            };
        };

        let snapshot = self.state.lock().await.backlog.snapshot_sorted();
        if snapshot.is_empty() {
            let st = self.state.lock().await;
            return FlushReport {
                pending_round_logs: 0,
                last_git_hub_log_error: st.backlog.last_error().cloned(),
            };
        }

        let (flushed, error) = flush_entries(&snapshot, &*sink).await;

        let mut st = self.state.lock().await;
        st.backlog.apply_flush(&flushed, error);
        if let Err(e) = st.backlog.persist(&*self.store) {
            log::warn!("backlog не персистится: {}", e);
        }
        FlushReport {
            pending_round_logs: st.backlog.len(),
            last_git_hub_log_error: st.backlog.last_error().cloned(),
        }
    }

    /// Повторно поставить текущую глобальную модель в очередь выгрузки
    pub async fn backfill_current_global(&self) -> Result<serde_json::Value, CoordError> {
        let global_round = {
            let mut st = self.state.lock().await;
            let global = st
                .global
                .clone()
                .ok_or(CoordError::NoGlobalModel {
                    round: st.current_round,
                })?;
            let model_count = global.contributor_count;
            st.backlog.enqueue(entry_for_round(&global, model_count));
            if let Err(e) = st.backlog.persist(&*self.store) {
                log::warn!("backlog не персистится: {}", e);
            }
            global.round
        };
        let report = self.flush_backlog().await;
        Ok(json!({
            "globalRound": global_round,
            "pendingRoundLogs": report.pending_round_logs,
            "lastGitHubLogError": report.last_git_hub_log_error,
        }))
    }

    // -------------------------------------------------------------------------
    // Админ-операции
    // -------------------------------------------------------------------------

    /// Безусловный сброс всего состояния (ВКЛЮЧАЯ backlog — невыгруженные
    /// раунды теряются; это задокументированная цена катастрофического
    /// сброса). Возвращает снапшоты до/после.
    pub async fn admin_reset_round(&self, start_round: u64) -> Result<serde_json::Value, CoordError> {
        if start_round < 1 {
            return Err(CoordError::BadRequest("startRound must be >= 1".into()));
        }
        let mut st = self.state.lock().await;
        let before = json!({
            "round": st.current_round,
            "modelsInRound": st.models.len(),
            "contributors": st.contributors.len(),
            "pendingRoundLogs": st.backlog.len(),
            "hasGlobalModel": st.global.is_some(),
        });
        self.store.delete_all()?;
        *st = CoordState::fresh(start_round);
        store::save_json(&*self.store, KEY_CURRENT_ROUND, &st.current_round)?;
        log::warn!("♻️ админ-сброс: раунд {}, всё состояние очищено", start_round);
        let after = json!({
            "round": st.current_round,
            "modelsInRound": 0,
            "contributors": 0,
            "pendingRoundLogs": 0,
            "hasGlobalModel": false,
        });
        Ok(json!({ "before": before, "after": after }))
    }

    /// Записать заглушку невосполнимого раунда в лог-хранилище
    pub async fn admin_mark_missing(
        &self,
        round: u64,
        reason: &str,
        notes: &str,
    ) -> Result<serde_json::Value, CoordError> {
        if round < 1 {
            return Err(CoordError::BadRequest("round must be >= 1".into()));
        }
        let sink = self.sink.as_ref().ok_or(CoordError::SinkNotConfigured)?;
        sink.mark_missing(round, reason, notes)
            .await
            .map_err(CoordError::Sink)
    }

    // -------------------------------------------------------------------------
    // Вспомогательные каналы: тиры и эпизоды
    // -------------------------------------------------------------------------

    pub async fn tier_upload(&self, incoming: TierState) -> Result<serde_json::Value, CoordError> {
        let mut st = self.state.lock().await;
        let updated = st.tiers.merge(&incoming);
        if updated > 0 {
            store::save_json(&*self.store, KEY_TIER_DATA, &st.tiers)?;
        }
        Ok(json!({
            "updated": updated,
            "experience": st.tiers.experience,
            "tiers": st.tiers.tiers,
        }))
    }

    pub async fn tier_download(&self) -> TierState {
        self.state.lock().await.tiers.clone()
    }

    pub async fn episode_upload(
        &self,
        episode: EpisodeRecord,
    ) -> Result<serde_json::Value, CoordError> {
        if episode.mob_type.trim().is_empty() {
            return Err(CoordError::BadRequest("mobType is required".into()));
        }
        if !episode.episode_reward.is_finite() {
            return Err(CoordError::BadRequest("episodeReward must be finite".into()));
        }
        let mut st = self.state.lock().await;
        let episode_number = st.tactical.ingest(episode);
        store::save_json(&*self.store, KEY_TACTICAL_DATA, &st.tactical)?;
        Ok(json!({
            "episodeNumber": episode_number,
            "totalSamples": st.tactical.total_samples,
        }))
    }

    pub async fn tactical_weights(&self) -> HashMap<String, HashMap<String, f64>> {
        self.state.lock().await.tactical.weights.clone()
    }

    pub async fn tactical_stats(&self) -> serde_json::Value {
        let st = self.state.lock().await;
        let mobs: HashMap<String, MobEpisodeSummary> = st.tactical.summary();
        json!({
            "totalEpisodes": st.tactical.total_episodes,
            "totalSamples": st.tactical.total_samples,
            "trackedMobs": st.tactical.weights.len(),
            "mobs": mobs,
        })
    }
}

/// Фоновая выгрузка backlog'а — fire-and-forget, горячий путь не ждёт
pub fn spawn_flush(coord: Arc<Coordinator>) {
    tokio::spawn(async move {
        coord.flush_backlog().await;
    });
}

fn non_empty(value: Option<String>, field: &str) -> Result<String, CoordError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(CoordError::BadRequest(format!("{} is required", field))),
    }
}

/// Снапшот раунда для backlog'а (без идентификаторов серверов)
fn entry_for_round(global: &GlobalModel, model_count: usize) -> BacklogEntry {
    let mut mobs = HashMap::new();
    for (mob, table) in &global.tactics {
        let samples: u64 = table.values().map(|s| s.count).sum();
        let avg_success_rate = if table.is_empty() {
            0.0
        } else {
            table
                .values()
                .map(|s| s.effective_success_rate())
                .sum::<f64>()
                / table.len() as f64
        };
        let top_action = table
            .iter()
            .max_by(|a, b| {
                a.1.effective_success_rate()
                    .partial_cmp(&b.1.effective_success_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(name, _)| name.clone());
        mobs.insert(
            mob.clone(),
            MobSummary {
                actions: table.len(),
                samples,
                avg_success_rate,
                top_action,
            },
        );
    }
    BacklogEntry {
        round: global.round,
        timestamp: chrono::Utc::now().to_rfc3339(),
        server_count: global.contributor_count,
        model_count,
        mobs,
        tactics: global.tactics.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TacticStats;
    use crate::sink::MockSink;
    use crate::store::MemStore;

    fn test_cfg() -> BrainConfig {
        BrainConfig {
            agg_interval_secs: 0,
            ..BrainConfig::default()
        }
    }

    fn coordinator_with(
        cfg: BrainConfig,
    ) -> (Arc<Coordinator>, Arc<MemStore>, Arc<MockSink>) {
        let store = Arc::new(MemStore::new());
        let sink = Arc::new(MockSink::new());
        let coord = Arc::new(Coordinator::new(
            cfg,
            store.clone() as Arc<dyn KvStore>,
            Some(sink.clone() as Arc<dyn LogSink>),
        ));
        (coord, store, sink)
    }

    fn flank_table() -> TacticTable {
        let mut t = TacticTable::new();
        t.insert(
            "flank".into(),
            TacticStats {
                count: 10,
                avg_reward: 2.0,
                success_count: 7,
                failure_count: 3,
                success_rate: None,
            },
        );
        t
    }

    fn upload_req(server: &str, mob: &str, bootstrap: bool) -> UploadRequest {
        UploadRequest {
            server_id: Some(server.into()),
            mob_type: Some(mob.into()),
            tactics: Some(flank_table()),
            bootstrap,
        }
    }

    #[tokio::test]
    async fn test_happy_path_three_uploads_close_round() {
        let (coord, _, _) = coordinator_with(test_cfg());
        let a = coord.upload(upload_req("a", "zombie", false)).await.unwrap();
        assert!(!a.aggregated);
        assert_eq!(a.ack.round, 1);
        let b = coord.upload(upload_req("b", "zombie", false)).await.unwrap();
        assert!(!b.aggregated);
        let c = coord.upload(upload_req("c", "zombie", false)).await.unwrap();
        assert!(c.aggregated);
        assert_eq!(c.ack.round, 1);
        assert_eq!(c.ack.models_in_round, 3);

        let status = coord.status().await;
        assert_eq!(status.round, 2);
        assert_eq!(status.global_round, Some(1));
        assert_eq!(status.models_in_round, 0);
        assert_eq!(status.pending_round_logs, 1);

        let global = coord.get_global(Some("zombie")).await.unwrap();
        assert_eq!(global["round"], 1);
        let flank = &global["tactics"]["flank"];
        assert_eq!(flank["count"], 30);
        assert_eq!(flank["successCount"], 21);
        let rate = flank["successRate"].as_f64().unwrap();
        assert!((rate - 23.0 / 34.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_duplicate_upload_rejected_with_round() {
        let (coord, _, _) = coordinator_with(test_cfg());
        coord.upload(upload_req("a", "zombie", false)).await.unwrap();
        match coord.upload(upload_req("a", "zombie", false)).await {
            Err(CoordError::AlreadyContributed { round }) => assert_eq!(round, 1),
            other => panic!("ожидали AlreadyContributed, получили {:?}", other),
        }
        // другой mobType того же сервера — отдельный ключ
        assert!(coord.upload(upload_req("a", "spider", false)).await.is_ok());
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent_and_triggers_early() {
        let cfg = BrainConfig {
            agg_interval_secs: 86400, // интервал заведомо не истёк
            ..BrainConfig::default()
        };
        let (coord, _, _) = coordinator_with(cfg);
        coord.upload(upload_req("a", "zombie", false)).await.unwrap();
        coord.upload(upload_req("b", "zombie", false)).await.unwrap();
        // бутстрап под тем же ключом перезаписывает, не дубль
        coord.upload(upload_req("a", "zombie", true)).await.unwrap();
        // третий уникальный вклад бутстрапом — немедленная агрегация
        let out = coord.upload(upload_req("c", "zombie", true)).await.unwrap();
        assert!(out.aggregated);
        assert_eq!(coord.status().await.round, 2);
    }

    #[tokio::test]
    async fn test_interval_gates_non_bootstrap_rounds() {
        let cfg = BrainConfig {
            agg_interval_secs: 86400,
            ..BrainConfig::default()
        };
        let (coord, _, _) = coordinator_with(cfg);
        // первый раунд: last_aggregation = 0, интервал истёк давно
        for s in ["a", "b", "c"] {
            coord.upload(upload_req(s, "zombie", false)).await.unwrap();
        }
        assert_eq!(coord.status().await.round, 2);
        // второй раунд: интервал свежий, три вклада не закрывают раунд
        for s in ["a", "b", "c"] {
            coord.upload(upload_req(s, "zombie", false)).await.unwrap();
        }
        assert_eq!(coord.status().await.round, 2);
        assert_eq!(coord.status().await.models_in_round, 3);
    }

    #[tokio::test]
    async fn test_round_monotonic_across_aggregations() {
        let (coord, _, _) = coordinator_with(test_cfg());
        let mut last = 0;
        for round in 0..4 {
            for s in ["a", "b", "c"] {
                coord.upload(upload_req(s, "zombie", false)).await.unwrap();
            }
            let status = coord.status().await;
            assert!(status.round > last, "раунд не растёт");
            last = status.round;
            assert_eq!(status.round, round + 2);
        }
    }

    #[tokio::test]
    async fn test_backlog_survives_outage_then_drains() {
        let (coord, _, sink) = coordinator_with(test_cfg());
        sink.fail_always();
        for _ in 0..4 {
            for s in ["a", "b", "c"] {
                coord.upload(upload_req(s, "zombie", false)).await.unwrap();
            }
            coord.flush_backlog().await;
        }
        let report = coord.flush_backlog().await;
        assert_eq!(report.pending_round_logs, 4);
        assert!(report.last_git_hub_log_error.is_some());

        sink.heal();
        let report = coord.flush_backlog().await;
        assert_eq!(report.pending_round_logs, 0);
        assert!(report.last_git_hub_log_error.is_none());
        assert_eq!(*sink.written.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_restart_restores_state() {
        let store = Arc::new(MemStore::new());
        let sink = Arc::new(MockSink::new());
        sink.fail_always();
        {
            let coord = Coordinator::new(
                test_cfg(),
                store.clone() as Arc<dyn KvStore>,
                Some(sink.clone() as Arc<dyn LogSink>),
            );
            for s in ["a", "b", "c"] {
                coord.upload(upload_req(s, "zombie", false)).await.unwrap();
            }
            coord.upload(upload_req("a", "spider", false)).await.unwrap();
        }
        // рестарт: тот же стор, новый процесс
        let coord = Coordinator::new(
            test_cfg(),
            store.clone() as Arc<dyn KvStore>,
            Some(sink as Arc<dyn LogSink>),
        );
        let status = coord.status().await;
        assert_eq!(status.round, 2);
        assert_eq!(status.global_round, Some(1));
        assert_eq!(status.models_in_round, 1); // spider ждёт в раунде 2
        assert_eq!(status.contributors, 4);
        assert_eq!(status.pending_round_logs, 1);
        let global = coord.get_global(None).await.unwrap();
        assert_eq!(global["round"], 1);
    }

    #[tokio::test]
    async fn test_admin_reset_wipes_everything() {
        let (coord, store, _) = coordinator_with(test_cfg());
        for s in ["a", "b", "c"] {
            coord.upload(upload_req(s, "zombie", false)).await.unwrap();
        }
        let result = coord.admin_reset_round(100).await.unwrap();
        assert_eq!(result["before"]["round"], 2);
        assert_eq!(result["after"]["round"], 100);

        let status = coord.status().await;
        assert_eq!(status.round, 100);
        assert_eq!(status.contributors, 0);
        assert_eq!(status.models_in_round, 0);
        assert_eq!(status.pending_round_logs, 0);
        assert!(coord.get_global(None).await.is_err());
        // и в сторе только свежий номер раунда
        assert_eq!(
            store.get(KEY_CURRENT_ROUND).unwrap().as_deref(),
            Some("100")
        );
        assert_eq!(store.get(KEY_GLOBAL_MODEL).unwrap(), None);
    }

    #[tokio::test]
    async fn test_admin_reset_validates_round() {
        let (coord, _, _) = coordinator_with(test_cfg());
        assert!(matches!(
            coord.admin_reset_round(0).await,
            Err(CoordError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_missing_requires_sink() {
        let store = Arc::new(MemStore::new());
        let coord = Coordinator::new(test_cfg(), store as Arc<dyn KvStore>, None);
        assert!(matches!(
            coord.admin_mark_missing(3, "lost", "").await,
            Err(CoordError::SinkNotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_mark_missing_writes_placeholder() {
        let (coord, _, sink) = coordinator_with(test_cfg());
        let result = coord.admin_mark_missing(9, "store outage", "-").await.unwrap();
        assert!(result["path"].as_str().unwrap().contains("missing/9"));
        assert_eq!(*sink.missing.lock().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_backfill_re_logs_current_global() {
        let (coord, _, sink) = coordinator_with(test_cfg());
        for s in ["a", "b", "c"] {
            coord.upload(upload_req(s, "zombie", false)).await.unwrap();
        }
        coord.flush_backlog().await;
        assert_eq!(*sink.written.lock().unwrap(), vec![1]);
        let result = coord.backfill_current_global().await.unwrap();
        assert_eq!(result["globalRound"], 1);
        assert_eq!(result["pendingRoundLogs"], 0);
        // раунд 1 выгружен повторно (идемпотентно по пути)
        assert_eq!(*sink.written.lock().unwrap(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_heartbeat_touches_known_contributors() {
        let (coord, _, _) = coordinator_with(test_cfg());
        coord.upload(upload_req("a", "zombie", false)).await.unwrap();
        let ack = coord
            .heartbeat(
                Some("a".into()),
                vec!["zombie".into(), "spider".into()],
            )
            .await
            .unwrap();
        assert_eq!(ack.updated_count, 1); // spider ещё не вкладывался
        assert!(coord.heartbeat(None, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let (coord, _, _) = coordinator_with(test_cfg());
        let missing_mob = UploadRequest {
            server_id: Some("a".into()),
            mob_type: None,
            tactics: Some(flank_table()),
            bootstrap: false,
        };
        assert!(matches!(
            coord.upload(missing_mob).await,
            Err(CoordError::BadRequest(_))
        ));

        let mut bad_tactics = TacticTable::new();
        bad_tactics.insert(
            "ghost".into(),
            TacticStats {
                count: 0,
                avg_reward: f64::NAN,
                success_count: 0,
                failure_count: 0,
                success_rate: None,
            },
        );
        let req = UploadRequest {
            server_id: Some("a".into()),
            mob_type: Some("zombie".into()),
            tactics: Some(bad_tactics),
            bootstrap: false,
        };
        assert!(matches!(
            coord.upload(req).await,
            Err(CoordError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_tiers_and_episodes_roundtrip() {
        let (coord, _, _) = coordinator_with(test_cfg());
        let mut incoming = TierState::new();
        incoming.experience.insert("zombie".into(), 400);
        incoming
            .tiers
            .insert("zombie".into(), crate::tiers::MobTier::Trained);
        let merged = coord.tier_upload(incoming).await.unwrap();
        assert_eq!(merged["updated"], 1);
        assert_eq!(coord.tier_download().await.experience["zombie"], 400);

        let episode = EpisodeRecord {
            mob_type: "zombie".into(),
            sample_count: 16,
            episode_reward: 3.5,
            was_successful: true,
            damage_dealt: 12.0,
            damage_taken: 2.0,
            duration_ticks: 150,
            tactics_used: [("flank".to_string(), 2u64)].into_iter().collect(),
            timestamp: 0,
        };
        let ack = coord.episode_upload(episode).await.unwrap();
        assert_eq!(ack["episodeNumber"], 1);
        assert_eq!(ack["totalSamples"], 16);
        let weights = coord.tactical_weights().await;
        assert!(weights["zombie"]["flank"] > 0.0);

        let stats = coord.tactical_stats().await;
        assert_eq!(stats["totalEpisodes"], 1);
        assert_eq!(stats["mobs"]["zombie"]["episodes"], 1);
    }

    #[tokio::test]
    async fn test_global_model_is_replaced_not_mutated() {
        let (coord, _, _) = coordinator_with(test_cfg());
        for s in ["a", "b", "c"] {
            coord.upload(upload_req(s, "zombie", false)).await.unwrap();
        }
        let first = coord.get_global(None).await.unwrap();
        // новый раунд с другим мобом не трогает опубликованную модель
        coord.upload(upload_req("a", "spider", false)).await.unwrap();
        let again = coord.get_global(None).await.unwrap();
        assert_eq!(first, again);
        // ...а следующая агрегация её замещает
        coord.upload(upload_req("b", "spider", false)).await.unwrap();
        coord.upload(upload_req("c", "spider", false)).await.unwrap();
        let replaced = coord.get_global(None).await.unwrap();
        assert_eq!(replaced["round"], 2);
    }
}
