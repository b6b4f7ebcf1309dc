// =============================================================================
// MOBMIND CORE — sink.rs
// «Remote Log Sink (GitHub Contents API)»
// =============================================================================
//
// Идемпотентный писатель во внешнее объектное хранилище аудита.
// Один артефакт на завершённый раунд: rounds/<round>.json; заглушки
// потерянных раундов — rounds/missing/<round>.json.
//
// Запись идемпотентна по раунду: существующий файл перезаписывается
// (contents API требует sha текущей версии — сначала GET, потом PUT).
// Ошибки транзиентны и повторяются через сброс backlog'а.
// =============================================================================

use crate::backlog::BacklogEntry;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use std::time::Duration;

pub const GITHUB_API_BASE: &str = "https://api.github.com";
pub const SINK_TIMEOUT_SECS: u64 = 10;

/// Путь артефакта завершённого раунда
pub fn round_path(round: u64) -> String {
    format!("rounds/{}.json", round)
}

/// Путь заглушки невосполнимого раунда
pub fn missing_round_path(round: u64) -> String {
    format!("rounds/missing/{}.json", round)
}

// -----------------------------------------------------------------------------
// LogSink — контракт внешнего лог-хранилища
// -----------------------------------------------------------------------------

#[async_trait]
pub trait LogSink: Send + Sync {
    /// Создать-или-обновить артефакт раунда. Идемпотентно по round.
    async fn write_round(&self, entry: &BacklogEntry) -> Result<(), String>;

    /// Записать заглушку: раунд не будет восполнен
    async fn mark_missing(
        &self,
        round: u64,
        reason: &str,
        notes: &str,
    ) -> Result<serde_json::Value, String>;
}

// -----------------------------------------------------------------------------
// GitHubSink — реализация поверх GitHub contents API
// -----------------------------------------------------------------------------

pub struct GitHubSink {
    client: reqwest::Client,
    token: String,
    /// owner/name
    repo: String,
    branch: String,
}

impl GitHubSink {
    pub fn new(token: &str, repo: &str, branch: &str) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SINK_TIMEOUT_SECS))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(GitHubSink {
            client,
            token: token.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
        })
    }

    /// Чтение из env: GITHUB_TOKEN + GITHUB_REPO (owner/name), опционально
    /// GITHUB_BRANCH. Без токена sink отключён — координатор работает,
    /// backlog копится до появления конфигурации.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("GITHUB_TOKEN").ok()?;
        let repo = match std::env::var("GITHUB_REPO") {
            Ok(r) if r.contains('/') => r,
            Ok(r) => {
                log::warn!("GITHUB_REPO={} не в формате owner/name, sink отключён", r);
                return None;
            }
            Err(_) => {
                log::warn!("GITHUB_TOKEN задан, но GITHUB_REPO нет — sink отключён");
                return None;
            }
        };
        let branch = std::env::var("GITHUB_BRANCH").unwrap_or_else(|_| "main".to_string());
        match GitHubSink::new(&token, &repo, &branch) {
            Ok(sink) => {
                log::info!("🗄️ лог-хранилище: {} (ветка {})", repo, branch);
                Some(sink)
            }
            Err(e) => {
                log::warn!("не удалось создать HTTP-клиент sink'а: {}", e);
                None
            }
        }
    }

    fn contents_url(&self, path: &str) -> String {
        format!("{}/repos/{}/contents/{}", GITHUB_API_BASE, self.repo, path)
    }

    /// sha текущей версии файла, если он существует (нужен для update)
    async fn existing_sha(&self, url: &str) -> Result<Option<String>, String> {
        let resp = self
            .client
            .get(url)
            .query(&[("ref", self.branch.as_str())])
            .bearer_auth(&self.token)
            .header("User-Agent", "mobmind-coordinator")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| format!("GET {}: {}", url, e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(format!("GET {}: HTTP {}", url, resp.status()));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
        Ok(body["sha"].as_str().map(|s| s.to_string()))
    }

    /// create-or-update файла по пути
    async fn put_file(
        &self,
        path: &str,
        content: &serde_json::Value,
        message: &str,
    ) -> Result<serde_json::Value, String> {
        let url = self.contents_url(path);
        let sha = self.existing_sha(&url).await?;

        let pretty = serde_json::to_string_pretty(content).map_err(|e| e.to_string())?;
        let mut body = json!({
            "message": message,
            "content": BASE64.encode(pretty.as_bytes()),
            "branch": self.branch,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }

        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .header("User-Agent", "mobmind-coordinator")
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("PUT {}: {}", url, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("PUT {}: HTTP {} {}", url, status, text));
        }
        resp.json().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl LogSink for GitHubSink {
    async fn write_round(&self, entry: &BacklogEntry) -> Result<(), String> {
        let content = serde_json::to_value(entry).map_err(|e| e.to_string())?;
        let message = format!("brain: round {} global model", entry.round);
        self.put_file(&round_path(entry.round), &content, &message)
            .await?;
        Ok(())
    }

    async fn mark_missing(
        &self,
        round: u64,
        reason: &str,
        notes: &str,
    ) -> Result<serde_json::Value, String> {
        let content = json!({
            "round": round,
            "status": "missing",
            "reason": reason,
            "notes": notes,
            "markedAt": chrono::Utc::now().to_rfc3339(),
        });
        let message = format!("brain: mark round {} missing", round);
        let resp = self
            .put_file(&missing_round_path(round), &content, &message)
            .await?;
        Ok(json!({
            "path": missing_round_path(round),
            "commit": resp["commit"]["sha"],
        }))
    }
}

// -----------------------------------------------------------------------------
// MockSink — управляемый sink для тестов
// -----------------------------------------------------------------------------

#[cfg(test)]
pub struct MockSink {
    /// None — не падать; Some(n) — падать начиная с (n+1)-й записи
    fail_from: std::sync::Mutex<Option<usize>>,
    pub written: std::sync::Mutex<Vec<u64>>,
    pub missing: std::sync::Mutex<Vec<u64>>,
}

#[cfg(test)]
impl MockSink {
    pub fn new() -> Self {
        MockSink {
            fail_from: std::sync::Mutex::new(None),
            written: std::sync::Mutex::new(Vec::new()),
            missing: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn fail_always(&self) {
        *self.fail_from.lock().unwrap() = Some(0);
    }

    /// Успешно записать n раз, дальше падать
    pub fn fail_after(&self, n: usize) {
        *self.fail_from.lock().unwrap() = Some(n);
    }

    pub fn heal(&self) {
        *self.fail_from.lock().unwrap() = None;
    }
}

#[cfg(test)]
#[async_trait]
impl LogSink for MockSink {
    async fn write_round(&self, entry: &BacklogEntry) -> Result<(), String> {
        let mut written = self.written.lock().unwrap();
        if let Some(n) = *self.fail_from.lock().unwrap() {
            if written.len() >= n {
                return Err("мок: sink недоступен".to_string());
            }
        }
        written.push(entry.round);
        Ok(())
    }

    async fn mark_missing(
        &self,
        round: u64,
        _reason: &str,
        _notes: &str,
    ) -> Result<serde_json::Value, String> {
        if let Some(0) = *self.fail_from.lock().unwrap() {
            return Err("мок: sink недоступен".to_string());
        }
        self.missing.lock().unwrap().push(round);
        Ok(json!({ "path": missing_round_path(round) }))
    }
}
