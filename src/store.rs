// =============================================================================
// MOBMIND CORE — store.rs
// «Durable Key/Value Storage»
// =============================================================================
//
// Абстракция персистентности координатора. Все операции вызываются
// только из-под актора (единственный писатель), межзапросных блокировок
// внутри стора нет. put обязан быть durable до подтверждения —
// sled-реализация делает flush после каждой записи.
//
// Значения — JSON-строки: персистентное состояние обязано без потерь
// проходить через JSON (это же схема, которую видят инструменты аудита).
// =============================================================================

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

// Ключи персистентного состояния координатора
pub const KEY_CURRENT_ROUND: &str = "currentRound";
pub const KEY_CONTRIBUTORS: &str = "contributors";
pub const KEY_MODELS: &str = "models";
pub const KEY_GLOBAL_MODEL: &str = "globalModel";
pub const KEY_LAST_AGGREGATION: &str = "lastAggregation";
pub const KEY_TACTICAL_DATA: &str = "tacticalData";
pub const KEY_TIER_DATA: &str = "tierData";
pub const KEY_PENDING_ROUND_LOGS: &str = "pendingRoundLogs";
pub const KEY_LAST_LOG_ERROR: &str = "lastGitHubLogError";

// -----------------------------------------------------------------------------
// KvStore — контракт хранилища
// -----------------------------------------------------------------------------

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, String>;
    fn put(&self, key: &str, value: &str) -> Result<(), String>;
    fn delete(&self, key: &str) -> Result<(), String>;
    fn delete_all(&self) -> Result<(), String>;
}

/// Прочитать и распарсить значение; битый JSON — warn и None
/// (восстановление после рестарта не должно падать из-за одного ключа).
pub fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Option<T> {
    match store.get(key) {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("ключ {}: JSON не парсится ({}), игнорируем", key, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            log::warn!("ключ {}: ошибка чтения ({})", key, e);
            None
        }
    }
}

/// Сериализовать и записать значение под ключом
pub fn save_json<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<(), String> {
    let raw = serde_json::to_string(value).map_err(|e| e.to_string())?;
    store.put(key, &raw)
}

// -----------------------------------------------------------------------------
// SledStore — durable реализация поверх sled
// -----------------------------------------------------------------------------

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self, String> {
        let db = sled::open(path).map_err(|e| format!("sled open {}: {}", path, e))?;
        Ok(SledStore { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        match self.db.get(key) {
            Ok(Some(bytes)) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| format!("ключ {} не utf-8: {}", key, e)),
            Ok(None) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), String> {
        self.db
            .insert(key, value.as_bytes())
            .map_err(|e| e.to_string())?;
        // durable до подтверждения
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), String> {
        self.db.remove(key).map_err(|e| e.to_string())?;
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }

    fn delete_all(&self) -> Result<(), String> {
        self.db.clear().map_err(|e| e.to_string())?;
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// MemStore — реализация в памяти (тесты, локальный прогон без диска)
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct MemStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), String> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), String> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn delete_all(&self) -> Result<(), String> {
        self.map.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        round: u64,
        label: String,
    }

    #[test]
    fn test_memstore_contract() {
        let store = MemStore::new();
        assert_eq!(store.get("missing").unwrap(), None);
        store.put("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);

        store.put("a", "1").unwrap();
        store.put("b", "2").unwrap();
        store.delete_all().unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn test_json_roundtrip_helpers() {
        let store = MemStore::new();
        let payload = Payload {
            round: 7,
            label: "зомби".into(),
        };
        save_json(&store, KEY_GLOBAL_MODEL, &payload).unwrap();
        let back: Payload = load_json(&store, KEY_GLOBAL_MODEL).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_load_json_tolerates_garbage() {
        let store = MemStore::new();
        store.put(KEY_MODELS, "{не json").unwrap();
        let parsed: Option<Payload> = load_json(&store, KEY_MODELS);
        assert!(parsed.is_none());
    }
}
