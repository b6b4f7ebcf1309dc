//! Ontological constants for the Mobmind Coordinator
//!
//! These constants define the naming foundation of the Mobmind network:
//! a fleet of game servers sharing one collective tactical mind.

/// The name of the collective mind
pub const NETWORK_NAME: &str = "Mobmind";

/// The aggregation layer (rounds, FedAvg, global model)
pub const COLLECTIVE_MIND: &str = "Nous Bestiarum";

/// Network version
pub const VERSION: &str = "0.1.0-alpha";

/// Project tagline
pub const TAGLINE: &str = "Federated Mob Tactics through Collective Intelligence";

// ═══════════════════════════════════════════════════════════════
// Hard caps of the coordinator
// ═══════════════════════════════════════════════════════════════

/// Максимум записей в backlog завершённых раундов (старые вытесняются)
pub const MAX_BACKLOG_ROUNDS: usize = 250;

/// Максимум эпизодов в кольцевой истории боевых эпизодов
pub const MAX_EPISODE_HISTORY: usize = 1000;

/// EMA-коэффициент для обучения весов по эпизодам
pub const EPISODE_EMA_ALPHA: f64 = 0.05;

/// Вклад эпизода: победа +1.0, поражение −0.5
pub const EPISODE_WIN_MULT: f64 = 1.0;
pub const EPISODE_LOSS_MULT: f64 = -0.5;

/// HTTP порт по умолчанию (env PORT)
pub const DEFAULT_PORT: u16 = 8090;

/// Каталог sled-хранилища по умолчанию (env MOBMIND_DATA_DIR)
pub const DEFAULT_DATA_DIR: &str = "./mobmind-data";

/// Интервал фонового сброса backlog в лог-хранилище, секунды
pub const FLUSH_LOOP_INTERVAL_SECS: u64 = 60;

// ═══════════════════════════════════════════════════════════════
// Display functions
// ═══════════════════════════════════════════════════════════════

/// Print the main Mobmind banner
pub fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                MOBMIND COORDINATOR CORE                    ║");
    println!("║                                                            ║");
    println!("║  Nous Bestiarum • Federated Rounds • Global Tactics        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  {}", TAGLINE);
    println!("  {} v{} — {}", NETWORK_NAME, VERSION, COLLECTIVE_MIND);
    println!();
}
