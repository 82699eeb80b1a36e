use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope wrapping every resource payload: `{"item": ...}`.
#[derive(Debug, Deserialize)]
pub(crate) struct Item<T> {
    pub item: T,
}

/// Account profile returned by `/users/me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub twitter: Option<String>,
    pub discord: Option<String>,
    pub telegram: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub wallets: Vec<Wallet>,
    #[serde(default)]
    pub energy: Energy,
    #[serde(rename = "secondaryCurrency", default)]
    pub secondary_currency: SecondaryCurrency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub address: String,
}

/// Energy balance, aggregated and per owned token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Energy {
    pub total_energy: i64,
    pub max_energy: i64,
    #[serde(default)]
    pub tokens: Vec<EnergyToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyToken {
    pub token_id: String,
    pub energy: i64,
    pub max_energy: i64,
    pub next_energy_at: Option<DateTime<Utc>>,
    pub energy_regeneration_amount: i64,
    pub energy_regeneration_rate: i64,
}

/// Result of an energy consumption request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyConsumption {
    pub remaining_energy: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecondaryCurrency {
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Earnings {
    pub total: f64,
}
