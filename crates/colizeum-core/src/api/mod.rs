mod client;
mod error;
mod models;

pub use client::{ApiClient, ApiConfig, ApiMode, DEFAULT_API_URL};
pub use error::ApiError;
pub use models::{
    Earnings, Energy, EnergyConsumption, EnergyToken, SecondaryCurrency, User, Wallet,
};
