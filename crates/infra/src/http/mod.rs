//! Google Sheets HTTP adapter

pub mod auth;
pub mod client;

pub use auth::{AccessTokenProvider, StaticTokenProvider};
pub use client::{SheetsHttpClient, SheetsHttpClientBuilder, DEFAULT_BASE_URL};
