//! Store doubles for exercising degraded paths.

use async_trait::async_trait;
use std::time::Duration;

use super::{Store, StoreMode, Versioned, WindowOutcome, WindowRequest};
use crate::circuit::CircuitRecord;
use crate::error::StoreError;

/// A store whose backend is down.
pub(crate) struct UnavailableStore;

/// A store that never answers.
pub(crate) struct HangingStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

async fn hang<T>() -> Result<T, StoreError> {
    std::future::pending::<()>().await;
    Err(down())
}

#[async_trait]
impl Store for UnavailableStore {
    fn mode(&self) -> StoreMode {
        StoreMode::Shared
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn sliding_window(&self, _: &str, _: &WindowRequest) -> Result<WindowOutcome, StoreError> {
        Err(down())
    }

    async fn window_count(&self, _: &str, _: u64, _: u64) -> Result<u64, StoreError> {
        Err(down())
    }

    async fn clear_window(&self, _: &str) -> Result<(), StoreError> {
        Err(down())
    }

    async fn load_circuit(&self, _: &str) -> Result<Option<Versioned<CircuitRecord>>, StoreError> {
        Err(down())
    }

    async fn save_circuit(
        &self,
        _: &str,
        _: u64,
        _: &CircuitRecord,
        _: Duration,
        _: u64,
    ) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(down())
    }
}

#[async_trait]
impl Store for HangingStore {
    fn mode(&self) -> StoreMode {
        StoreMode::Shared
    }

    fn name(&self) -> &'static str {
        "hanging"
    }

    async fn sliding_window(&self, _: &str, _: &WindowRequest) -> Result<WindowOutcome, StoreError> {
        hang().await
    }

    async fn window_count(&self, _: &str, _: u64, _: u64) -> Result<u64, StoreError> {
        hang().await
    }

    async fn clear_window(&self, _: &str) -> Result<(), StoreError> {
        hang().await
    }

    async fn load_circuit(&self, _: &str) -> Result<Option<Versioned<CircuitRecord>>, StoreError> {
        hang().await
    }

    async fn save_circuit(
        &self,
        _: &str,
        _: u64,
        _: &CircuitRecord,
        _: Duration,
        _: u64,
    ) -> Result<bool, StoreError> {
        hang().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        hang().await
    }
}
