use std::future::Future;

use tokio::sync::OnceCell;

use crate::bus::BusConnection;
use crate::error::BusResult;

/// Idempotent guard for a process-wide connection, for contexts that own
/// exactly one channel to their creator.
///
/// The first caller runs the connect future; every other caller, before or
/// after that completes, receives the same cached outcome. A failed first
/// attempt is cached too and is never retried through this guard.
pub struct ConnectOnce {
    cell: OnceCell<BusResult<BusConnection>>,
}

impl ConnectOnce {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    /// The cached connection, connecting on first use.
    pub async fn get_or_connect<F, Fut>(&self, connect: F) -> BusResult<BusConnection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BusResult<BusConnection>>,
    {
        self.cell.get_or_init(connect).await.clone()
    }

    /// The cached outcome, if the first attempt already completed.
    pub fn get(&self) -> Option<&BusResult<BusConnection>> {
        self.cell.get()
    }
}

impl Default for ConnectOnce {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, ProtocolHandler};
    use crate::connect::{connect_pair, ConnectOptions};
    use crate::error::{BusError, ErrorCode};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct PingHandler;

    #[async_trait]
    impl ProtocolHandler for PingHandler {
        async fn dispatch(&self, _f: u32, _args: Vec<Value>) -> BusResult<Option<Value>> {
            Ok(Some(json!("pong")))
        }
    }

    #[tokio::test]
    async fn test_connects_only_once() {
        let once = ConnectOnce::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let attempts = attempts.clone();
            let conn = once
                .get_or_connect(|| async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let (active, _passive) = connect_pair(
                        BusConfig::new().protocol("ping", "A", "B", PingHandler),
                        BusConfig::new().protocol("ping", "B", "A", PingHandler),
                        ConnectOptions::default(),
                    )
                    .await?;
                    Ok(active)
                })
                .await
                .unwrap();
            assert!(conn.sender("ping").is_ok());
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_cached() {
        let once = ConnectOnce::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let attempts = attempts.clone();
            let err = once
                .get_or_connect(|| async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(BusError::new(ErrorCode::NotWorkerContext))
                })
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::NotWorkerContext);
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
