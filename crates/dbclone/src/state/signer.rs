//! Audit signature over a finished run.

use async_trait::async_trait;

use super::{hmac_hex, RunSummary};
use crate::error::Result;

/// The `sign(run)` hook. Failures are logged by the caller and never change
/// the run's terminal status.
#[async_trait]
pub trait AuditSigner: Send + Sync {
    async fn sign(&self, summary: &RunSummary) -> Result<String>;
}

/// HMAC-SHA256 over the JSON form of the summary, hex-encoded.
pub struct HmacAuditSigner {
    key: Vec<u8>,
}

impl HmacAuditSigner {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }
}

#[async_trait]
impl AuditSigner for HmacAuditSigner {
    async fn sign(&self, summary: &RunSummary) -> Result<String> {
        // `tables` is a BTreeMap, so equal summaries serialize identically.
        let content = serde_json::to_vec(summary)?;
        hmac_hex(&self.key, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RunStatus, TableState};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn summary(status: RunStatus) -> RunSummary {
        let at = Utc::now();
        RunSummary {
            run_id: "run-1".into(),
            status,
            total_jobs: 3,
            processed_jobs: 3,
            failed_jobs: 0,
            rows_transferred: 3,
            started_at: at,
            finished_at: at,
            tables: BTreeMap::from([("users".to_string(), TableState::skipped())]),
        }
    }

    #[tokio::test]
    async fn test_signature_is_stable_and_keyed() {
        let s = summary(RunStatus::Completed);
        let a = HmacAuditSigner::new("k1").sign(&s).await.unwrap();
        let b = HmacAuditSigner::new("k1").sign(&s).await.unwrap();
        let c = HmacAuditSigner::new("k2").sign(&s).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);

        let d = HmacAuditSigner::new("k1")
            .sign(&summary(RunStatus::Failed))
            .await
            .unwrap();
        assert_ne!(a, d);
    }
}
