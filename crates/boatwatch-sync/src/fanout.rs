//! Concurrent per-region fetch.

use std::sync::Arc;

use boatwatch_core::Region;
use boatwatch_storage::{FetchError, FetchedResponse, RegionSource};
use tokio::task::JoinSet;
use tracing::warn;

/// One region's fetch outcome.
#[derive(Debug)]
pub struct RegionFetch {
    pub region: Region,
    pub outcome: Result<FetchedResponse, FetchError>,
}

/// Fetches every region concurrently and waits for all of them.
///
/// Outcomes come back in the order of `regions`, whatever order the requests
/// finish in. A failing or panicking fetch only fails its own region.
pub async fn fetch_all(source: Arc<dyn RegionSource>, regions: &[Region]) -> Vec<RegionFetch> {
    let mut join_set = JoinSet::new();
    for (idx, region) in regions.iter().cloned().enumerate() {
        let source = Arc::clone(&source);
        join_set.spawn(async move {
            let outcome = source.fetch_region(&region).await;
            (idx, outcome)
        });
    }

    let mut slots: Vec<Option<Result<FetchedResponse, FetchError>>> =
        regions.iter().map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((idx, outcome)) => slots[idx] = Some(outcome),
            Err(err) => warn!(error = %err, "region fetch task failed"),
        }
    }

    regions
        .iter()
        .cloned()
        .zip(slots)
        .map(|(region, slot)| RegionFetch {
            outcome: slot.unwrap_or_else(|| {
                Err(FetchError::Transport("fetch task failed".to_string()))
            }),
            region,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use boatwatch_storage::StatusCode;
    use std::time::Duration;

    /// Answers region `n` after `(10 - n) * 10` ms so later regions finish first.
    struct ReversedLatency;

    #[async_trait]
    impl RegionSource for ReversedLatency {
        async fn fetch_region(&self, region: &Region) -> Result<FetchedResponse, FetchError> {
            tokio::time::sleep(Duration::from_millis(u64::from(10 - region.id) * 10)).await;
            match region.code.as_str() {
                "BOOM" => panic!("source blew up"),
                "DOWN" => Err(FetchError::HttpStatus { status: 502 }),
                _ => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: format!("fixture://{}", region.code),
                    body: region.code.clone().into_bytes(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn outcomes_follow_configured_order() {
        let regions: Vec<Region> = (1..=5).map(|id| Region::new(id, format!("R{id}"))).collect();
        let fetched = fetch_all(Arc::new(ReversedLatency), &regions).await;

        let codes: Vec<_> = fetched.iter().map(|f| f.region.code.as_str()).collect();
        assert_eq!(codes, ["R1", "R2", "R3", "R4", "R5"]);
        for f in &fetched {
            assert_eq!(f.outcome.as_ref().unwrap().body, f.region.code.as_bytes());
        }
    }

    #[tokio::test]
    async fn failures_stay_in_their_own_slot() {
        let regions = vec![
            Region::new(1, "OK1"),
            Region::new(2, "DOWN"),
            Region::new(3, "BOOM"),
            Region::new(4, "OK2"),
        ];
        let fetched = fetch_all(Arc::new(ReversedLatency), &regions).await;

        assert_eq!(fetched.len(), 4);
        assert!(fetched[0].outcome.is_ok());
        assert_eq!(fetched[1].outcome.as_ref().unwrap_err().to_string(), "HTTP 502");
        assert_eq!(
            fetched[2].outcome.as_ref().unwrap_err().to_string(),
            "fetch task failed"
        );
        assert!(fetched[3].outcome.is_ok());
    }

    #[tokio::test]
    async fn no_regions_no_work() {
        assert!(fetch_all(Arc::new(ReversedLatency), &[]).await.is_empty());
    }
}
