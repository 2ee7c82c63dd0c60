// Cross-Shard Query Execution
//
// Fans a query out to the shards that carry the referenced tables, collects
// per-shard results and merges them. Dispatch is parallel with a per-shard
// deadline; one slow or failed shard never aborts its peers, it simply
// yields a failed result entry.
//
// The built-in merge concatenates rows, which is only correct for simple
// projections. Queries needing cross-shard joins or global aggregation are
// rejected unless the caller registers a merge function that knows how to
// combine partial results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClusterError, Result};
use crate::sharding::ShardId;

/// A shard endpoint the executor can dispatch to, with the tables it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEndpoint {
    pub id: ShardId,
    pub address: String,
    pub port: u16,
    pub tables: Vec<String>,
}

/// Result of running a query on one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardQueryResult {
    pub shard_id: ShardId,
    pub rows: Vec<Vec<String>>,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ShardQueryResult {
    fn failed(shard_id: ShardId, error: String, elapsed_ms: u64) -> Self {
        Self {
            shard_id,
            rows: Vec::new(),
            success: false,
            error: Some(error),
            elapsed_ms,
        }
    }
}

/// Callback that runs the query on a single shard.
#[async_trait]
pub trait ShardQueryDriver: Send + Sync {
    async fn execute(&self, shard: &ShardEndpoint, query: &str) -> Result<Vec<Vec<String>>>;
}

/// Caller-supplied merge for aggregations the concat merge cannot handle.
pub type MergeFn = Arc<dyn Fn(&[ShardQueryResult]) -> Result<Vec<Vec<String>>> + Send + Sync>;

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub query_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// Cross-shard query executor.
pub struct CrossShardExecutor {
    config: QueryConfig,
    shards: RwLock<HashMap<ShardId, ShardEndpoint>>,
    driver: RwLock<Option<Arc<dyn ShardQueryDriver>>>,
    merge_fn: RwLock<Option<MergeFn>>,
}

impl CrossShardExecutor {
    pub fn new(config: QueryConfig) -> Self {
        Self {
            config,
            shards: RwLock::new(HashMap::new()),
            driver: RwLock::new(None),
            merge_fn: RwLock::new(None),
        }
    }

    pub fn set_driver(&self, driver: Arc<dyn ShardQueryDriver>) {
        *self.driver.write() = Some(driver);
    }

    pub fn set_merge_fn(&self, merge: MergeFn) {
        *self.merge_fn.write() = Some(merge);
    }

    pub fn add_shard(&self, shard: ShardEndpoint) -> Result<()> {
        let mut shards = self.shards.write();
        if shards.contains_key(&shard.id) {
            return Err(ClusterError::Duplicate(format!("shard {}", shard.id)));
        }
        shards.insert(shard.id.clone(), shard);
        Ok(())
    }

    pub fn remove_shard(&self, id: &str) -> Result<()> {
        self.shards
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("shard {}", id)))
    }

    pub fn shards(&self) -> Vec<ShardEndpoint> {
        self.shards.read().values().cloned().collect()
    }

    pub fn shards_for_table(&self, table: &str) -> Vec<ShardEndpoint> {
        self.shards
            .read()
            .values()
            .filter(|s| s.tables.iter().any(|t| t == table))
            .cloned()
            .collect()
    }

    /// Execute on every relevant shard. Relevance comes from the tables the
    /// query references; when none can be extracted the query conservatively
    /// fans out to all shards.
    pub async fn execute_on_all(&self, query: &str) -> Result<Vec<ShardQueryResult>> {
        let targets = self.relevant_shards(query);
        self.dispatch(query, targets).await
    }

    /// Execute on an explicit shard subset.
    pub async fn execute_on_subset(
        &self,
        query: &str,
        shard_ids: &[ShardId],
    ) -> Result<Vec<ShardQueryResult>> {
        let shards = self.shards.read();
        let mut targets = Vec::new();
        for id in shard_ids {
            let shard = shards
                .get(id)
                .ok_or_else(|| ClusterError::NotFound(format!("shard {}", id)))?;
            targets.push(shard.clone());
        }
        drop(shards);
        self.dispatch(query, targets).await
    }

    /// Merge per-shard results into one row set: the registered merge
    /// function when present, plain concatenation otherwise.
    pub fn merge(&self, results: &[ShardQueryResult]) -> Result<Vec<Vec<String>>> {
        if let Some(merge) = self.merge_fn.read().clone() {
            return merge(results);
        }
        Ok(results
            .iter()
            .filter(|r| r.success)
            .flat_map(|r| r.rows.iter().cloned())
            .collect())
    }

    async fn dispatch(
        &self,
        query: &str,
        targets: Vec<ShardEndpoint>,
    ) -> Result<Vec<ShardQueryResult>> {
        if targets.is_empty() {
            return Err(ClusterError::Unavailable("no shards registered".into()));
        }
        if Self::needs_global_merge(query) && self.merge_fn.read().is_none() {
            return Err(ClusterError::InvalidArgument(
                "query requires cross-shard aggregation; supply a merge function".into(),
            ));
        }
        let driver = self
            .driver
            .read()
            .clone()
            .ok_or_else(|| ClusterError::Unavailable("no shard query driver registered".into()))?;

        debug!(shards = targets.len(), query, "dispatching cross-shard query");
        let timeout = self.config.query_timeout;
        let results = join_all(targets.into_iter().map(|shard| {
            let driver = Arc::clone(&driver);
            let query = query.to_string();
            async move {
                let started = std::time::Instant::now();
                let run = driver.execute(&shard, &query);
                match tokio::time::timeout(timeout, run).await {
                    Ok(Ok(rows)) => ShardQueryResult {
                        shard_id: shard.id,
                        rows,
                        success: true,
                        error: None,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    },
                    Ok(Err(e)) => {
                        warn!(shard = %shard.id, error = %e, "shard query failed");
                        ShardQueryResult::failed(
                            shard.id,
                            e.code().to_string(),
                            started.elapsed().as_millis() as u64,
                        )
                    }
                    Err(_) => {
                        warn!(shard = %shard.id, "shard query timed out");
                        ShardQueryResult::failed(
                            shard.id,
                            "timeout".to_string(),
                            started.elapsed().as_millis() as u64,
                        )
                    }
                }
            }
        }))
        .await;
        Ok(results)
    }

    fn relevant_shards(&self, query: &str) -> Vec<ShardEndpoint> {
        let tables = Self::extract_tables(query);
        let shards = self.shards.read();
        if tables.is_empty() {
            return shards.values().cloned().collect();
        }
        let relevant: Vec<ShardEndpoint> = shards
            .values()
            .filter(|s| s.tables.iter().any(|t| tables.contains(t)))
            .cloned()
            .collect();
        if relevant.is_empty() {
            // No shard claims the tables; fall back to full fan-out rather
            // than silently returning nothing.
            shards.values().cloned().collect()
        } else {
            relevant
        }
    }

    /// Pull table names out of FROM / JOIN / INTO / UPDATE clauses. This is
    /// deliberately shallow: the per-node executor owns real SQL parsing.
    fn extract_tables(query: &str) -> Vec<String> {
        let mut tables = Vec::new();
        let tokens: Vec<&str> = query.split_whitespace().collect();
        for window in tokens.windows(2) {
            let keyword = window[0].to_ascii_uppercase();
            if keyword == "FROM" || keyword == "JOIN" || keyword == "INTO" || keyword == "UPDATE" {
                let table = window[1]
                    .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                    .to_string();
                if !table.is_empty() && !tables.contains(&table) {
                    tables.push(table);
                }
            }
        }
        tables
    }

    fn needs_global_merge(query: &str) -> bool {
        let upper = query.to_ascii_uppercase();
        upper.contains("GROUP BY") || upper.contains("HAVING") || upper.contains(" JOIN ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeDriver {
        rows_by_shard: HashMap<ShardId, Vec<Vec<String>>>,
        slow_shards: Vec<ShardId>,
        executed: Mutex<Vec<ShardId>>,
    }

    #[async_trait]
    impl ShardQueryDriver for FakeDriver {
        async fn execute(&self, shard: &ShardEndpoint, _query: &str) -> Result<Vec<Vec<String>>> {
            self.executed.lock().push(shard.id.clone());
            if self.slow_shards.contains(&shard.id) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(self.rows_by_shard.get(&shard.id).cloned().unwrap_or_default())
        }
    }

    fn endpoint(id: &str, tables: &[&str]) -> ShardEndpoint {
        ShardEndpoint {
            id: id.to_string(),
            address: "10.0.1.1".into(),
            port: 7300,
            tables: tables.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn executor_with(
        timeout: Duration,
        driver: FakeDriver,
        shards: Vec<ShardEndpoint>,
    ) -> (CrossShardExecutor, Arc<FakeDriver>) {
        let executor = CrossShardExecutor::new(QueryConfig {
            query_timeout: timeout,
        });
        let driver = Arc::new(driver);
        executor.set_driver(driver.clone());
        for shard in shards {
            executor.add_shard(shard).unwrap();
        }
        (executor, driver)
    }

    fn rows(values: &[&str]) -> Vec<Vec<String>> {
        values.iter().map(|v| vec![v.to_string()]).collect()
    }

    #[tokio::test]
    async fn test_fan_out_collects_all_shards() {
        let mut rows_by_shard = HashMap::new();
        rows_by_shard.insert("sh1".to_string(), rows(&["a"]));
        rows_by_shard.insert("sh2".to_string(), rows(&["b"]));
        let (executor, _) = executor_with(
            Duration::from_secs(10),
            FakeDriver {
                rows_by_shard,
                slow_shards: Vec::new(),
                executed: Mutex::new(Vec::new()),
            },
            vec![endpoint("sh1", &["t"]), endpoint("sh2", &["t"])],
        );

        let results = executor.execute_on_all("SELECT x FROM t").await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));

        let merged = executor.merge(&results).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn test_relevance_prunes_unrelated_shards() {
        let (executor, driver) = executor_with(
            Duration::from_secs(10),
            FakeDriver {
                rows_by_shard: HashMap::new(),
                slow_shards: Vec::new(),
                executed: Mutex::new(Vec::new()),
            },
            vec![endpoint("sh1", &["users"]), endpoint("sh2", &["orders"])],
        );

        let results = executor
            .execute_on_all("SELECT x FROM users")
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(driver.executed.lock().as_slice(), &["sh1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_tables_fan_out_everywhere() {
        let (executor, _) = executor_with(
            Duration::from_secs(10),
            FakeDriver {
                rows_by_shard: HashMap::new(),
                slow_shards: Vec::new(),
                executed: Mutex::new(Vec::new()),
            },
            vec![endpoint("sh1", &["users"]), endpoint("sh2", &["orders"])],
        );

        let results = executor.execute_on_all("SHOW STATUS").await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_shard_captured_as_timeout() {
        let mut rows_by_shard = HashMap::new();
        rows_by_shard.insert("sh1".to_string(), rows(&["a"]));
        rows_by_shard.insert("sh3".to_string(), rows(&["c"]));
        let (executor, _) = executor_with(
            Duration::from_millis(50),
            FakeDriver {
                rows_by_shard,
                slow_shards: vec!["sh2".to_string()],
                executed: Mutex::new(Vec::new()),
            },
            vec![
                endpoint("sh1", &["t"]),
                endpoint("sh2", &["t"]),
                endpoint("sh3", &["t"]),
            ],
        );

        let mut results = executor.execute_on_all("SELECT x FROM t").await.unwrap();
        results.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].error.as_deref(), Some("timeout"));
        assert!(results[2].success);
        assert_eq!(results[0].rows, rows(&["a"]));
        assert_eq!(results[2].rows, rows(&["c"]));
    }

    #[tokio::test]
    async fn test_no_shards_is_unavailable() {
        let executor = CrossShardExecutor::new(QueryConfig::default());
        let err = executor.execute_on_all("SELECT 1").await.unwrap_err();
        assert_eq!(err.code(), "unavailable");
    }

    #[tokio::test]
    async fn test_subset_with_unknown_shard() {
        let (executor, _) = executor_with(
            Duration::from_secs(10),
            FakeDriver {
                rows_by_shard: HashMap::new(),
                slow_shards: Vec::new(),
                executed: Mutex::new(Vec::new()),
            },
            vec![endpoint("sh1", &["t"])],
        );
        let err = executor
            .execute_on_subset("SELECT x FROM t", &["ghost".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn test_aggregation_rejected_without_merge_fn() {
        let (executor, _) = executor_with(
            Duration::from_secs(10),
            FakeDriver {
                rows_by_shard: HashMap::new(),
                slow_shards: Vec::new(),
                executed: Mutex::new(Vec::new()),
            },
            vec![endpoint("sh1", &["t"])],
        );
        let err = executor
            .execute_on_all("SELECT count(*) FROM t GROUP BY x")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[tokio::test]
    async fn test_aggregation_allowed_with_merge_fn() {
        let mut rows_by_shard = HashMap::new();
        rows_by_shard.insert("sh1".to_string(), rows(&["2"]));
        rows_by_shard.insert("sh2".to_string(), rows(&["3"]));
        let (executor, _) = executor_with(
            Duration::from_secs(10),
            FakeDriver {
                rows_by_shard,
                slow_shards: Vec::new(),
                executed: Mutex::new(Vec::new()),
            },
            vec![endpoint("sh1", &["t"]), endpoint("sh2", &["t"])],
        );
        executor.set_merge_fn(Arc::new(|results: &[ShardQueryResult]| {
            let total: i64 = results
                .iter()
                .flat_map(|r| r.rows.iter())
                .filter_map(|row| row.first())
                .filter_map(|v| v.parse::<i64>().ok())
                .sum();
            Ok(vec![vec![total.to_string()]])
        }));

        let results = executor
            .execute_on_all("SELECT count(*) FROM t GROUP BY x")
            .await
            .unwrap();
        let merged = executor.merge(&results).unwrap();
        assert_eq!(merged, vec![vec!["5".to_string()]]);
    }

    #[test]
    fn test_extract_tables() {
        assert_eq!(
            CrossShardExecutor::extract_tables("SELECT a FROM users WHERE x = 1"),
            vec!["users"]
        );
        assert_eq!(
            CrossShardExecutor::extract_tables(
                "select o.id from orders o join customers c on c.id = o.cid"
            ),
            vec!["orders", "customers"]
        );
        assert!(CrossShardExecutor::extract_tables("SHOW STATUS").is_empty());
    }
}
