pub mod sqlite;

use crate::errors::AppResult;
use crate::models::ServerConfig;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// One result record, columns in the order the backend returned them.
pub type ResultRow = serde_json::Map<String, serde_json::Value>;

/// Opens (or reuses) a connection for a logical server and runs one query.
///
/// Implementations own query timeouts. Failures should carry a message with
/// "connection"/"network" for connectivity problems and "syntax"/"invalid"
/// for rejected queries so rows get the right error type. A query that fails
/// because `cancel` fired is not recorded against its row.
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn execute_query(
        &self,
        server_name: &str,
        config: &ServerConfig,
        sql: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<ResultRow>>;
}
