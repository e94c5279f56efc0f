use crate::error::AppError;
use crate::models::{LogUsageRequest, UsageResponse};
use crate::session::Session;
use async_trait::async_trait;

pub mod http;

#[async_trait]
pub trait UsageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_usage(&self, session: &Session) -> Result<UsageResponse, AppError>;

    async fn log_usage(&self, session: &Session, request: &LogUsageRequest)
        -> Result<(), AppError>;
}
