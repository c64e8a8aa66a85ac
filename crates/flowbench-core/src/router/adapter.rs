//! ModelAdapter trait definition.

use std::time::Duration;

use flowbench_types::model::{AdapterError, ModelRequest, ModelResponse};

/// A backend able to serve model requests (a local server, a hosted API).
///
/// Uses native async fn in traits (RPITIT). Implementations live in
/// flowbench-infra; wrap them in `BoxModelAdapter` for registry storage.
pub trait ModelAdapter: Send + Sync {
    /// Adapter name as referenced by model table bindings.
    fn name(&self) -> &str;

    /// Invoke `model` (the backend's own model name) with `request`.
    ///
    /// Implementations should honour `timeout` themselves; the router also
    /// enforces it around the call.
    fn invoke(
        &self,
        model: &str,
        request: &ModelRequest,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<ModelResponse, AdapterError>> + Send;
}
