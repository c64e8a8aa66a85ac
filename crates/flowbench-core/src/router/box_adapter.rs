//! BoxModelAdapter -- object-safe dynamic dispatch wrapper for ModelAdapter.
//!
//! 1. `ModelAdapterDyn` is object-safe and returns boxed futures
//! 2. A blanket impl covers every `T: ModelAdapter`
//! 3. `BoxModelAdapter` wraps `Box<dyn ModelAdapterDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use flowbench_types::model::{AdapterError, ModelRequest, ModelResponse};

use super::adapter::ModelAdapter;

/// Object-safe version of [`ModelAdapter`] with boxed futures.
pub trait ModelAdapterDyn: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        model: &'a str,
        request: &'a ModelRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ModelResponse, AdapterError>> + Send + 'a>>;
}

impl<T: ModelAdapter> ModelAdapterDyn for T {
    fn name(&self) -> &str {
        ModelAdapter::name(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        model: &'a str,
        request: &'a ModelRequest,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ModelResponse, AdapterError>> + Send + 'a>> {
        Box::pin(self.invoke(model, request, timeout))
    }
}

/// Type-erased model adapter.
pub struct BoxModelAdapter {
    inner: Box<dyn ModelAdapterDyn + Send + Sync>,
}

impl BoxModelAdapter {
    pub fn new<T: ModelAdapter + 'static>(adapter: T) -> Self {
        Self {
            inner: Box::new(adapter),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn invoke(
        &self,
        model: &str,
        request: &ModelRequest,
        timeout: Duration,
    ) -> Result<ModelResponse, AdapterError> {
        self.inner.invoke_boxed(model, request, timeout).await
    }
}

impl std::fmt::Debug for BoxModelAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxModelAdapter")
            .field("name", &self.name())
            .finish()
    }
}
