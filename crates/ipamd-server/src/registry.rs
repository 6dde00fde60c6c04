//! Handler registration and lookup.
//!
//! Each domain service registers its operations through
//! [`ServiceRegistrar`]. The registry stores handlers type-erased, keyed by
//! operation identifier, together with the payload schemas the validation
//! stage checks before dispatch.
//!
//! # Example
//!
//! ```rust
//! use ipamd_core::{Empty, RequestContext, RpcResult};
//! use ipamd_server::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//! registry
//!     .register_fn(
//!         "/ipam.service.v1.VlanService/ListVlans",
//!         |_ctx: RequestContext, _req: Empty| async move { RpcResult::Ok(Vec::<u32>::new()) },
//!     )
//!     .unwrap();
//!
//! assert!(registry.contains("/ipam.service.v1.VlanService/ListVlans"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use ipamd_core::{ErasedHandler, FnHandler, Handler, RequestContext, RpcResult, TypedHandler};
use ipamd_middleware::stages::{PayloadSchema, SchemaSet};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ServerError, ServerResult};

/// A service that contributes operations to the registry.
pub trait ServiceRegistrar: Send + Sync {
    /// Service name used in startup logs.
    fn service_name(&self) -> &'static str;

    /// Registers every operation of the service.
    fn register(&self, registry: &mut HandlerRegistry) -> ServerResult<()>;
}

/// Operation identifier to handler map.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
    schemas: SchemaSet,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("operations", &self.operations())
            .field("schemas", &self.schemas.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed handler.
    ///
    /// # Errors
    ///
    /// [`ServerError::DuplicateOperation`] if the operation already has a
    /// handler.
    pub fn register<H, Req, Res>(
        &mut self,
        operation: impl Into<String>,
        handler: H,
    ) -> ServerResult<()>
    where
        H: Handler<Req, Res>,
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
    {
        self.insert(operation.into(), Arc::new(TypedHandler::new(handler)))
    }

    /// Registers a typed handler whose payload is checked against `schema`.
    ///
    /// # Errors
    ///
    /// [`ServerError::DuplicateOperation`] if the operation already has a
    /// handler.
    pub fn register_with_schema<H, Req, Res>(
        &mut self,
        operation: impl Into<String>,
        handler: H,
        schema: PayloadSchema,
    ) -> ServerResult<()>
    where
        H: Handler<Req, Res>,
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
    {
        let operation = operation.into();
        self.insert(operation.clone(), Arc::new(TypedHandler::new(handler)))?;
        self.schemas.insert(operation, schema);
        Ok(())
    }

    /// Registers a closure handler.
    ///
    /// # Errors
    ///
    /// [`ServerError::DuplicateOperation`] if the operation already has a
    /// handler.
    pub fn register_fn<F, Fut, Req, Res>(
        &mut self,
        operation: impl Into<String>,
        func: F,
    ) -> ServerResult<()>
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Res>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
    {
        self.register(operation, FnHandler::new(func))
    }

    /// Registers every operation of `service`.
    ///
    /// # Errors
    ///
    /// Propagates the first registration failure.
    pub fn register_service(&mut self, service: &dyn ServiceRegistrar) -> ServerResult<()> {
        let before = self.len();
        service.register(self)?;
        tracing::debug!(
            service = service.service_name(),
            operations = self.len() - before,
            "service registered"
        );
        Ok(())
    }

    fn insert(&mut self, operation: String, handler: Arc<dyn ErasedHandler>) -> ServerResult<()> {
        if self.handlers.contains_key(&operation) {
            return Err(ServerError::duplicate_operation(operation));
        }
        self.handlers.insert(operation, handler);
        Ok(())
    }

    /// Looks up the handler of an operation.
    #[must_use]
    pub fn get(&self, operation: &str) -> Option<Arc<dyn ErasedHandler>> {
        self.handlers.get(operation).cloned()
    }

    /// Returns `true` if the operation has a handler.
    #[must_use]
    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Returns the number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Returns the registered operations, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<&str> {
        let mut operations: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        operations.sort_unstable();
        operations
    }

    /// Returns the payload schemas registered alongside the handlers.
    #[must_use]
    pub fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }
}
