//! Request payload validation middleware.
//!
//! Applies the structural constraints declared for an operation (required
//! fields, field types, format rules) to the decoded request payload. A
//! violation is returned as `InvalidArgument` with per-field details and the
//! handler is not invoked. Operations without a declared schema pass through.
//!
//! This stage is innermost, so payload details are only ever reported to
//! callers that already passed authentication.
//!
//! # Pipeline Position
//!
//! ```text
//! Recovery → Viewer → AccessLog → MutualTls? → Audit → [Validation] → Handler
//! ```
//!
//! # Example
//!
//! ```
//! use ipamd_middleware::stages::{FieldFormat, FieldType, PayloadSchema};
//! use serde_json::json;
//!
//! let schema = PayloadSchema::new()
//!     .required("cidr", FieldType::String)
//!     .format("cidr", FieldFormat::Cidr)
//!     .optional("tenant_id", FieldType::Integer);
//!
//! assert!(schema.validate(&json!({"cidr": "10.0.0.0/24"})).is_ok());
//! assert!(schema.validate(&json!({"cidr": "10.0.0.0/33"})).is_err());
//! ```

use crate::{
    context::MiddlewareContext,
    middleware::{BoxFuture, Middleware, Next},
    types::{Reply, RpcRequest},
};
use ipamd_core::{FieldErrors, RpcError, RpcResult};
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Expected JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// JSON string.
    String,
    /// JSON integer.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
    /// Any value.
    Any,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    const fn describe(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Integer => "an integer",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::Array => "an array",
            Self::Object => "an object",
            Self::Any => "any value",
        }
    }
}

/// Format rule applied after the type check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldFormat {
    /// String with at least one non-whitespace character.
    NonEmpty,
    /// IPv4 or IPv6 address.
    IpAddress,
    /// Address with a prefix length valid for its family, e.g. `10.0.0.0/8`.
    Cidr,
    /// UUID in any standard textual form.
    Uuid,
    /// Integer within `min..=max`.
    Range {
        /// Lowest accepted value.
        min: i64,
        /// Highest accepted value.
        max: i64,
    },
    /// String equal to one of the listed values.
    OneOf(Vec<String>),
}

impl FieldFormat {
    fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Self::NonEmpty => match value.as_str() {
                Some(s) if !s.trim().is_empty() => Ok(()),
                _ => Err("must not be empty".to_string()),
            },
            Self::IpAddress => value
                .as_str()
                .and_then(|s| s.parse::<IpAddr>().ok())
                .map(|_| ())
                .ok_or_else(|| "must be an IP address".to_string()),
            Self::Cidr => value
                .as_str()
                .filter(|s| is_cidr(s))
                .map(|_| ())
                .ok_or_else(|| "must be a CIDR block such as 10.0.0.0/24".to_string()),
            Self::Uuid => value
                .as_str()
                .and_then(|s| uuid::Uuid::parse_str(s).ok())
                .map(|_| ())
                .ok_or_else(|| "must be a UUID".to_string()),
            Self::Range { min, max } => match value.as_i64() {
                Some(n) if (*min..=*max).contains(&n) => Ok(()),
                _ => Err(format!("must be between {min} and {max}")),
            },
            Self::OneOf(allowed) => match value.as_str() {
                Some(s) if allowed.iter().any(|a| a == s) => Ok(()),
                _ => Err(format!("must be one of: {}", allowed.join(", "))),
            },
        }
    }
}

fn is_cidr(value: &str) -> bool {
    let Some((addr, prefix)) = value.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr {
        IpAddr::V4(_) => prefix <= 32,
        IpAddr::V6(_) => prefix <= 128,
    }
}

#[derive(Debug, Clone)]
struct FieldRule {
    field_type: FieldType,
    formats: Vec<FieldFormat>,
}

/// Structural constraints declared for one operation's request payload.
#[derive(Debug, Clone)]
pub struct PayloadSchema {
    required: Vec<String>,
    fields: HashMap<String, FieldRule>,
    allow_additional: bool,
}

impl Default for PayloadSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadSchema {
    /// Creates a schema with no fields that accepts additional fields.
    #[must_use]
    pub fn new() -> Self {
        Self {
            required: Vec::new(),
            fields: HashMap::new(),
            allow_additional: true,
        }
    }

    /// Declares a required field.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.fields.insert(
            name,
            FieldRule {
                field_type,
                formats: Vec::new(),
            },
        );
        self
    }

    /// Declares an optional field.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldRule {
                field_type,
                formats: Vec::new(),
            },
        );
        self
    }

    /// Adds a format rule to a declared field.
    ///
    /// Undeclared fields get an implicit [`FieldType::Any`] declaration.
    #[must_use]
    pub fn format(mut self, name: impl Into<String>, format: FieldFormat) -> Self {
        self.fields
            .entry(name.into())
            .or_insert_with(|| FieldRule {
                field_type: FieldType::Any,
                formats: Vec::new(),
            })
            .formats
            .push(format);
        self
    }

    /// Rejects fields that were not declared.
    #[must_use]
    pub fn deny_additional(mut self) -> Self {
        self.allow_additional = false;
        self
    }

    /// Returns the required field names in declaration order.
    #[must_use]
    pub fn required_fields(&self) -> &[String] {
        &self.required
    }

    /// Validates a decoded payload.
    ///
    /// A null payload is treated as an empty object. Explicit `null` field
    /// values count as absent.
    ///
    /// # Errors
    ///
    /// Returns every violation found, keyed by field name. Violations of the
    /// payload as a whole are keyed by the empty string.
    pub fn validate(&self, payload: &Value) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();

        let empty = serde_json::Map::new();
        let object = match payload {
            Value::Null => &empty,
            Value::Object(object) => object,
            _ => {
                errors.add("", "request payload must be an object");
                return Err(errors);
            }
        };

        for name in &self.required {
            if object.get(name).map_or(true, Value::is_null) {
                errors.add(name.as_str(), "is required");
            }
        }

        for (name, value) in object {
            if value.is_null() {
                continue;
            }
            match self.fields.get(name) {
                Some(rule) if !rule.field_type.matches(value) => {
                    errors.add(
                        name.as_str(),
                        format!("must be {}", rule.field_type.describe()),
                    );
                }
                Some(rule) => {
                    for format in &rule.formats {
                        if let Err(message) = format.check(value) {
                            errors.add(name.as_str(), message);
                        }
                    }
                }
                None if !self.allow_additional => {
                    errors.add(name.as_str(), "is not a recognized field");
                }
                None => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Payload schemas keyed by operation identifier.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct SchemaSet {
    schemas: Arc<HashMap<String, PayloadSchema>>,
}

impl SchemaSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a set with `schema` registered for `operation`.
    #[must_use]
    pub fn with(mut self, operation: impl Into<String>, schema: PayloadSchema) -> Self {
        self.insert(operation, schema);
        self
    }

    /// Registers `schema` for `operation`, replacing any previous one.
    pub fn insert(&mut self, operation: impl Into<String>, schema: PayloadSchema) {
        Arc::make_mut(&mut self.schemas).insert(operation.into(), schema);
    }

    /// Returns the schema for `operation`.
    #[must_use]
    pub fn get(&self, operation: &str) -> Option<&PayloadSchema> {
        self.schemas.get(operation)
    }

    /// Returns the number of operations with a schema.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns `true` if no schema is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl FromIterator<(String, PayloadSchema)> for SchemaSet {
    fn from_iter<T: IntoIterator<Item = (String, PayloadSchema)>>(iter: T) -> Self {
        Self {
            schemas: Arc::new(iter.into_iter().collect()),
        }
    }
}

/// Rejects payloads that violate the operation's schema.
#[derive(Debug, Clone, Default)]
pub struct ValidationMiddleware {
    schemas: SchemaSet,
}

impl ValidationMiddleware {
    /// Creates the stage from a schema set.
    #[must_use]
    pub fn new(schemas: SchemaSet) -> Self {
        Self { schemas }
    }
}

impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: RpcRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, RpcResult<Reply>> {
        Box::pin(async move {
            // Only reachable with the audit stage removed.
            if let Some(rejection) = ctx.take_rejection() {
                return Err(rejection);
            }

            if let Some(schema) = self.schemas.get(ctx.operation_id().as_str()) {
                if let Err(field_errors) = schema.validate(request.payload()) {
                    tracing::debug!(
                        operation = %ctx.operation_id(),
                        request_id = %ctx.request_id(),
                        fields = field_errors.len(),
                        "request payload rejected"
                    );
                    return Err(RpcError::invalid_argument_with_fields(
                        "request payload failed validation",
                        field_errors,
                    ));
                }
            }

            next.run(ctx, request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipamd_core::Deadline;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn subnet_schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("cidr", FieldType::String)
            .format("cidr", FieldFormat::Cidr)
            .required("name", FieldType::String)
            .format("name", FieldFormat::NonEmpty)
            .optional("vlan", FieldType::Integer)
            .format("vlan", FieldFormat::Range { min: 1, max: 4094 })
            .optional("gateway", FieldType::String)
            .format("gateway", FieldFormat::IpAddress)
    }

    #[test]
    fn test_valid_payload() {
        let payload = json!({
            "cidr": "10.20.0.0/16",
            "name": "office",
            "vlan": 120,
            "gateway": "10.20.0.1",
            "comment": "extra fields allowed"
        });
        assert!(subnet_schema().validate(&payload).is_ok());
    }

    #[test]
    fn test_missing_and_malformed_fields() {
        let errors = subnet_schema()
            .validate(&json!({"cidr": "10.20.0.0/40", "vlan": 5000, "gateway": "nope"}))
            .unwrap_err();

        assert_eq!(errors.fields["name"], vec!["is required"]);
        assert!(errors.fields["cidr"][0].contains("CIDR"));
        assert_eq!(errors.fields["vlan"], vec!["must be between 1 and 4094"]);
        assert_eq!(errors.fields["gateway"], vec!["must be an IP address"]);
    }

    #[test]
    fn test_type_mismatch_skips_format() {
        let errors = subnet_schema()
            .validate(&json!({"cidr": 10, "name": "x"}))
            .unwrap_err();
        assert_eq!(errors.fields["cidr"], vec!["must be a string"]);
    }

    #[test]
    fn test_null_payload() {
        assert!(PayloadSchema::new().validate(&Value::Null).is_ok());
        let errors = subnet_schema().validate(&Value::Null).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_non_object_payload() {
        let errors = PayloadSchema::new().validate(&json!([1, 2])).unwrap_err();
        assert!(errors.fields.contains_key(""));
    }

    #[test]
    fn test_null_field_counts_as_absent() {
        let errors = subnet_schema()
            .validate(&json!({"cidr": null, "name": "office"}))
            .unwrap_err();
        assert_eq!(errors.fields["cidr"], vec!["is required"]);
    }

    #[test]
    fn test_deny_additional() {
        let schema = PayloadSchema::new()
            .optional("tenant_id", FieldType::Integer)
            .deny_additional();
        let errors = schema.validate(&json!({"tenant": 1})).unwrap_err();
        assert_eq!(errors.fields["tenant"], vec!["is not a recognized field"]);
    }

    #[test]
    fn test_formats() {
        assert!(FieldFormat::Cidr.check(&json!("2001:db8::/32")).is_ok());
        assert!(FieldFormat::Cidr.check(&json!("2001:db8::/129")).is_err());
        assert!(FieldFormat::Cidr.check(&json!("10.0.0.0")).is_err());
        assert!(FieldFormat::Uuid
            .check(&json!("0192d7a4-3c5e-7d2a-9b1f-4e8c6a2d1f00"))
            .is_ok());
        assert!(FieldFormat::Uuid.check(&json!("subnet-1")).is_err());
        let kinds = FieldFormat::OneOf(vec!["ipv4".to_string(), "ipv6".to_string()]);
        assert!(kinds.check(&json!("ipv4")).is_ok());
        assert!(kinds.check(&json!("ipx")).is_err());
    }

    fn flagging_dispatch(flag: Arc<AtomicBool>) -> Next<'static> {
        Next::dispatch(move |_ctx, _req| {
            flag.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(json!({"ok": true})) })
        })
    }

    fn ctx(operation: &str) -> MiddlewareContext {
        MiddlewareContext::new(operation, Deadline::after(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_invalid_payload_skips_handler() {
        let middleware =
            ValidationMiddleware::new(SchemaSet::new().with("CreateSubnet", subnet_schema()));
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = ctx("CreateSubnet");

        let err = middleware
            .process(
                &mut ctx,
                RpcRequest::new("CreateSubnet", json!({"cidr": "bogus"})),
                flagging_dispatch(called.clone()),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RpcError::InvalidArgument {
                field_errors: Some(_),
                ..
            }
        ));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_operation_without_schema_passes() {
        let middleware = ValidationMiddleware::default();
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = ctx("GetStats");

        middleware
            .process(
                &mut ctx,
                RpcRequest::new("GetStats", json!("anything")),
                flagging_dispatch(called.clone()),
            )
            .await
            .unwrap();
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pending_rejection_wins() {
        let middleware = ValidationMiddleware::default();
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = ctx("GetStats");
        ctx.reject(RpcError::permission_denied("client certificate required"));

        let err = middleware
            .process(
                &mut ctx,
                RpcRequest::new("GetStats", Value::Null),
                flagging_dispatch(called.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::PermissionDenied { .. }));
        assert!(!called.load(Ordering::SeqCst));
    }
}
