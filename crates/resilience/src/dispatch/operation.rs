//! Platform operation contract

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque job payload; never parsed by the core
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Wrap raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into raw bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Caller-supplied facts about a job used for DLQ triage
///
/// The core never looks inside the payload; whoever enqueues the job
/// extracts what triage needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobHints {
    /// Order value, when known
    pub amount: Option<f64>,

    /// Whether the order was paid up front
    pub prepaid: bool,

    /// Explicit DLQ priority, overriding the policy
    pub priority: Option<crate::dlq::DlqPriority>,

    /// Free-form triage fields copied into DLQ metadata
    pub metadata: BTreeMap<String, String>,

    /// Labels copied into DLQ tags
    pub tags: BTreeSet<String>,
}

impl JobHints {
    /// Set the order amount
    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Mark the order as prepaid
    pub fn with_prepaid(mut self, prepaid: bool) -> Self {
        self.prepaid = prepaid;
        self
    }

    /// Force a DLQ priority
    pub fn with_priority(mut self, priority: crate::dlq::DlqPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Add a metadata field
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// One dispatchable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchJob {
    pub job_id: String,
    pub platform: String,
    pub operation: String,
    pub payload: Payload,
    #[serde(default)]
    pub hints: JobHints,
}

impl DispatchJob {
    /// Create a job without triage hints
    pub fn new(
        job_id: impl Into<String>,
        platform: impl Into<String>,
        operation: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            platform: platform.into(),
            operation: operation.into(),
            payload: payload.into(),
            hints: JobHints::default(),
        }
    }

    /// Attach triage hints
    pub fn with_hints(mut self, hints: JobHints) -> Self {
        self.hints = hints;
        self
    }
}

/// Whether a failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient: network errors, 5xx, 429, expired auth
    Retryable,
    /// Permanent: validation, not found, duplicate
    Terminal,
}

impl ErrorClass {
    /// Classify an HTTP status returned by a platform
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            None => Self::Retryable,
            Some(401 | 408 | 425 | 429) => Self::Retryable,
            Some(s) if s >= 500 => Self::Retryable,
            Some(s) if (400..500).contains(&s) => Self::Terminal,
            Some(_) => Self::Retryable,
        }
    }
}

/// Error returned by a platform operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: String,

    /// HTTP status from the platform, if any
    pub status_code: Option<u16>,

    /// Whether this error is retryable
    ///
    /// Terminal errors go straight to the dead letter queue without
    /// consuming a retry slot.
    pub retryable: bool,

    /// Diagnostic trace, if captured
    pub stack: Option<String>,
}

impl OperationError {
    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "RETRYABLE_ERROR".to_string(),
            status_code: None,
            retryable: true,
            stack: None,
        }
    }

    /// Create a terminal error
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: "TERMINAL_ERROR".to_string(),
            status_code: None,
            retryable: false,
            stack: None,
        }
    }

    /// Create an error from a platform HTTP status, classified by [`ErrorClass::from_status`]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let retryable = ErrorClass::from_status(Some(status)) == ErrorClass::Retryable;
        Self {
            message: message.into(),
            code: format!("HTTP_{}", status),
            status_code: Some(status),
            retryable,
            stack: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Set the status code without reclassifying
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Attach a diagnostic trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Classification of this error
    pub fn class(&self) -> ErrorClass {
        if self.retryable {
            ErrorClass::Retryable
        } else {
            ErrorClass::Terminal
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for OperationError {}

/// Result of a successful platform call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    /// Identifier assigned by the platform, if any
    pub external_id: Option<String>,
}

impl DispatchReceipt {
    /// Receipt carrying the platform's identifier
    pub fn with_external_id(id: impl Into<String>) -> Self {
        Self {
            external_id: Some(id.into()),
        }
    }
}

/// Performs the actual external call for `(platform, operation, payload)`
#[async_trait]
pub trait OperationDispatcher: Send + Sync + 'static {
    async fn dispatch(
        &self,
        platform: &str,
        operation: &str,
        payload: &Payload,
    ) -> Result<DispatchReceipt, OperationError>;
}

/// Operation handler function type
pub type OperationHandler = Arc<
    dyn Fn(Payload) -> Pin<Box<dyn Future<Output = Result<DispatchReceipt, OperationError>> + Send>>
        + Send
        + Sync,
>;

/// Dispatcher that routes `(platform, operation)` to registered handlers
///
/// # Example
///
/// ```ignore
/// use dispatch_resilience::dispatch::{HandlerRegistry, DispatchReceipt};
///
/// let mut handlers = HandlerRegistry::new();
/// handlers.register("swiftship", "submit_order", |payload| async move {
///     let id = client.submit(payload.as_bytes()).await?;
///     Ok(DispatchReceipt::with_external_id(id))
/// });
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), OperationHandler>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any existing one
    pub fn register<F, Fut>(&mut self, platform: &str, operation: &str, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DispatchReceipt, OperationError>> + Send + 'static,
    {
        let handler: OperationHandler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers
            .insert((platform.to_string(), operation.to_string()), handler);
    }

    /// Whether a handler exists
    pub fn contains(&self, platform: &str, operation: &str) -> bool {
        self.handlers
            .contains_key(&(platform.to_string(), operation.to_string()))
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .handlers
            .keys()
            .map(|(platform, operation)| format!("{}/{}", platform, operation))
            .collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &keys).finish()
    }
}

#[async_trait]
impl OperationDispatcher for HandlerRegistry {
    async fn dispatch(
        &self,
        platform: &str,
        operation: &str,
        payload: &Payload,
    ) -> Result<DispatchReceipt, OperationError> {
        let handler = self
            .handlers
            .get(&(platform.to_string(), operation.to_string()))
            .cloned()
            .ok_or_else(|| {
                OperationError::terminal(format!(
                    "no handler registered for {}/{}",
                    platform, operation
                ))
                .with_code("UNKNOWN_OPERATION")
            })?;
        handler(payload.clone()).await
    }
}
