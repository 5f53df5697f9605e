use crate::Mode;
use thiserror::Error;

/// The primary error type for the `assets2036_rt` library.
///
/// Variants fall into a few groups: misuse of a handle (wrong mode, unknown
/// element), malformed input (addresses, descriptors, parameters), transport
/// failures, and remote outcomes such as a timed out operation call.
#[derive(Error, Debug)]
pub enum Error {
    /// Represents an error during JSON serialization or deserialization.
    /// Wraps a `serde_json::Error`.
    #[error("JSON processing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Indicates that a provided value was invalid for a given context.
    #[error("Invalid parameter for {context}: {reason}")]
    InvalidParameter {
        /// The element or parameter whose validation failed.
        context: String,
        /// The specific reason why the value was rejected.
        reason: String,
    },

    /// An element was used in a way its handle mode does not permit, e.g. a
    /// consumer trying to write a property or an owner invoking an operation.
    #[error("Cannot {action} '{element}' through a {mode} handle")]
    WrongMode {
        /// Address of the element.
        element: String,
        /// What the caller tried to do.
        action: &'static str,
        /// The mode of the handle that was used.
        mode: Mode,
    },

    /// A named element does not exist in the submodel.
    #[error("No {kind} named '{name}' in submodel '{submodel}'")]
    ElementNotFound {
        /// "property", "operation" or "event".
        kind: &'static str,
        /// The requested element name.
        name: String,
        /// The submodel that was searched.
        submodel: String,
    },

    /// The asset handle does not implement the requested submodel.
    #[error("Asset '{asset}' has no submodel '{name}'")]
    SubmodelNotFound {
        /// `namespace/asset` of the handle.
        asset: String,
        /// The requested submodel name.
        name: String,
    },

    /// An address could not be parsed into namespace/asset/submodel/element.
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic {
        /// The offending address.
        topic: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Represents an error related to submodel descriptors, such as a missing
    /// name or colliding element names.
    #[error("Submodel definition error: {0}")]
    SubmodelDefinitionError(String),

    /// A general communication error not covered by more specific variants.
    #[error("Communication error: {0}")]
    CommunicationError(String),

    /// The transport has no live session.
    #[error("Not connected to a broker")]
    NotConnected,

    /// Indicates that a remote operation call timed out.
    #[error("Operation '{operation}' timed out after {timeout_ms} ms")]
    OperationTimeoutError {
        /// The address of the operation that timed out.
        operation: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// A provider callback reported a failure while handling a request.
    #[error("Operation callback failed: {0}")]
    OperationFailed(String),

    /// Indicates that an attempt to subscribe to a topic filter failed.
    #[error("Subscription to topic '{topic}' failed: {details}")]
    SubscriptionFailed {
        /// The filter for which the subscription failed.
        topic: String,
        /// Details about the subscription failure.
        details: String,
    },

    /// Indicates that an attempt to publish a message failed.
    #[error("Publish to topic '{topic}' failed: {details}")]
    PublishFailed {
        /// The topic to which publishing failed.
        topic: String,
        /// Details about the publishing failure.
        details: String,
    },

    /// Represents an error encountered while trying to connect to the broker.
    #[error("Connection to {host}:{port} failed: {details}")]
    ConnectionError {
        /// The host address of the broker.
        host: String,
        /// The port number of the broker.
        port: u16,
        /// Details about the connection failure.
        details: String,
    },

    /// A descriptor source could not be interpreted (unknown scheme, bad path).
    #[error("Failed to parse URL '{url}': {details}")]
    UrlParseError {
        /// The URL string that failed to parse.
        url: String,
        /// Details about the parsing error.
        details: String,
    },

    /// Indicates an error occurred while reading a descriptor file.
    #[error("Failed to read file '{path}': {details}")]
    FileReadError {
        /// The path to the file that could not be read.
        path: String,
        /// Details about the file reading error.
        details: String,
    },

    /// Represents an error during an HTTP request for a descriptor.
    #[error("HTTP request to '{url}' failed: {details}")]
    HttpRequestError {
        /// The URL of the HTTP request that failed.
        url: String,
        /// Details about the HTTP request failure.
        details: String,
    },

    /// Discovery found no `_meta` record for the requested asset.
    #[error("Asset not found: {namespace}/{name}")]
    AssetNotFoundError {
        /// The namespace searched.
        namespace: String,
        /// The asset name searched.
        name: String,
    },

    /// A generic error for cases not covered by other variants.
    #[error("Other error: {0}")]
    Other(String),
}
