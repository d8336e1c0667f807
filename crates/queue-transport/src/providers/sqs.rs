//! Amazon SQS transport using the Query HTTP API.
//!
//! Pull-style backend: a background task long-polls `ReceiveMessage` and
//! hands each message to the subscription. SQS keeps a received message
//! invisible for the visibility timeout and then redelivers it, so callers
//! must `delete_message` every message they have processed.
//!
//! ## Wire format
//!
//! Every request is `POST /` with the action and its parameters in an
//! `application/x-www-form-urlencoded` body. Requests are signed with AWS
//! Signature V4 over that body when credentials are configured and sent
//! unsigned otherwise (local emulators).
//!
//! SQS message bodies must be XML-safe text, so bodies are sent base64
//! encoded together with a `BodyEncoding=base64` message attribute. Received
//! bodies are decoded only when that attribute is present; messages from
//! other producers are delivered as their raw text. The correlation
//! identifier travels in a `CorrelationId` string message attribute.
//!
//! ## Message identifiers
//!
//! Received messages carry `<queue>|<receipt handle>` as their id. The queue
//! part lets `delete_message` resolve the queue URL without extra state.
//!
//! ## Queue resolution
//!
//! Queue URLs are resolved with `GetQueueUrl` and cached per connection.
//! Missing queues are created with `CreateQueue` when
//! `create_missing_queues` is enabled. A cached URL the service no longer
//! recognises is evicted; a send retries once against the re-resolved queue.

use crate::config::{SqsConfig, TransportType};
use crate::error::{ConfigurationError, TransportError, ValidationError};
use crate::message::{validate_queue_name, Message, MessageId};
use crate::providers::redact_address;
use crate::stream::{message_stream, MessageStream, StreamSender};
use crate::transport::Transport;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

/// Query API version
const API_VERSION: &str = "2012-11-05";

/// Largest message body SQS accepts, measured after encoding
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Longest queue name SQS accepts, including a `.fifo` suffix
pub const MAX_SQS_QUEUE_NAME_LENGTH: usize = 80;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Message attribute marking a base64 encoded body
const BODY_ENCODING_ATTRIBUTE: &str = "BodyEncoding";
const BODY_ENCODING_BASE64: &str = "base64";

/// Message attribute carrying the correlation identifier
const CORRELATION_ID_ATTRIBUTE: &str = "CorrelationId";

/// Separator between queue name and receipt handle in message ids
const ID_SEPARATOR: char = '|';

/// Error codes SQS returns when a caller is sending too fast
const THROTTLING_CODES: [&str; 3] = [
    "RequestThrottled",
    "ThrottlingException",
    "AWS.SimpleQueueService.RequestThrottled",
];

// ============================================================================
// Error Types
// ============================================================================

/// Failures of individual SQS requests
#[derive(Debug, thiserror::Error)]
enum SqsError {
    #[error("credentials rejected: {0}")]
    Unauthorized(String),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// Server-side failure or throttling; worth retrying
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Request refused as invalid; retrying cannot help
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("queue does not exist: {0}")]
    QueueMissing(String),

    #[error("receipt handle rejected: {0}")]
    StaleReceipt(String),

    #[error("encoded body is {size} bytes (max: {max_size})")]
    TooLarge { size: usize, max_size: usize },

    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// Transport operation an SQS request was made for
#[derive(Debug, Clone, Copy)]
enum SqsOperation<'a> {
    Connect { address: &'a str },
    Publish { queue: &'a str },
    Subscribe { queue: &'a str },
    Receive { queue: &'a str },
    Delete { id: &'a str },
}

impl SqsError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Unavailable(_))
    }

    /// Map to the transport taxonomy for the operation that failed
    fn into_transport_error(self, operation: SqsOperation<'_>) -> TransportError {
        match (self, operation) {
            (Self::Unauthorized(message), _) => TransportError::AuthenticationFailed { message },
            (Self::TooLarge { size, max_size }, _) => {
                TransportError::MessageTooLarge { size, max_size }
            }
            (
                error @ Self::QueueMissing(_),
                SqsOperation::Publish { queue }
                | SqsOperation::Subscribe { queue }
                | SqsOperation::Receive { queue },
            ) => TransportError::DeclarationFailed {
                queue: queue.to_string(),
                message: error.to_string(),
            },
            (error, SqsOperation::Connect { address }) => TransportError::ConnectionFailed {
                address: redact_address(address),
                message: error.to_string(),
            },
            (error, SqsOperation::Publish { queue }) => TransportError::PublishFailed {
                queue: queue.to_string(),
                message: error.to_string(),
            },
            (error, SqsOperation::Subscribe { queue }) => TransportError::SubscriptionFailed {
                queue: queue.to_string(),
                message: error.to_string(),
            },
            (error, SqsOperation::Receive { queue }) => TransportError::ReceiveFailed {
                queue: queue.to_string(),
                message: error.to_string(),
            },
            (error, SqsOperation::Delete { id }) => TransportError::DeleteFailed {
                id: id.to_string(),
                message: error.to_string(),
            },
        }
    }
}

// ============================================================================
// Request Encoding and Signing
// ============================================================================

/// Signing scope service name
const SIGNING_SERVICE: &str = "sqs";

/// Signs form-encoded `POST /` requests with AWS Signature Version 4
#[derive(Clone)]
struct RequestSigner {
    access_key_id: String,
    secret_access_key: String,
    region: String,
}

impl RequestSigner {
    /// `Authorization` and `x-amz-date` headers for a request carrying `payload`
    fn headers(
        &self,
        host: &str,
        payload: &str,
        timestamp: &DateTime<Utc>,
    ) -> [(&'static str, String); 2] {
        const SIGNED_HEADERS: &str = "host;x-amz-date";

        let date = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SIGNING_SERVICE);

        // Method, path, empty query, headers, signed header list, payload hash
        let canonical_request = format!(
            "POST\n/\n\nhost:{}\nx-amz-date:{}\n\n{}\n{}",
            host,
            amz_date,
            SIGNED_HEADERS,
            sha256_hex(payload.as_bytes())
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key = [
            date.as_bytes(),
            self.region.as_bytes(),
            SIGNING_SERVICE.as_bytes(),
            b"aws4_request".as_slice(),
        ]
        .iter()
        .fold(
            format!("AWS4{}", self.secret_access_key).into_bytes(),
            |key, part| hmac_sha256(&key, part),
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        [
            (
                "Authorization",
                format!(
                    "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                    self.access_key_id, scope, SIGNED_HEADERS, signature
                ),
            ),
            ("x-amz-date", amz_date),
        ]
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Form body with keys sorted and every component RFC 3986 encoded
fn encode_form(params: &[(&str, String)]) -> String {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// Queue Names and Message Identifiers
// ============================================================================

/// Check SQS naming rules: 1-80 characters of ASCII alphanumerics, `-` and
/// `_`, with an optional `.fifo` suffix counted in the length
pub fn validate_sqs_queue_name(name: &str) -> Result<(), ValidationError> {
    validate_queue_name(name)?;

    if name.len() > MAX_SQS_QUEUE_NAME_LENGTH {
        return Err(ValidationError::OutOfRange {
            field: "queue_name".to_string(),
            message: format!(
                "SQS queue names are at most {} characters",
                MAX_SQS_QUEUE_NAME_LENGTH
            ),
        });
    }

    let stem = name.strip_suffix(".fifo").unwrap_or(name);
    if stem.is_empty()
        || !stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "queue_name".to_string(),
            message: "SQS queue names may only contain alphanumerics, '-' and '_'".to_string(),
        });
    }

    Ok(())
}

/// Message id for a received message
fn encode_message_id(queue: &str, receipt_handle: &str) -> MessageId {
    MessageId::new(format!("{}{}{}", queue, ID_SEPARATOR, receipt_handle))
}

/// Split a message id into queue name and receipt handle
fn decode_message_id(id: &MessageId) -> Result<(&str, &str), TransportError> {
    let invalid = |message: &str| TransportError::InvalidMessageId {
        id: id.to_string(),
        message: message.to_string(),
    };

    let (queue, receipt) = id
        .as_str()
        .split_once(ID_SEPARATOR)
        .ok_or_else(|| invalid("expected <queue>|<receipt handle>"))?;

    if receipt.is_empty() {
        return Err(invalid("receipt handle is empty"));
    }
    validate_sqs_queue_name(queue).map_err(|e| invalid(&e.to_string()))?;

    Ok((queue, receipt))
}

// ============================================================================
// Response Parsing
// ============================================================================

/// Text of the first `<tag>` element in `xml`, if any
fn element_text(xml: &str, tag: &str) -> Result<Option<String>, quick_xml::Error> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut inside = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.name().as_ref() == tag.as_bytes() => inside = true,
            Event::End(e) if e.name().as_ref() == tag.as_bytes() => inside = false,
            Event::Text(e) if inside => return Ok(Some(e.unescape()?.into_owned())),
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

/// `QueueUrl` of a GetQueueUrl or CreateQueue response
fn parse_queue_url_response(xml: &str) -> Result<String, SqsError> {
    element_text(xml, "QueueUrl")
        .map_err(|e| SqsError::Malformed(e.to_string()))?
        .ok_or_else(|| SqsError::Malformed("no QueueUrl in response".to_string()))
}

/// Classify a non-success response by its error code and HTTP status
fn parse_error_response(xml: &str, status_code: u16) -> SqsError {
    let code = element_text(xml, "Code")
        .ok()
        .flatten()
        .unwrap_or_else(|| format!("HTTP {}", status_code));
    let detail = element_text(xml, "Message")
        .ok()
        .flatten()
        .unwrap_or_else(|| "no error message".to_string());
    let described = format!("{}: {}", code, detail);

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            SqsError::QueueMissing(detail)
        }
        "ReceiptHandleIsInvalid" | "InvalidReceiptHandle" => SqsError::StaleReceipt(detail),
        "InvalidClientTokenId"
        | "UnrecognizedClientException"
        | "SignatureDoesNotMatch"
        | "MissingAuthenticationToken"
        | "AccessDenied"
        | "AccessDeniedException" => SqsError::Unauthorized(described),
        throttled if THROTTLING_CODES.contains(&throttled) => SqsError::Unavailable(described),
        _ => match status_code {
            401 | 403 => SqsError::Unauthorized(described),
            429 => SqsError::Unavailable(described),
            400..=499 => SqsError::Rejected(described),
            _ => SqsError::Unavailable(described),
        },
    }
}

/// One `<Message>` element of a ReceiveMessage response
#[derive(Default)]
struct ReceivedEntry {
    receipt_handle: Option<String>,
    body: Option<String>,
    attributes: HashMap<String, String>,
}

impl ReceivedEntry {
    fn into_message(self, queue: &str) -> Option<Message> {
        let receipt_handle = self.receipt_handle?;
        let text = self.body.unwrap_or_default();

        let body = match self.attributes.get(BODY_ENCODING_ATTRIBUTE).map(String::as_str) {
            Some(BODY_ENCODING_BASE64) => match STANDARD.decode(text.as_bytes()) {
                Ok(decoded) => Bytes::from(decoded),
                Err(e) => {
                    warn!(
                        queue = %queue,
                        error = %e,
                        "Body marked base64 failed to decode; delivering raw text"
                    );
                    Bytes::from(text)
                }
            },
            _ => Bytes::from(text),
        };

        Some(Message {
            id: Some(encode_message_id(queue, &receipt_handle)),
            correlation_id: self.attributes.get(CORRELATION_ID_ATTRIBUTE).cloned(),
            body,
        })
    }
}

/// Parse the messages of a ReceiveMessage response.
///
/// Whitespace is kept so that unencoded bodies arrive unchanged.
fn parse_receive_message_response(xml: &str, queue: &str) -> Result<Vec<Message>, SqsError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut current: Option<ReceivedEntry> = None;
    let mut attribute_name: Option<String> = None;
    let mut messages = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "Message" => current = Some(ReceivedEntry::default()),
                    "MessageAttribute" => attribute_name = None,
                    _ => {}
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                if path.pop().as_deref() == Some("Message") {
                    if let Some(message) = current.take().and_then(|m| m.into_message(queue)) {
                        messages.push(message);
                    }
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(entry) = current.as_mut() {
                    let text = e
                        .unescape()
                        .map_err(|e| {
                            SqsError::Malformed(e.to_string())
                        })?
                        .into_owned();

                    let depth = path.len();
                    let leaf = path.last().map(String::as_str);
                    let parent = depth.checked_sub(2).map(|i| path[i].as_str());
                    let grandparent = depth.checked_sub(3).map(|i| path[i].as_str());

                    match (grandparent, parent, leaf) {
                        (_, Some("Message"), Some("ReceiptHandle")) => {
                            entry.receipt_handle = Some(text);
                        }
                        (_, Some("Message"), Some("Body")) => {
                            // Entities split a body into several text events
                            entry.body.get_or_insert_with(String::new).push_str(&text);
                        }
                        (_, Some("MessageAttribute"), Some("Name")) => {
                            attribute_name = Some(text);
                        }
                        (Some("MessageAttribute"), Some("Value"), Some("StringValue")) => {
                            if let Some(name) = attribute_name.take() {
                                entry.attributes.insert(name, text);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SqsError::Malformed(e.to_string()))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

// ============================================================================
// SQS Client
// ============================================================================

/// HTTP session against one SQS endpoint, shared with polling tasks
struct SqsClient {
    http_client: HttpClient,
    signer: Option<RequestSigner>,
    config: SqsConfig,
    /// Endpoint root, path `/`
    endpoint: Url,
    /// `host[:port]` as signed
    host: String,
    queue_url_cache: RwLock<HashMap<String, String>>,
}

impl SqsClient {
    fn new(config: &SqsConfig, address: &str) -> Result<Self, TransportError> {
        let connection_failed = |message: String| TransportError::ConnectionFailed {
            address: redact_address(address),
            message,
        };

        let mut endpoint =
            Url::parse(address).map_err(|e| connection_failed(format!("invalid endpoint: {}", e)))?;
        if endpoint.scheme() != "http" && endpoint.scheme() != "https" {
            return Err(connection_failed(format!(
                "unsupported scheme '{}', expected http or https",
                endpoint.scheme()
            )));
        }
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(connection_failed("endpoint has no host".to_string())),
        };
        endpoint.set_path("/");
        endpoint.set_query(None);
        endpoint.set_fragment(None);

        let signer = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(RequestSigner {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                region: config.region.clone(),
            }),
            _ => None,
        };

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| connection_failed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            signer,
            config: config.clone(),
            endpoint,
            host,
            queue_url_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Issue one Query API action, returning the response body
    async fn make_request(
        &self,
        action: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<String, SqsError> {
        params.push(("Action", action.to_string()));
        params.push(("Version", API_VERSION.to_string()));
        let form = encode_form(&params);

        let mut request = self
            .http_client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE);
        if let Some(signer) = &self.signer {
            for (name, value) in signer.headers(&self.host, &form, &Utc::now()) {
                request = request.header(name, value);
            }
        }

        let response = request.body(form).send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                "timed out"
            } else if e.is_connect() {
                "connection failed"
            } else {
                "request failed"
            };
            SqsError::Unreachable(format!("{} {}: {}", action, kind, e))
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SqsError::Unreachable(format!("{} response unreadable: {}", action, e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&body, status.as_u16()));
        }

        Ok(body)
    }

    /// Cheap authenticated request proving the endpoint and credentials work
    async fn check_reachable(&self) -> Result<(), SqsError> {
        self.make_request("ListQueues", vec![("MaxResults", "1".to_string())])
            .await
            .map(|_| ())
    }

    /// Resolve the URL of `queue`, creating the queue when allowed
    async fn queue_url(&self, queue: &str, create_if_missing: bool) -> Result<String, SqsError> {
        if let Some(url) = self.queue_url_cache.read().await.get(queue) {
            return Ok(url.clone());
        }

        let lookup = self
            .make_request("GetQueueUrl", vec![("QueueName", queue.to_string())])
            .await
            .and_then(|xml| parse_queue_url_response(&xml));

        let url = match lookup {
            Ok(url) => url,
            Err(SqsError::QueueMissing(_))
                if create_if_missing && self.config.create_missing_queues =>
            {
                info!(queue = %queue, "Creating missing SQS queue");
                let mut params = vec![("QueueName", queue.to_string())];
                if queue.ends_with(".fifo") {
                    params.push(("Attribute.1.Name", "FifoQueue".to_string()));
                    params.push(("Attribute.1.Value", "true".to_string()));
                }
                let xml = self.make_request("CreateQueue", params).await?;
                parse_queue_url_response(&xml)?
            }
            Err(e) => return Err(e),
        };

        self.queue_url_cache
            .write()
            .await
            .insert(queue.to_string(), url.clone());
        debug!(queue = %queue, queue_url = %url, "Resolved queue URL");

        Ok(url)
    }

    /// Drop the cached URL of `queue` after the service reported it missing
    async fn forget_queue_url(&self, queue: &str) {
        if self.queue_url_cache.write().await.remove(queue).is_some() {
            debug!(queue = %queue, "Evicted stale queue URL");
        }
    }

    /// Send to `queue`, resolving its URL again once if the cached one is stale
    async fn send(&self, queue: &str, message: &Message) -> Result<(), SqsError> {
        let queue_url = self.queue_url(queue, true).await?;

        match self.send_to(&queue_url, message).await {
            Err(SqsError::QueueMissing(detail)) => {
                warn!(queue = %queue, error = %detail, "Queue URL went stale; resolving again");
                self.forget_queue_url(queue).await;
                let queue_url = self.queue_url(queue, true).await?;

                let retried = self.send_to(&queue_url, message).await;
                if let Err(SqsError::QueueMissing(_)) = &retried {
                    self.forget_queue_url(queue).await;
                }
                retried
            }
            result => result,
        }
    }

    async fn send_to(&self, queue_url: &str, message: &Message) -> Result<(), SqsError> {
        let body = STANDARD.encode(&message.body);
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(SqsError::TooLarge {
                size: body.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }

        let mut params = vec![
            ("QueueUrl", queue_url.to_string()),
            ("MessageBody", body),
            ("MessageAttribute.1.Name", BODY_ENCODING_ATTRIBUTE.to_string()),
            ("MessageAttribute.1.Value.DataType", "String".to_string()),
            (
                "MessageAttribute.1.Value.StringValue",
                BODY_ENCODING_BASE64.to_string(),
            ),
        ];

        if let Some(correlation_id) = &message.correlation_id {
            params.push(("MessageAttribute.2.Name", CORRELATION_ID_ATTRIBUTE.to_string()));
            params.push(("MessageAttribute.2.Value.DataType", "String".to_string()));
            params.push(("MessageAttribute.2.Value.StringValue", correlation_id.clone()));
        }

        if queue_url.ends_with(".fifo") {
            params.push(("MessageGroupId", "default".to_string()));
            params.push(("MessageDeduplicationId", uuid::Uuid::new_v4().to_string()));
        }

        self.make_request("SendMessage", params).await.map(|_| ())
    }

    async fn receive_batch(&self, queue: &str, queue_url: &str) -> Result<Vec<Message>, SqsError> {
        let mut params = vec![
            ("QueueUrl", queue_url.to_string()),
            ("MaxNumberOfMessages", self.config.batch_size.to_string()),
            (
                "WaitTimeSeconds",
                self.config.poll_timeout_seconds.to_string(),
            ),
            ("AttributeName.1", "All".to_string()),
            ("MessageAttributeName.1", "All".to_string()),
        ];
        if let Some(visibility) = self.config.visibility_timeout_seconds {
            params.push(("VisibilityTimeout", visibility.to_string()));
        }

        let xml = self.make_request("ReceiveMessage", params).await?;
        parse_receive_message_response(&xml, queue)
    }

    /// Delete by receipt handle; deletion never creates the queue
    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<(), SqsError> {
        let queue_url = self.queue_url(queue, false).await?;
        let params = vec![
            ("QueueUrl", queue_url),
            ("ReceiptHandle", receipt_handle.to_string()),
        ];

        let result = self.make_request("DeleteMessage", params).await.map(|_| ());
        if let Err(SqsError::QueueMissing(_)) = &result {
            self.forget_queue_url(queue).await;
        }
        result
    }
}

// ============================================================================
// Transport
// ============================================================================

/// SQS transport implementation
pub struct SqsTransport {
    config: SqsConfig,
    client: RwLock<Option<Arc<SqsClient>>>,
}

impl SqsTransport {
    /// Create a disconnected transport
    pub fn new(config: SqsConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            config,
            client: RwLock::new(None),
        })
    }

    async fn client(&self, operation: &str) -> Result<Arc<SqsClient>, TransportError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::not_connected(operation))
    }
}

impl fmt::Debug for SqsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for SqsTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let redacted = redact_address(address);
        info!(
            address = %redacted,
            region = %self.config.region,
            signed = self.config.has_credentials(),
            "Connecting to SQS"
        );

        let client = SqsClient::new(&self.config, address)?;
        client.check_reachable().await.map_err(|e| {
            error!(address = %redacted, error = %e, "SQS connection check failed");
            e.into_transport_error(SqsOperation::Connect { address })
        })?;

        *self.client.write().await = Some(Arc::new(client));

        info!(address = %redacted, "Connected to SQS");
        Ok(())
    }

    async fn send_message(&self, queue: &str, message: Message) -> Result<(), TransportError> {
        validate_sqs_queue_name(queue)?;
        let client = self.client("send_message").await?;

        client
            .send(queue, &message)
            .await
            .map_err(|e| e.into_transport_error(SqsOperation::Publish { queue }))?;

        debug!(
            queue = %queue,
            size = message.body.len(),
            correlation_id = ?message.correlation_id,
            "Published message"
        );
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), TransportError> {
        let (queue, receipt_handle) = decode_message_id(id)?;
        let client = self.client("delete_message").await?;

        client
            .delete(queue, receipt_handle)
            .await
            .map_err(|e| e.into_transport_error(SqsOperation::Delete { id: id.as_str() }))?;

        debug!(queue = %queue, "Deleted message");
        Ok(())
    }

    async fn receive_messages(&self, queue: &str) -> Result<MessageStream, TransportError> {
        validate_sqs_queue_name(queue)?;
        let client = self.client("receive_messages").await?;

        let queue_url = client
            .queue_url(queue, true)
            .await
            .map_err(|e| e.into_transport_error(SqsOperation::Subscribe { queue }))?;

        info!(queue = %queue, queue_url = %queue_url, "Started polling queue");

        let (sender, stream) = message_stream(queue);
        tokio::spawn(poll_queue(client, queue_url, sender));

        Ok(stream)
    }

    async fn is_connected(&self) -> bool {
        self.client.read().await.is_some()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Sqs
    }
}

// ============================================================================
// Polling
// ============================================================================

enum PollStep {
    Batch(Result<Vec<Message>, SqsError>),
    CallerGone,
}

/// Long-poll `queue_url` and forward every message until the caller drops the
/// stream or polling fails for good
async fn poll_queue(client: Arc<SqsClient>, queue_url: String, mut sender: StreamSender) {
    let queue = sender.queue().to_string();
    let poll_interval = Duration::from_millis(client.config.poll_interval_ms);
    let error_backoff = Duration::from_millis(client.config.error_backoff_ms);
    let max_failures = client.config.max_consecutive_poll_failures;
    let mut consecutive_failures = 0u32;

    'polling: loop {
        let step = tokio::select! {
            _ = sender.closed() => PollStep::CallerGone,
            batch = client.receive_batch(&queue, &queue_url) => PollStep::Batch(batch),
        };

        match step {
            PollStep::CallerGone => break,
            PollStep::Batch(Ok(messages)) => {
                consecutive_failures = 0;
                let empty = messages.is_empty();

                for message in messages {
                    debug!(queue = %queue, size = message.body.len(), "Received message");
                    if !sender.deliver(message).await {
                        break 'polling;
                    }
                }

                if empty && !pause(&sender, poll_interval).await {
                    break;
                }
            }
            PollStep::Batch(Err(e)) if e.is_transient() => {
                consecutive_failures += 1;
                if consecutive_failures >= max_failures {
                    error!(
                        queue = %queue,
                        error = %e,
                        failures = consecutive_failures,
                        "Giving up polling after repeated failures"
                    );
                    sender.fail(e.into_transport_error(SqsOperation::Receive { queue: &queue }));
                    break;
                }

                warn!(
                    queue = %queue,
                    error = %e,
                    failures = consecutive_failures,
                    "Poll failed; retrying"
                );
                if !pause(&sender, error_backoff).await {
                    break;
                }
            }
            PollStep::Batch(Err(e)) => {
                error!(queue = %queue, error = %e, "Polling failed");
                if let SqsError::QueueMissing(_) = &e {
                    client.forget_queue_url(&queue).await;
                }
                sender.fail(e.into_transport_error(SqsOperation::Receive { queue: &queue }));
                break;
            }
        }
    }

    debug!(queue = %queue, "Polling task ended");
}

/// Wait for `delay`; `false` if the caller dropped the stream meanwhile
async fn pause(sender: &StreamSender, delay: Duration) -> bool {
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        _ = sender.closed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
