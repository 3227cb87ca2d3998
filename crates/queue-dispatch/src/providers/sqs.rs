//! SQS transport over the HTTP query API.
//!
//! Requests are POSTed to the queue URL with the action and its parameters
//! in the query string. When credentials are configured every request is
//! signed with AWS Signature Version 4; without credentials requests are
//! sent unsigned, which is what local emulators such as ElasticMQ and
//! LocalStack accept.
//!
//! Message bodies are transmitted verbatim. Responses are XML and are
//! parsed into a small element tree before being mapped onto the crate's
//! message types.

use crate::client::{QueueRef, QueueTransport};
use crate::config::{Credentials, EngineConfig};
use crate::error::{QueueError, SerializationError};
use crate::message::{
    FailedSend, InboundMessage, MessageId, PreparedMessage, ReceiptHandle, ReceiveRequest,
    SendBatchOutput, SentMessage, Timestamp, MAX_BATCH_SIZE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";
const PROVIDER: &str = "sqs";

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer
///
/// Signs the method, path, sorted query string, the `host` and `x-amz-date`
/// headers (plus `x-amz-security-token` for temporary credentials) and the
/// payload hash.
#[derive(Clone)]
struct AwsV4Signer {
    credentials: Credentials,
    region: String,
    service: &'static str,
}

impl AwsV4Signer {
    fn new(credentials: Credentials, region: String) -> Self {
        Self {
            credentials,
            region,
            service: "sqs",
        }
    }

    /// Produce the headers that authenticate one request
    fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        canonical_query: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let mut canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let mut signed_headers = "host;x-amz-date".to_string();
        if let Some(token) = &self.credentials.session_token {
            canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
            signed_headers.push_str(";x-amz-security-token");
        }

        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{:x}",
            algorithm,
            amz_date,
            credential_scope,
            Sha256::digest(canonical_request.as_bytes())
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm,
            self.credentials.access_key_id,
            credential_scope,
            signed_headers,
            signature
        );

        let mut headers = vec![("Authorization", authorization), ("x-amz-date", amz_date)];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        headers
    }

    /// Derive the signing key through the HMAC chain and sign
    fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.credentials.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encode and sort parameters into a canonical query string
fn canonical_query_string(params: &BTreeMap<String, String>) -> String {
    let mut pairs = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// XML Response Handling
// ============================================================================

/// Minimal element tree for SQS responses
#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    fn named(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Depth-first search for the first element with the given name
    fn find(&self, name: &str) -> Option<&XmlElement> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }
}

fn parse_document(xml: &str) -> Result<XmlElement, SerializationError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let invalid = |e: quick_xml::Error| SerializationError::InvalidResponse {
        message: format!("XML parsing error: {}", e),
    };

    // Text is not trimmed: message bodies must survive byte for byte.
    let mut reader = Reader::from_str(xml);
    let mut stack = vec![XmlElement::named(String::new())];
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                stack.push(XmlElement::named(name));
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlElement::named(name));
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(invalid)?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Ok(Event::End(_)) => close_element(&mut stack),
            Ok(Event::Eof) => break,
            Err(e) => return Err(invalid(e)),
            _ => {}
        }
        buf.clear();
    }

    while stack.len() > 1 {
        close_element(&mut stack);
    }

    stack
        .pop()
        .ok_or_else(|| SerializationError::InvalidResponse {
            message: "empty XML document".to_string(),
        })
}

fn close_element(stack: &mut Vec<XmlElement>) {
    if stack.len() < 2 {
        return;
    }
    if let Some(element) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(element);
        }
    }
}

/// Map an SQS error response onto a queue error
fn map_error_response(xml: &str, status: u16, queue: &QueueRef, action: &str) -> QueueError {
    let document = parse_document(xml).ok();
    let error = document.as_ref().and_then(|d| d.find("Error"));
    let code = error
        .and_then(|e| e.child_text("Code"))
        .map(|c| c.trim().to_string())
        .unwrap_or_else(|| format!("Http{}", status));
    let message = error
        .and_then(|e| e.child_text("Message"))
        .map(|m| m.trim().to_string())
        .unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            QueueError::QueueNotFound {
                queue_name: queue.name().to_string(),
            }
        }
        "InvalidClientTokenId"
        | "UnrecognizedClientException"
        | "SignatureDoesNotMatch"
        | "MissingAuthenticationToken"
        | "ExpiredToken"
        | "IncompleteSignature" => QueueError::AuthenticationFailed {
            message: format!("{}: {}", code, message),
        },
        "AccessDenied" | "AccessDeniedException" => QueueError::PermissionDenied {
            operation: action.to_string(),
        },
        "ReceiptHandleIsInvalid" | "InvalidReceiptHandle" | "MessageNotInflight" => {
            QueueError::MessageNotFound { receipt: message }
        }
        "AWS.SimpleQueueService.TooManyEntriesInBatchRequest" | "TooManyEntriesInBatchRequest" => {
            QueueError::BatchTooLarge {
                size: 0,
                max_size: MAX_BATCH_SIZE as usize,
            }
        }
        _ if status == 401 => QueueError::AuthenticationFailed {
            message: format!("{}: {}", code, message),
        },
        _ if status == 403 => QueueError::PermissionDenied {
            operation: action.to_string(),
        },
        _ => QueueError::ProviderError {
            provider: PROVIDER.to_string(),
            code,
            message,
        },
    }
}

fn parse_receive_response(xml: &str) -> Result<Vec<InboundMessage>, SerializationError> {
    let document = parse_document(xml)?;
    let Some(result) = document.find("ReceiveMessageResult") else {
        return Ok(Vec::new());
    };

    let mut messages = Vec::new();
    for message in result.children_named("Message") {
        let receipt = message
            .child_text("ReceiptHandle")
            .ok_or_else(|| SerializationError::InvalidResponse {
                message: "Message without ReceiptHandle".to_string(),
            })?;

        let message_id = message
            .child_text("MessageId")
            .and_then(|id| MessageId::from_str(id.trim()).ok())
            .ok_or_else(|| SerializationError::InvalidResponse {
                message: "Message without MessageId".to_string(),
            })?;

        let attributes = message
            .children_named("Attribute")
            .filter_map(|a| Some((a.child_text("Name")?.to_string(), a.child_text("Value")?.to_string())))
            .collect::<HashMap<_, _>>();

        let message_attributes = message
            .children_named("MessageAttribute")
            .filter_map(|a| {
                let name = a.child_text("Name")?.to_string();
                let value = a.child("Value")?.child_text("StringValue")?.to_string();
                Some((name, value))
            })
            .collect::<HashMap<_, _>>();

        messages.push(InboundMessage {
            message_id,
            receipt_handle: ReceiptHandle::new(receipt.to_string()),
            body: message.child_text("Body").unwrap_or_default().to_string(),
            attributes,
            message_attributes,
            received_at: Timestamp::now(),
        });
    }

    Ok(messages)
}

/// Parse SendMessageBatch entries back onto the caller's ids
fn parse_send_batch_response(
    xml: &str,
    entry_ids: &HashMap<String, String>,
) -> Result<SendBatchOutput, SerializationError> {
    let document = parse_document(xml)?;
    let result = document
        .find("SendMessageBatchResult")
        .ok_or_else(|| SerializationError::InvalidResponse {
            message: "SendMessageBatchResult not found in response".to_string(),
        })?;

    let caller_id = |entry: &XmlElement| -> Option<String> {
        let wire_id = entry.child_text("Id")?;
        Some(entry_ids.get(wire_id).cloned().unwrap_or_else(|| wire_id.to_string()))
    };

    let mut output = SendBatchOutput::default();
    for entry in result.children_named("SendMessageBatchResultEntry") {
        let Some(id) = caller_id(entry) else { continue };
        let message_id = entry
            .child_text("MessageId")
            .and_then(|m| MessageId::from_str(m.trim()).ok())
            .ok_or_else(|| SerializationError::InvalidResponse {
                message: format!("Send result for entry '{}' without MessageId", id),
            })?;
        output.successful.push(SentMessage { id, message_id });
    }
    for entry in result.children_named("BatchResultErrorEntry") {
        let Some(id) = caller_id(entry) else { continue };
        output.failed.push(FailedSend {
            id,
            code: entry.child_text("Code").unwrap_or("Unknown").to_string(),
            message: entry.child_text("Message").unwrap_or_default().to_string(),
            sender_fault: entry
                .child_text("SenderFault")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        });
    }

    Ok(output)
}

fn parse_attributes_response(xml: &str) -> Result<HashMap<String, String>, SerializationError> {
    let document = parse_document(xml)?;
    let Some(result) = document.find("GetQueueAttributesResult") else {
        return Ok(HashMap::new());
    };

    Ok(result
        .children_named("Attribute")
        .filter_map(|a| Some((a.child_text("Name")?.to_string(), a.child_text("Value")?.to_string())))
        .collect())
}

// ============================================================================
// SQS Transport
// ============================================================================

/// Queue transport backed by the SQS HTTP query API
///
/// Thread-safe and cheap to share across tasks via `Arc`.
pub struct SqsTransport {
    http_client: HttpClient,
    signer: Option<AwsV4Signer>,
    request_timeout: Duration,
}

impl SqsTransport {
    /// Create a transport for the given region
    ///
    /// Requests are signed only when `credentials` is provided.
    pub fn new(
        region: impl Into<String>,
        credentials: Option<Credentials>,
        request_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let region = region.into();
        let http_client = HttpClient::builder()
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            signer: credentials.map(|c| AwsV4Signer::new(c, region)),
            request_timeout,
        })
    }

    /// Create a transport from engine configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self, QueueError> {
        Self::new(
            config.region.clone(),
            config.credentials.clone(),
            Duration::from_secs(config.request_timeout_seconds),
        )
    }

    /// Issue one action against a queue and return the response body
    async fn make_request(
        &self,
        queue: &QueueRef,
        action: &str,
        mut params: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<String, QueueError> {
        params.insert("Action".to_string(), action.to_string());
        params.insert("Version".to_string(), API_VERSION.to_string());
        let query = canonical_query_string(&params);

        let url = url::Url::parse(queue.url()).map_err(|e| {
            QueueError::from(crate::error::ConfigurationError::Invalid {
                message: format!("Invalid queue URL '{}': {}", queue.url(), e),
            })
        })?;

        let mut request = self
            .http_client
            .post(format!("{}?{}", queue.url(), query))
            .timeout(timeout);

        if let Some(signer) = &self.signer {
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => host.to_string(),
                (None, _) => String::new(),
            };
            for (name, value) in
                signer.sign_request("POST", &host, url.path(), &query, "", &Utc::now())
            {
                request = request.header(name, value);
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                QueueError::Timeout { duration: timeout }
            } else if e.is_connect() {
                QueueError::ConnectionFailed {
                    message: format!("Connection failed: {}", e),
                }
            } else {
                QueueError::ConnectionFailed {
                    message: format!("HTTP request failed: {}", e),
                }
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            let error = map_error_response(&body, status.as_u16(), queue, action);
            debug!(queue = %queue.name(), action, status = status.as_u16(), error = %error, "SQS request failed");
            return Err(error);
        }

        Ok(body)
    }
}

impl fmt::Debug for SqsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsTransport")
            .field("signed", &self.signer.is_some())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[async_trait]
impl QueueTransport for SqsTransport {
    #[instrument(level = "debug", skip(self, request), fields(queue = %queue.name()))]
    async fn receive(
        &self,
        queue: &QueueRef,
        request: &ReceiveRequest,
    ) -> Result<Vec<InboundMessage>, QueueError> {
        let mut params = BTreeMap::new();
        params.insert(
            "MaxNumberOfMessages".to_string(),
            request.max_messages.to_string(),
        );
        params.insert(
            "WaitTimeSeconds".to_string(),
            request.wait_time_seconds.to_string(),
        );
        if let Some(visibility) = request.visibility_timeout_seconds {
            params.insert("VisibilityTimeout".to_string(), visibility.to_string());
        }
        for (idx, name) in request.attribute_names.iter().enumerate() {
            params.insert(format!("AttributeName.{}", idx + 1), name.clone());
        }
        for (idx, name) in request.message_attribute_names.iter().enumerate() {
            params.insert(format!("MessageAttributeName.{}", idx + 1), name.clone());
        }

        // The long poll itself may take the full wait time.
        let timeout = self.request_timeout + Duration::from_secs(request.wait_time_seconds.into());
        let body = self
            .make_request(queue, "ReceiveMessage", params, timeout)
            .await?;
        let messages = parse_receive_response(&body)?;
        debug!(count = messages.len(), "Received messages");
        Ok(messages)
    }

    #[instrument(level = "debug", skip(self, receipt), fields(queue = %queue.name()))]
    async fn delete(&self, queue: &QueueRef, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut params = BTreeMap::new();
        params.insert("ReceiptHandle".to_string(), receipt.handle().to_string());
        self.make_request(queue, "DeleteMessage", params, self.request_timeout)
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, receipt), fields(queue = %queue.name()))]
    async fn change_visibility(
        &self,
        queue: &QueueRef,
        receipt: &ReceiptHandle,
        visibility_timeout_seconds: u32,
    ) -> Result<(), QueueError> {
        let mut params = BTreeMap::new();
        params.insert("ReceiptHandle".to_string(), receipt.handle().to_string());
        params.insert(
            "VisibilityTimeout".to_string(),
            visibility_timeout_seconds.to_string(),
        );
        self.make_request(queue, "ChangeMessageVisibility", params, self.request_timeout)
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, messages), fields(queue = %queue.name(), count = messages.len()))]
    async fn send(
        &self,
        queue: &QueueRef,
        messages: &[PreparedMessage],
    ) -> Result<SendBatchOutput, QueueError> {
        if messages.is_empty() {
            return Ok(SendBatchOutput::default());
        }
        if messages.len() > MAX_BATCH_SIZE as usize {
            return Err(QueueError::BatchTooLarge {
                size: messages.len(),
                max_size: MAX_BATCH_SIZE as usize,
            });
        }

        // Caller ids may not satisfy SQS entry id rules, so entries go out
        // under positional ids and are mapped back on the way in.
        let mut params = BTreeMap::new();
        let mut entry_ids = HashMap::new();
        for (idx, message) in messages.iter().enumerate() {
            let prefix = format!("SendMessageBatchRequestEntry.{}", idx + 1);
            let wire_id = format!("m{}", idx);
            entry_ids.insert(wire_id.clone(), message.id.clone());

            params.insert(format!("{}.Id", prefix), wire_id);
            params.insert(format!("{}.MessageBody", prefix), message.body.clone());
            if let Some(delay) = message.delay_seconds {
                params.insert(format!("{}.DelaySeconds", prefix), delay.to_string());
            }
            if let Some(group_id) = &message.group_id {
                params.insert(format!("{}.MessageGroupId", prefix), group_id.clone());
            }
            if let Some(dedup_id) = &message.deduplication_id {
                params.insert(
                    format!("{}.MessageDeduplicationId", prefix),
                    dedup_id.clone(),
                );
            }

            let mut attributes = message.message_attributes.iter().collect::<Vec<_>>();
            attributes.sort();
            for (attr_idx, (name, value)) in attributes.into_iter().enumerate() {
                let attr_prefix = format!("{}.MessageAttribute.{}", prefix, attr_idx + 1);
                params.insert(format!("{}.Name", attr_prefix), name.clone());
                params.insert(format!("{}.Value.StringValue", attr_prefix), value.clone());
                params.insert(format!("{}.Value.DataType", attr_prefix), "String".to_string());
            }
        }

        let body = self
            .make_request(queue, "SendMessageBatch", params, self.request_timeout)
            .await?;
        let output = parse_send_batch_response(&body, &entry_ids)?;
        if !output.failed.is_empty() {
            warn!(
                failed = output.failed.len(),
                succeeded = output.successful.len(),
                "Some batch entries were rejected"
            );
        }
        Ok(output)
    }

    #[instrument(level = "debug", skip(self), fields(queue = %queue.name()))]
    async fn purge(&self, queue: &QueueRef) -> Result<(), QueueError> {
        self.make_request(queue, "PurgeQueue", BTreeMap::new(), self.request_timeout)
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, names), fields(queue = %queue.name()))]
    async fn get_attributes(
        &self,
        queue: &QueueRef,
        names: &[String],
    ) -> Result<HashMap<String, String>, QueueError> {
        let mut params = BTreeMap::new();
        for (idx, name) in names.iter().enumerate() {
            params.insert(format!("AttributeName.{}", idx + 1), name.clone());
        }
        let body = self
            .make_request(queue, "GetQueueAttributes", params, self.request_timeout)
            .await?;
        Ok(parse_attributes_response(&body)?)
    }
}
