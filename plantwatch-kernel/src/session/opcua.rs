//! Session OPC UA au-dessus du crate `opcua` (client synchrone).
//! Chaque appel bloquant part sur le pool `spawn_blocking` pour ne jamais
//! geler la boucle de polling des autres sources.

use super::{Session, SessionError, SessionFactory};
use crate::models::{Identifier, NodeConfig, SecurityMode, SourceConfig};
use crate::normalizer::{RawQuality, RawReading};
use async_trait::async_trait;
use opcua::client::prelude::{
    AttributeService, ClientBuilder, DataValue, IdentityToken, MessageSecurityMode,
    NodeId as UaNodeId, ReadValueId, SecurityPolicy, Session as UaSession, StatusCode,
    TimestampsToReturn, UserTokenPolicy, Variant,
};
use opcua::sync::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Écart entre l'époque OPC UA (1601-01-01) et l'époque Unix, en ticks de 100 ns
const UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;

/// Au-delà, la déconnexion continue détachée (une lecture abandonnée tient la session)
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct OpcUaSessions;

#[async_trait]
impl SessionFactory for OpcUaSessions {
    async fn open(&self, source: &SourceConfig) -> Result<Box<dyn Session>, SessionError> {
        let endpoint = source.endpoint_url.clone();
        let timeout_ms = u32::try_from(source.session_timeout_ms).unwrap_or(u32::MAX);
        let identity = match (source.security_mode, &source.credentials) {
            (SecurityMode::Credentials, Some(creds)) => {
                IdentityToken::UserName(creds.username.clone(), creds.password.clone())
            }
            _ => IdentityToken::Anonymous,
        };
        let identity_label = match &identity {
            IdentityToken::UserName(user, _) => format!("user '{user}'"),
            _ => "anonymous".to_string(),
        };

        let session = tokio::task::spawn_blocking(move || {
            let mut client = ClientBuilder::new()
                .application_name("PlantWatch Connector")
                .application_uri("urn:plantwatch:connector")
                .create_sample_keypair(true)
                .trust_server_certs(true)
                .session_retry_limit(0)
                .session_timeout(timeout_ms)
                .client()
                .ok_or_else(|| {
                    SessionError::Transport("invalid OPC UA client configuration".into())
                })?;

            // identité portée par le jeton ; le client résout l'endpoint serveur correspondant
            client
                .connect_to_endpoint(
                    (
                        endpoint.as_str(),
                        SecurityPolicy::None.to_str(),
                        MessageSecurityMode::None,
                        UserTokenPolicy::anonymous(),
                    ),
                    identity,
                )
                .map_err(connect_error)
        })
        .await
        .map_err(|e| SessionError::Transport(format!("session task failed: {e}")))??;

        Ok(Box::new(OpcUaSession {
            inner: session,
            label: format!("security policy None, {identity_label}"),
        }))
    }
}

struct OpcUaSession {
    inner: Arc<RwLock<UaSession>>,
    label: String,
}

#[async_trait]
impl Session for OpcUaSession {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn read(
        &mut self,
        node: &NodeConfig,
        namespace: u16,
    ) -> Result<RawReading, SessionError> {
        let ns = node.node_id.namespace_or(namespace);
        let target = match &node.node_id.identifier {
            Identifier::Numeric(n) => UaNodeId::new(ns, *n),
            Identifier::String(s) => UaNodeId::new(ns, s.clone()),
        };
        let label = node.node_id.to_string();
        let session = self.inner.clone();

        let values = tokio::task::spawn_blocking(move || {
            session
                .read()
                .read(&[ReadValueId::from(target)], TimestampsToReturn::Both, 0.0)
        })
        .await
        .map_err(|e| SessionError::Transport(format!("read task failed: {e}")))?
        .map_err(|status| read_error(&label, status))?;

        let value = values.into_iter().next().ok_or_else(|| SessionError::Node {
            node: label.clone(),
            reason: "empty read response".into(),
        })?;
        Ok(to_raw_reading(value))
    }

    async fn close(&mut self) {
        let session = self.inner.clone();
        let disconnect = tokio::task::spawn_blocking(move || session.write().disconnect());
        super::close_within(CLOSE_TIMEOUT, disconnect).await;
    }
}

fn connect_error(status: StatusCode) -> SessionError {
    if status == StatusCode::BadTimeout {
        SessionError::Timeout(Duration::ZERO)
    } else if status == StatusCode::BadIdentityTokenRejected
        || status == StatusCode::BadIdentityTokenInvalid
        || status == StatusCode::BadUserAccessDenied
    {
        SessionError::AuthRejected(status.to_string())
    } else if status == StatusCode::BadNotConnected
        || status == StatusCode::BadCommunicationError
        || status == StatusCode::BadConnectionRejected
        || status == StatusCode::BadTcpEndpointUrlInvalid
    {
        SessionError::Refused(status.to_string())
    } else {
        SessionError::Transport(status.to_string())
    }
}

/// Un échec au niveau du service (et non d'une valeur) signe une session morte
fn read_error(node: &str, status: StatusCode) -> SessionError {
    if status == StatusCode::BadNodeIdUnknown || status == StatusCode::BadNodeIdInvalid {
        SessionError::Node { node: node.to_string(), reason: status.to_string() }
    } else {
        SessionError::Transport(status.to_string())
    }
}

fn to_raw_reading(dv: DataValue) -> RawReading {
    let mut raw = RawReading::new(dv.value.as_ref().map(variant_to_json).unwrap_or(Value::Null));
    if let Some(status) = dv.status {
        raw = raw.with_quality(RawQuality::Code(status.bits()));
    }
    if let Some(ts) = dv.source_timestamp {
        let nanos = i128::from(ts.ticks() - UNIX_EPOCH_TICKS) * 100;
        if let Ok(ts) = OffsetDateTime::from_unix_timestamp_nanos(nanos) {
            raw = raw.with_source_timestamp(ts);
        }
    }
    raw
}

fn variant_to_json(v: &Variant) -> Value {
    match v {
        Variant::Boolean(b) => json!(b),
        Variant::SByte(n) => json!(n),
        Variant::Byte(n) => json!(n),
        Variant::Int16(n) => json!(n),
        Variant::UInt16(n) => json!(n),
        Variant::Int32(n) => json!(n),
        Variant::UInt32(n) => json!(n),
        Variant::Int64(n) => json!(n),
        Variant::UInt64(n) => json!(n),
        Variant::Float(f) => json!(f),
        Variant::Double(f) => json!(f),
        Variant::String(s) => s.value().clone().map(Value::String).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
