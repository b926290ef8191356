//! MQTT transport connector.
//!
//! Owns the broker connection and its [`ConnectionState`], turns raw client
//! events into [`BrokerEvent`]s and drives the single dispatch loop that feeds
//! the [`Pipeline`]. TLS with a configured CA is mandatory; the CA file is
//! loaded and checked before any network activity.
//!
//! Reconnection relies on the client: polling the event loop again after an
//! error opens a new connection. Consecutive failures are spaced with
//! exponential backoff and jitter.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rumqttc::tokio_rustls::rustls::{self, RootCertStore};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode, TlsConfiguration, Transport,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::pipeline::Pipeline;
use crate::store::MetricStore;

/// How long to keep polling after a disconnect request so it reaches the broker.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors loading the broker CA certificate. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("CA certificate file not found at {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read CA certificate {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid PEM data in {}: {source}", path.display())]
    InvalidPem { path: PathBuf, source: io::Error },

    #[error("no certificate found in {}", path.display())]
    NoCertificate { path: PathBuf },

    #[error("invalid CA certificate in {}: {source}", path.display())]
    InvalidCertificate {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },
}

/// Failure to establish a broker session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The broker rejected the presented credentials.
    #[error("authentication failure ({0:?}), check username/password")]
    Authentication(ConnectReturnCode),

    /// The broker refused the session for another reason.
    #[error("connection refused by broker ({0:?})")]
    Refused(ConnectReturnCode),

    /// The broker could not be reached or the TLS handshake failed.
    #[error("network error: {0}")]
    Network(#[source] ConnectionError),
}

impl ConnectError {
    fn from_return_code(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                ConnectError::Authentication(code)
            }
            _ => ConnectError::Refused(code),
        }
    }
}

/// Failure to subscribe to the telemetry topic.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("failed to request subscription to '{topic}': {source}")]
    Request {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },

    #[error("broker rejected subscription to '{topic}'")]
    Rejected { topic: String },
}

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }
}

/// Why the connection went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// This process asked to disconnect.
    Requested,
    /// The broker sent a DISCONNECT.
    BrokerClosed,
    /// The connection failed underneath an established session.
    Lost(String),
}

/// Connection lifecycle and message events, in arrival order.
#[derive(Debug)]
pub enum BrokerEvent {
    Connected { session_present: bool },
    ConnectFailed(ConnectError),
    Subscribed { granted: Vec<QoS> },
    SubscribeFailed(SubscribeError),
    Message { topic: String, payload: Vec<u8> },
    Disconnected { reason: DisconnectReason },
}

/// Connection state tracking, separate from the network client.
#[derive(Debug)]
struct Session {
    state: ConnectionState,
    topic: String,
    consecutive_failures: u32,
}

impl Session {
    fn new(topic: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            topic: topic.into(),
            consecutive_failures: 0,
        }
    }

    fn begin_attempt(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
        }
    }

    /// Fold one polled client event into the state, yielding the event the
    /// dispatcher needs to see (if any).
    fn on_poll(&mut self, polled: Result<Event, ConnectionError>) -> Option<BrokerEvent> {
        match polled {
            // Refused CONNACKs surface as `ConnectionError::ConnectionRefused`.
            Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                self.state = ConnectionState::Connected;
                self.consecutive_failures = 0;
                Some(BrokerEvent::Connected {
                    session_present: ack.session_present,
                })
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let granted: Vec<QoS> = ack
                    .return_codes
                    .iter()
                    .filter_map(|code| match code {
                        SubscribeReasonCode::Success(qos) => Some(*qos),
                        SubscribeReasonCode::Failure => None,
                    })
                    .collect();

                if !granted.is_empty() && granted.len() == ack.return_codes.len() {
                    self.state = ConnectionState::Subscribed;
                    Some(BrokerEvent::Subscribed { granted })
                } else {
                    Some(BrokerEvent::SubscribeFailed(SubscribeError::Rejected {
                        topic: self.topic.clone(),
                    }))
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(BrokerEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                self.state = ConnectionState::Disconnected;
                Some(BrokerEvent::Disconnected {
                    reason: DisconnectReason::BrokerClosed,
                })
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                self.state = ConnectionState::Disconnected;
                Some(BrokerEvent::Disconnected {
                    reason: DisconnectReason::Requested,
                })
            }
            Ok(_) => None,
            Err(e) => {
                let was_connected = self.state.is_connected();
                self.state = ConnectionState::Disconnected;
                self.consecutive_failures += 1;

                match e {
                    ConnectionError::ConnectionRefused(code) => Some(BrokerEvent::ConnectFailed(
                        ConnectError::from_return_code(code),
                    )),
                    e if was_connected => Some(BrokerEvent::Disconnected {
                        reason: DisconnectReason::Lost(e.to_string()),
                    }),
                    e => Some(BrokerEvent::ConnectFailed(ConnectError::Network(e))),
                }
            }
        }
    }
}

/// Load the broker CA certificate as a TLS configuration.
///
/// The file must exist and every PEM certificate in it must be usable as a
/// trust anchor.
pub fn load_ca_certificate(path: &Path) -> Result<TlsConfiguration, TlsSetupError> {
    let ca = std::fs::read(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            TlsSetupError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            TlsSetupError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let certs = rustls_pemfile::certs(&mut ca.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsSetupError::InvalidPem {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificate {
            path: path.to_path_buf(),
        });
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|source| TlsSetupError::InvalidCertificate {
                path: path.to_path_buf(),
                source,
            })?;
    }

    debug!(certificates = roots.len(), "Loaded CA certificate");

    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth: None,
    })
}

/// Calculate the delay before the next connection attempt.
///
/// Uses exponential backoff with jitter:
/// delay = min(base * 2^(failures - 1) + jitter, max)
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exponent = failures.saturating_sub(1).min(10);
    let exponential_ms = base_ms.saturating_mul(1 << exponent);

    // Add jitter (up to 25% of the delay)
    let jitter_ms = rand::random::<u64>() % (exponential_ms / 4 + 1);

    let total_ms = exponential_ms
        .saturating_add(jitter_ms)
        .min(max.as_millis() as u64);
    Duration::from_millis(total_ms)
}

/// Owned MQTT connection to the telemetry broker.
pub struct Connector {
    client: AsyncClient,
    eventloop: EventLoop,
    session: Session,
    host: String,
    port: u16,
    reconnect_base: Duration,
    reconnect_max: Duration,
    pending_backoff: Option<Duration>,
}

impl Connector {
    /// Create the client for `config`.
    ///
    /// No network activity happens here; the session is established by the
    /// first call to [`next_event`](Self::next_event).
    pub fn new(config: &BrokerConfig, tls: TlsConfiguration) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_credentials(&config.username, &config.password);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        options.set_transport(Transport::Tls(tls));

        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);

        Self {
            client,
            eventloop,
            session: Session::new(&config.topic),
            host: config.host.clone(),
            port: config.port,
            reconnect_base: config.reconnect_base,
            reconnect_max: config.reconnect_max,
            pending_backoff: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state
    }

    pub fn topic(&self) -> &str {
        &self.session.topic
    }

    /// Request a QoS 1 subscription to the configured topic.
    ///
    /// The outcome arrives later as [`BrokerEvent::Subscribed`] or
    /// [`BrokerEvent::SubscribeFailed`].
    pub fn subscribe(&self) -> Result<(), SubscribeError> {
        self.client
            .try_subscribe(self.session.topic.clone(), QoS::AtLeastOnce)
            .map_err(|source| SubscribeError::Request {
                topic: self.session.topic.clone(),
                source,
            })
    }

    /// Wait for the next event worth dispatching.
    ///
    /// After a failure the next poll is delayed by the reconnect backoff.
    pub async fn next_event(&mut self) -> BrokerEvent {
        loop {
            if let Some(delay) = self.pending_backoff.take() {
                warn!(
                    attempt = self.session.consecutive_failures,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting to MQTT broker after backoff"
                );
                tokio::time::sleep(delay).await;
            }

            self.session.begin_attempt();
            let polled = self.eventloop.poll().await;
            let failed = polled.is_err();

            let event = self.session.on_poll(polled);
            if failed {
                self.pending_backoff = Some(backoff_delay(
                    self.reconnect_base,
                    self.reconnect_max,
                    self.session.consecutive_failures,
                ));
            }

            if let Some(event) = event {
                return event;
            }
        }
    }

    /// Run the dispatch loop until `shutdown` completes, then disconnect.
    ///
    /// Messages are handled one at a time in arrival order. A message being
    /// handled when `shutdown` fires is finished first.
    pub async fn run<S, F>(&mut self, pipeline: &mut Pipeline<S>, shutdown: F)
    where
        S: MetricStore,
        F: Future<Output = ()>,
    {
        info!(
            host = %self.host,
            port = self.port,
            topic = %self.session.topic,
            "Starting MQTT listener loop"
        );

        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown signal received, disconnecting from MQTT broker");
                    break;
                }
                event = self.next_event() => event,
            };

            self.dispatch(event, pipeline).await;
        }

        self.disconnect().await;
    }

    async fn dispatch<S: MetricStore>(&mut self, event: BrokerEvent, pipeline: &mut Pipeline<S>) {
        match event {
            BrokerEvent::Message { topic, payload } => {
                pipeline.handle(&topic, &payload).await;
            }
            BrokerEvent::Connected { session_present } => {
                info!(
                    host = %self.host,
                    port = self.port,
                    session_present = session_present,
                    "Connected successfully to MQTT broker"
                );
                if let Err(e) = self.subscribe() {
                    error!(error = %e, "Subscription request failed");
                }
            }
            BrokerEvent::Subscribed { granted } => {
                info!(
                    topic = %self.session.topic,
                    granted_qos = ?granted,
                    "Subscribed to topic"
                );
            }
            BrokerEvent::SubscribeFailed(e) => {
                error!(error = %e, "Subscription failed");
            }
            BrokerEvent::ConnectFailed(e) => match &e {
                ConnectError::Authentication(_) => {
                    error!(error = %e, "Authentication failure (check username/password)");
                }
                ConnectError::Refused(_) => {
                    error!(error = %e, "Connection refused by MQTT broker");
                }
                ConnectError::Network(_) => {
                    error!(
                        error = %e,
                        host = %self.host,
                        port = self.port,
                        "Error connecting to MQTT broker"
                    );
                }
            },
            BrokerEvent::Disconnected { reason } => match reason {
                DisconnectReason::Requested => {
                    info!("Disconnected from MQTT broker");
                }
                DisconnectReason::BrokerClosed => {
                    warn!("Unexpected disconnection: broker closed the session");
                }
                DisconnectReason::Lost(cause) => {
                    warn!(reason = %cause, "Unexpected disconnection from MQTT broker");
                }
            },
        }
    }

    /// Best-effort orderly disconnect.
    pub async fn disconnect(&mut self) {
        if !self.session.state.is_connected() {
            self.session.state = ConnectionState::Disconnected;
            return;
        }

        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Failed to request disconnect");
            self.session.state = ConnectionState::Disconnected;
            return;
        }

        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                let polled = self.eventloop.poll().await;
                let done = polled.is_err();
                if let Some(BrokerEvent::Disconnected { .. }) = self.session.on_poll(polled) {
                    return;
                }
                if done {
                    return;
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!(
                timeout_secs = DISCONNECT_FLUSH_TIMEOUT.as_secs(),
                "Disconnect did not complete in time"
            );
        }
        self.session.state = ConnectionState::Disconnected;
        info!("Disconnected from MQTT broker");
    }
}
