//! ESP-IDF MQTT client adapter.
//!
//! ```text
//!   ConnectionManager ──TransportPort──▶ EspMqttTransport ─┐
//!                                                         │ creates / drops
//!   Session ──────────────MqttPort─────▶ EspMqttLink ◀────┘ EspMqttClient
//!                                            │
//!   "mqtt-rx" thread: EspMqttConnection ─────┴─▶ Router::dispatch, acks
//! ```
//!
//! esp-mqtt runs TLS and the socket itself, so the transport half only
//! manages the client's lifetime: `connect` builds a client around the
//! presented identity and waits for the broker's CONNACK, `disconnect`
//! drops it.  Byte-level `send`/`recv` are not reachable through esp-mqtt.

use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use esp_idf_svc::mqtt::client::{
    Details, EspMqttClient, EventPayload, MqttClientConfiguration, QoS as EspQoS,
};
use esp_idf_svc::tls::X509;
use log::{debug, error, info, warn};

use crate::app::ports::{MqttPort, PacketId, QoS, TlsIdentity, TransportError, TransportPort};
use crate::error::ProtocolError;
use crate::mqtt::router::Router;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const ACK_POLL: Duration = Duration::from_millis(50);
const ACK_BACKLOG: usize = 16;
/// Large enough for one base64 stream block plus its JSON envelope.
const BUFFER_SIZE: usize = 4096;

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wait_signal<T: Send>(signal: &Signal<CriticalSectionRawMutex, T>, timeout: Duration) -> Option<T> {
    futures_lite::future::block_on(futures_lite::future::or(
        async { Some(signal.wait().await) },
        async {
            async_io_mini::Timer::after(timeout).await;
            None
        },
    ))
}

/// A client plus the PEM buffers esp-mqtt keeps pointers into.
struct LiveClient {
    client: EspMqttClient<'static>,
    _pem: [Vec<u8>; 3],
}

pub struct EspMqttLink {
    router: Arc<Router>,
    live: Mutex<Option<LiveClient>>,
    acked: Mutex<heapless::Deque<u32, ACK_BACKLOG>>,
    ack_signal: Signal<CriticalSectionRawMutex, ()>,
    link_up: Signal<CriticalSectionRawMutex, bool>,
    connected: core::sync::atomic::AtomicBool,
}

impl EspMqttLink {
    pub fn new(router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self {
            router,
            live: Mutex::new(None),
            acked: Mutex::new(heapless::Deque::new()),
            ack_signal: Signal::new(),
            link_up: Signal::new(),
            connected: core::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(core::sync::atomic::Ordering::Acquire)
    }

    fn set_connected(&self, up: bool) {
        self.connected.store(up, core::sync::atomic::Ordering::Release);
        self.link_up.signal(up);
    }

    fn record_ack(&self, id: u32) {
        let mut acked = lock(&self.acked);
        if acked.is_full() {
            acked.pop_front();
        }
        let _ = acked.push_back(id);
        drop(acked);
        self.ack_signal.signal(());
    }

    fn take_ack(&self, id: u32) -> bool {
        let mut acked = lock(&self.acked);
        let mut found = false;
        for _ in 0..acked.len() {
            if let Some(a) = acked.pop_front() {
                if a == id && !found {
                    found = true;
                } else {
                    let _ = acked.push_back(a);
                }
            }
        }
        found
    }

    fn with_client(
        &self,
        err: ProtocolError,
        f: impl FnOnce(&mut EspMqttClient<'static>) -> Result<u32, esp_idf_svc::sys::EspError>,
    ) -> Result<u32, ProtocolError> {
        let mut live = lock(&self.live);
        let Some(live) = live.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };
        f(&mut live.client).map_err(|e| {
            warn!("MQTT: {:?}", e);
            err
        })
    }

    /// Handle one client event from the receive thread.
    fn on_event(&self, payload: EventPayload<'_, esp_idf_svc::sys::EspError>) {
        match payload {
            EventPayload::Connected(_) => {
                info!("MQTT: connected");
                self.set_connected(true);
            }
            EventPayload::Disconnected => {
                warn!("MQTT: disconnected");
                self.set_connected(false);
            }
            EventPayload::Published(id)
            | EventPayload::Subscribed(id)
            | EventPayload::Unsubscribed(id) => self.record_ack(id),
            EventPayload::Received {
                topic: Some(topic),
                data,
                details: Details::Complete,
                ..
            } => {
                self.router.dispatch(topic, data);
            }
            EventPayload::Received { details, .. } => {
                warn!("MQTT: dropping fragmented publish ({:?})", details);
            }
            EventPayload::Error(e) => error!("MQTT: {:?}", e),
            other => debug!("MQTT: {:?}", other),
        }
    }
}

fn esp_qos(qos: QoS) -> EspQoS {
    match qos {
        QoS::AtMostOnce => EspQoS::AtMostOnce,
        QoS::AtLeastOnce => EspQoS::AtLeastOnce,
    }
}

impl MqttPort for EspMqttLink {
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<PacketId, ProtocolError> {
        self.with_client(ProtocolError::PublishFailed, |c| {
            c.publish(topic, esp_qos(qos), false, payload)
        })
        .map(|id| id as PacketId)
    }

    fn subscribe(&self, filters: &[&str], qos: QoS) -> Result<PacketId, ProtocolError> {
        let Some((last, rest)) = filters.split_last() else {
            return Err(ProtocolError::SubscribeFailed);
        };
        for filter in rest {
            let id = self.with_client(ProtocolError::SubscribeFailed, |c| {
                c.subscribe(filter, esp_qos(qos))
            })?;
            self.wait_for_ack(id as PacketId, CONNECT_TIMEOUT)?;
        }
        self.with_client(ProtocolError::SubscribeFailed, |c| {
            c.subscribe(last, esp_qos(qos))
        })
        .map(|id| id as PacketId)
    }

    fn unsubscribe(&self, filters: &[&str]) -> Result<PacketId, ProtocolError> {
        let Some((last, rest)) = filters.split_last() else {
            return Err(ProtocolError::UnsubscribeFailed);
        };
        for filter in rest {
            let id = self.with_client(ProtocolError::UnsubscribeFailed, |c| {
                c.unsubscribe(filter)
            })?;
            self.wait_for_ack(id as PacketId, CONNECT_TIMEOUT)?;
        }
        self.with_client(ProtocolError::UnsubscribeFailed, |c| c.unsubscribe(last))
            .map(|id| id as PacketId)
    }

    fn wait_for_ack(&self, packet_id: PacketId, timeout: Duration) -> Result<(), ProtocolError> {
        let id = u32::from(packet_id);
        let mut waited = Duration::ZERO;
        loop {
            if self.take_ack(id) {
                return Ok(());
            }
            if waited >= timeout {
                warn!("MQTT: no ack for packet {}", packet_id);
                return Err(ProtocolError::AckTimeout);
            }
            // Short slices: the other agent may consume the wakeup.
            let slice = ACK_POLL.min(timeout - waited);
            wait_signal(&self.ack_signal, slice);
            waited += slice;
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Transport half
// ───────────────────────────────────────────────────────────────

pub struct EspMqttTransport {
    link: Arc<EspMqttLink>,
}

impl EspMqttTransport {
    pub fn new(link: Arc<EspMqttLink>) -> Self {
        Self { link }
    }
}

fn nul_terminated(pem: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(pem.len() + 1);
    v.extend_from_slice(pem.as_bytes());
    v.push(0);
    v
}

impl TransportPort for EspMqttTransport {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        identity: &TlsIdentity<'_>,
    ) -> Result<(), TransportError> {
        self.disconnect();

        let pem = [
            nul_terminated(identity.root_ca),
            nul_terminated(identity.certificate),
            nul_terminated(identity.private_key),
        ];
        let conf = MqttClientConfiguration {
            client_id: Some(identity.client_id),
            server_certificate: Some(X509::pem_until_nul(&pem[0])),
            client_certificate: Some(X509::pem_until_nul(&pem[1])),
            private_key: Some(X509::pem_until_nul(&pem[2])),
            buffer_size: BUFFER_SIZE,
            out_buffer_size: BUFFER_SIZE,
            ..Default::default()
        };
        let url = format!("mqtts://{host}:{port}");
        info!("MQTT: connecting to {} as {}", url, identity.client_id);

        self.link.link_up.reset();
        let (client, mut conn) = EspMqttClient::new(&url, &conf).map_err(|e| {
            error!("MQTT: client init failed: {:?}", e);
            TransportError::ConnectFailed
        })?;

        let link = Arc::clone(&self.link);
        std::thread::Builder::new()
            .name("mqtt-rx".into())
            .stack_size(8 * 1024)
            .spawn(move || {
                while let Ok(event) = conn.next() {
                    link.on_event(event.payload());
                }
                debug!("MQTT: receive loop ended");
            })
            .map_err(|_| TransportError::Io)?;

        *lock(&self.link.live) = Some(LiveClient { client, _pem: pem });

        match wait_signal(&self.link.link_up, CONNECT_TIMEOUT) {
            Some(true) => Ok(()),
            Some(false) => {
                self.disconnect();
                Err(TransportError::AuthRejected)
            }
            None => {
                self.disconnect();
                Err(TransportError::ConnectFailed)
            }
        }
    }

    fn disconnect(&mut self) {
        if lock(&self.link.live).take().is_some() {
            info!("MQTT: client dropped");
        }
        self.link.connected.store(false, core::sync::atomic::Ordering::Release);
    }

    fn send(&mut self, _data: &[u8]) -> Result<usize, TransportError> {
        Err(TransportError::Io)
    }

    fn recv(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Err(TransportError::Io)
    }
}
