//! FleetNode firmware entry point.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                       │
//! │  NvsAdapter   EspImageStore   EspCsr   DeviceControl   Wi-Fi     │
//! │  EspMqttLink (MqttPort)  ·  EspMqttTransport (TransportPort)     │
//! │                                                                  │
//! │  ──────────────────── Port Trait Boundary ────────────────────   │
//! │                                                                  │
//! │   mqtt-rx ──▶ Router ──▶ JobDispatcher ──▶ OtaInbox / CertInbox  │
//! │                                                                  │
//! │   ota-agent task      UpdateAgent   (firmware jobs)              │
//! │   cert-agent task     RotationAgent (credential jobs)            │
//! │   connection task     ConnectionSupervisor (loss, rotation swap) │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! While onboarding is pending the device connects with its claim
//! identity instead, runs fleet provisioning, and restarts.
#![deny(unused_must_use)]

mod esp_link_shims;

use core::time::Duration;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use log::{error, info, warn};

use fleetnode::adapters::cert_store::CredentialStore;
use fleetnode::adapters::csr::EspCsr;
use fleetnode::adapters::device_id;
use fleetnode::adapters::flash::{self, EspImageStore};
use fleetnode::adapters::mqtt_client::{EspMqttLink, EspMqttTransport};
use fleetnode::adapters::nvs::NvsAdapter;
use fleetnode::adapters::system::DeviceControl;
use fleetnode::adapters::task;
use fleetnode::adapters::wifi::{self, WifiSettings};
use fleetnode::app::ports::{ConfigPort, SystemPort};
use fleetnode::app::supervisor::{ConnectionSupervisor, SupervisorDeps};
use fleetnode::cert::onboarding::{Onboarding, OnboardingDeps, ProvisioningInbox};
use fleetnode::cert::{CertDeps, CertInbox, RotationAgent};
use fleetnode::config::AgentConfig;
use fleetnode::jobs::dispatcher::JobDispatcher;
use fleetnode::mqtt::connection::{ConnectionManager, ReconnectSignal, SharedStorage};
use fleetnode::mqtt::router::Router;
use fleetnode::mqtt::session::Session;
use fleetnode::ota::{OtaInbox, UpdateAgent};
use fleetnode::pool::BlockPool;

/// Stream blocks in flight between the receive thread and the agents.
const BLOCK_POOL_SIZE: usize = 4;
/// How long a receive callback may wait for a pool buffer.
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(200);
/// How long fleet provisioning waits for each service response.
const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;
    info!("FleetNode v{}", env!("CARGO_PKG_VERSION"));

    // ── 2. Storage and configuration ──────────────────────────
    let mut nvs = NvsAdapter::new().map_err(|e| anyhow!("NVS init failed: {e}"))?;
    let config = nvs.load().unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        AgentConfig::default()
    });
    let onboarding = CredentialStore::new(&mut nvs).is_onboarding_enabled();
    let mac_address = device_id::mac_string(&device_id::read_mac());
    let credentials = if onboarding {
        CredentialStore::new(&mut nvs)
            .load_for_onboarding(&mac_address)
            .map_err(|e| anyhow!("claim credentials not provisioned: {e}"))?
    } else {
        CredentialStore::new(&mut nvs)
            .load()
            .map_err(|e| anyhow!("credentials not provisioned: {e}"))?
    };
    let wifi_settings =
        WifiSettings::load(&nvs).map_err(|e| anyhow!("Wi-Fi settings: {e}"))?;
    let thing_name = credentials.thing_name.clone();
    let storage: SharedStorage = Arc::new(Mutex::new(nvs));
    let credentials = Arc::new(Mutex::new(credentials));

    // ── 3. Network ────────────────────────────────────────────
    let peripherals = esp_idf_svc::hal::peripherals::Peripherals::take()?;
    let sysloop = esp_idf_svc::eventloop::EspSystemEventLoop::take()?;
    let _wifi = wifi::start_station(peripherals.modem, sysloop, &wifi_settings)
        .map_err(|e| anyhow!("{e}"))?;

    // ── 4. Pub/sub session ────────────────────────────────────
    let router = Arc::new(Router::new(&thing_name));
    let link = EspMqttLink::new(Arc::clone(&router));
    let session = Arc::new(Session::new(
        link.clone(),
        router,
        &thing_name,
        config.ack_timeout(),
    ));
    let system: Arc<dyn SystemPort> = Arc::new(DeviceControl::new());
    let reconnect = Arc::new(ReconnectSignal::new());
    // SAFETY: plain read of the hardware RNG.
    let seed = u64::from(unsafe { esp_idf_svc::sys::esp_random() });

    let mut connection = ConnectionManager::new(
        Box::new(EspMqttTransport::new(Arc::clone(&link))),
        Arc::clone(&credentials),
        Arc::clone(&storage),
        Arc::clone(&system),
        &config,
        seed,
    );
    connection
        .connect_with_backoff()
        .map_err(|e| anyhow!("broker unreachable: {e}"))?;

    // The image we booted authenticated; keep it.
    flash::mark_running_valid();
    let pool = BlockPool::new(BLOCK_POOL_SIZE);

    if onboarding {
        let mut provisioning = Onboarding::new(
            OnboardingDeps {
                session: Arc::clone(&session),
                inbox: ProvisioningInbox::new(Arc::clone(&pool), POOL_ACQUIRE_TIMEOUT),
                storage: Arc::clone(&storage),
                csr: Box::new(EspCsr),
                mac_address,
                response_timeout: PROVISIONING_TIMEOUT,
            },
            &config,
        );
        match provisioning.provision() {
            Ok(done) => info!("Onboarding: provisioned as '{}', restarting", done.thing_name),
            Err(e) => error!("Onboarding: {}, restarting to retry", e),
        }
        connection.disconnect();
        system.restart();
        return Ok(());
    }

    // ── 5. Agents ─────────────────────────────────────────────
    let ota_inbox = OtaInbox::new(Arc::clone(&pool), POOL_ACQUIRE_TIMEOUT);
    let cert_inbox = CertInbox::new(Arc::clone(&pool), POOL_ACQUIRE_TIMEOUT);

    let ota_agent = UpdateAgent::new(
        Arc::clone(&session),
        Arc::clone(&ota_inbox),
        Box::new(EspImageStore::new().map_err(|e| anyhow!("flash: {e}"))?),
        Arc::clone(&system),
        config.clone(),
    );
    let cert_agent = RotationAgent::new(
        CertDeps {
            session: Arc::clone(&session),
            inbox: Arc::clone(&cert_inbox),
            credentials: Arc::clone(&credentials),
            storage: Arc::clone(&storage),
            csr: Box::new(EspCsr),
            control: reconnect.clone(),
        },
        &config,
    );
    ota_agent.start().map_err(|e| anyhow!("ota queue: {e}"))?;
    cert_agent.start().map_err(|e| anyhow!("cert queue: {e}"))?;

    task::spawn(task::OTA_TASK, move || ota_agent.run())?;
    task::spawn(task::CERT_TASK, move || cert_agent.run())?;

    let dispatcher = Arc::new(JobDispatcher::new(
        Arc::clone(&session),
        ota_inbox.clone(),
        cert_inbox.clone(),
    ));
    dispatcher.start().map_err(|e| anyhow!("job subscription failed: {e}"))?;

    // ── 6. Connection owner ───────────────────────────────────
    let queue_timeout = config.queue_timeout();
    let supervisor = ConnectionSupervisor::new(SupervisorDeps {
        connection,
        session,
        reconnect,
        ota: ota_inbox,
        cert: cert_inbox,
        system,
        link_up: Box::new(move || link.is_connected()),
    });
    task::spawn(task::CONNECTION_TASK, move || supervisor.run(queue_timeout))?;

    info!("FleetNode running");
    loop {
        std::thread::park();
    }
}
