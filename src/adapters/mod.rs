//! Adapters — concrete implementations of the hexagonal port traits.
//!
//! | Adapter       | Implements            | Connects to                    |
//! |---------------|-----------------------|--------------------------------|
//! | `nvs`         | ConfigPort            | NVS / in-memory store          |
//! |               | StoragePort           |                                |
//! | `cert_store`  | (over StoragePort)    | `aws` credentials namespace    |
//! | `wifi`        | (over StoragePort)    | `wifi` namespace, ESP-IDF STA  |
//! | `flash`       | ImageStore            | OTA slots + `ota_patch`        |
//! | `csr`         | CsrPort               | mbedtls / seeded simulation    |
//! | `system`      | SystemPort            | esp_restart                    |
//! | `device_id`   | —                     | factory MAC in eFuse           |
//! | `mqtt_client` | MqttPort              | esp-mqtt (ESP-IDF only)        |
//! |               | TransportPort         |                                |
//! | `task`        | —                     | core-pinned FreeRTOS tasks     |

pub mod cert_store;
pub mod csr;
pub mod device_id;
pub mod flash;
#[cfg(target_os = "espidf")]
pub mod mqtt_client;
pub mod nvs;
pub mod system;
pub mod task;
pub mod wifi;
