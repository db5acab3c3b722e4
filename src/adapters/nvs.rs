//! NVS (Non-Volatile Storage) adapter.
//!
//! Implements both [`ConfigPort`] and [`StoragePort`].
//!
//! | Namespace   | Owner                                   |
//! |-------------|-----------------------------------------|
//! | `fleetnode` | agent config (`agentcfg`, postcard)     |
//! | `aws`       | [`super::cert_store::CredentialStore`]  |
//! | `wifi`      | [`super::wifi::WifiSettings`]           |
//!
//! # Security
//!
//! - Encrypted NVS: on ESP32 the default partition is encrypted when
//!   `CONFIG_NVS_ENCRYPTION` is set.  The simulation backend is plaintext.
//! - Atomic writes: ESP-IDF NVS commits are atomic per `nvs_commit()`.

use log::info;
#[cfg(target_os = "espidf")]
use log::warn;

use crate::app::ports::{ConfigError, ConfigPort, StorageError, StoragePort};
use crate::config::{AgentConfig, validate_config};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

const CONFIG_NAMESPACE: &str = "fleetnode";
const CONFIG_KEY: &str = "agentcfg";

/// NVS limits keys and namespaces to 15 characters.
#[cfg(target_os = "espidf")]
const NVS_NAME_MAX: usize = 15;

pub struct NvsAdapter {
    #[cfg(not(target_os = "espidf"))]
    store: std::cell::RefCell<HashMap<String, Vec<u8>>>,
    /// Writes the simulation still lets through; `None` is unlimited.
    #[cfg(not(target_os = "espidf"))]
    write_budget: Option<usize>,
}

impl NvsAdapter {
    /// Initialise NVS flash.
    ///
    /// On first boot or after a version mismatch the partition is erased
    /// and re-initialised.
    pub fn new() -> Result<Self, ConfigError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: called once from the main task before any other NVS use.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                warn!("NVS: erasing and re-initialising flash partition");
                if unsafe { nvs_flash_erase() } != ESP_OK || unsafe { nvs_flash_init() } != ESP_OK
                {
                    return Err(ConfigError::IoError);
                }
            } else if ret != ESP_OK {
                return Err(ConfigError::IoError);
            }
            info!("NvsAdapter: ESP-IDF NVS initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("NvsAdapter: simulation backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: std::cell::RefCell::new(HashMap::new()),
            #[cfg(not(target_os = "espidf"))]
            write_budget: None,
        })
    }

    /// Simulation only: let `writes` more writes through, then fail every
    /// write with [`StorageError::IoError`].  `None` lifts the limit.
    #[cfg(not(target_os = "espidf"))]
    pub fn limit_writes(&mut self, writes: Option<usize>) {
        self.write_budget = writes;
    }

    #[cfg(not(target_os = "espidf"))]
    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }

    /// NUL-terminated copy of a key or namespace name.
    #[cfg(target_os = "espidf")]
    fn c_name(name: &str) -> [u8; NVS_NAME_MAX + 1] {
        let mut buf = [0u8; NVS_NAME_MAX + 1];
        let bytes = name.as_bytes();
        let len = bytes.len().min(NVS_NAME_MAX);
        buf[..len].copy_from_slice(&bytes[..len]);
        buf
    }

    /// Open a namespace, run `f` with the handle, then close it.
    #[cfg(target_os = "espidf")]
    fn with_handle<T>(
        namespace: &str,
        write: bool,
        f: impl FnOnce(nvs_handle_t) -> Result<T, i32>,
    ) -> Result<T, i32> {
        let ns = Self::c_name(namespace);
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };
        let mut handle: nvs_handle_t = 0;
        // SAFETY: `ns` is NUL-terminated and outlives the call.
        let ret = unsafe { nvs_open(ns.as_ptr().cast(), mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }
        let result = f(handle);
        unsafe { nvs_close(handle) };
        result
    }

    #[cfg(target_os = "espidf")]
    fn commit(handle: nvs_handle_t, ret: i32) -> Result<(), i32> {
        if ret != ESP_OK {
            return Err(ret);
        }
        match unsafe { nvs_commit(handle) } {
            ESP_OK => Ok(()),
            e => Err(e),
        }
    }

    /// Read a whole blob, sizing the buffer from NVS first.
    #[cfg(target_os = "espidf")]
    fn get_blob_alloc(namespace: &str, key: &str) -> Result<Vec<u8>, i32> {
        let k = Self::c_name(key);
        Self::with_handle(namespace, false, |handle| {
            let mut size: usize = 0;
            let ret =
                unsafe { nvs_get_blob(handle, k.as_ptr().cast(), core::ptr::null_mut(), &mut size) };
            if ret != ESP_OK {
                return Err(ret);
            }
            let mut buf = vec![0u8; size];
            let ret = unsafe {
                nvs_get_blob(handle, k.as_ptr().cast(), buf.as_mut_ptr().cast(), &mut size)
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            buf.truncate(size);
            Ok(buf)
        })
    }
}

impl ConfigPort for NvsAdapter {
    fn load(&self) -> Result<AgentConfig, ConfigError> {
        #[cfg(not(target_os = "espidf"))]
        let stored = self
            .store
            .borrow()
            .get(&Self::composite_key(CONFIG_NAMESPACE, CONFIG_KEY))
            .cloned();

        #[cfg(target_os = "espidf")]
        let stored = match Self::get_blob_alloc(CONFIG_NAMESPACE, CONFIG_KEY) {
            Ok(bytes) => Some(bytes),
            Err(e) if e == ESP_ERR_NVS_NOT_FOUND => None,
            Err(e) => {
                warn!("NvsAdapter: NVS read error {}, using defaults", e);
                None
            }
        };

        match stored {
            Some(bytes) => {
                let cfg: AgentConfig =
                    postcard::from_bytes(&bytes).map_err(|_| ConfigError::Corrupted)?;
                info!("NvsAdapter: loaded config ({} bytes)", bytes.len());
                Ok(cfg)
            }
            None => {
                info!("NvsAdapter: no stored config, using defaults");
                Ok(AgentConfig::default())
            }
        }
    }

    fn save(&mut self, config: &AgentConfig) -> Result<(), ConfigError> {
        validate_config(config)?;
        let bytes = postcard::to_allocvec(config).map_err(|_| ConfigError::IoError)?;
        self.write(CONFIG_NAMESPACE, CONFIG_KEY, &bytes)
            .map_err(|_| ConfigError::IoError)?;
        info!("NvsAdapter: config saved ({} bytes)", bytes.len());
        Ok(())
    }
}

impl StoragePort for NvsAdapter {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            let store = self.store.borrow();
            let data = store
                .get(&Self::composite_key(namespace, key))
                .ok_or(StorageError::NotFound)?;
            if data.len() > buf.len() {
                return Err(StorageError::Corrupted);
            }
            buf[..data.len()].copy_from_slice(data);
            Ok(data.len())
        }

        #[cfg(target_os = "espidf")]
        {
            let k = Self::c_name(key);
            let result = Self::with_handle(namespace, false, |handle| {
                let mut size = buf.len();
                let ret = unsafe {
                    nvs_get_blob(handle, k.as_ptr().cast(), buf.as_mut_ptr().cast(), &mut size)
                };
                if ret != ESP_OK {
                    return Err(ret);
                }
                Ok(size)
            });
            match result {
                Ok(size) => Ok(size),
                Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Err(StorageError::NotFound),
                Err(e) if e == ESP_ERR_NVS_INVALID_LENGTH => Err(StorageError::Corrupted),
                Err(_) => Err(StorageError::IoError),
            }
        }
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            if let Some(left) = self.write_budget.as_mut() {
                if *left == 0 {
                    return Err(StorageError::IoError);
                }
                *left -= 1;
            }
            self.store
                .get_mut()
                .insert(Self::composite_key(namespace, key), data.to_vec());
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let k = Self::c_name(key);
            Self::with_handle(namespace, true, |handle| {
                let ret = unsafe {
                    nvs_set_blob(handle, k.as_ptr().cast(), data.as_ptr().cast(), data.len())
                };
                Self::commit(handle, ret)
            })
            .map_err(|e| {
                if e == ESP_ERR_NVS_NOT_ENOUGH_SPACE {
                    StorageError::Full
                } else {
                    StorageError::IoError
                }
            })
        }
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.store
                .get_mut()
                .remove(&Self::composite_key(namespace, key));
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let k = Self::c_name(key);
            Self::with_handle(namespace, true, |handle| {
                let ret = match unsafe { nvs_erase_key(handle, k.as_ptr().cast()) } {
                    ESP_ERR_NVS_NOT_FOUND => ESP_OK,
                    other => other,
                };
                Self::commit(handle, ret)
            })
            .map_err(|_| StorageError::IoError)
        }
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        #[cfg(not(target_os = "espidf"))]
        {
            self.store
                .borrow()
                .contains_key(&Self::composite_key(namespace, key))
        }

        #[cfg(target_os = "espidf")]
        {
            let k = Self::c_name(key);
            Self::with_handle(namespace, false, |handle| {
                Ok(unsafe { nvs_find_key(handle, k.as_ptr().cast(), core::ptr::null_mut()) }
                    == ESP_OK)
            })
            .unwrap_or(false)
        }
    }
}
