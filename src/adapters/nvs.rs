//! NVS (Non-Volatile Storage) configuration store.
//!
//! Implements [`ConfigStore`] by keeping the whole configuration document
//! as one JSON blob under `fwkernel::config`.
//!
//! - On ESP32 the blob goes through `nvs_set_blob` / `nvs_commit`, which
//!   is atomic per commit.
//! - On the host a mutex-guarded map simulates the partition (dev/test
//!   only).

use log::info;

use crate::config::{ConfigStore, ConfigTree};
use crate::error::ConfigError;

#[cfg(not(target_os = "espidf"))]
use parking_lot::Mutex;
#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;
#[cfg(target_os = "espidf")]
use log::warn;

const CONFIG_NAMESPACE: &str = "fwkernel";
const CONFIG_KEY: &str = "config";

/// Largest document accepted (NVS blob limit for a single page set).
pub const MAX_BLOB_SIZE: usize = 4000;

pub struct NvsConfigStore {
    #[cfg(not(target_os = "espidf"))]
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl NvsConfigStore {
    /// Initialise NVS flash.  On a full or version-mismatched partition
    /// the partition is erased and re-initialised.
    pub fn new() -> Result<Self, ConfigError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: called from the boot task before any other NVS user.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                warn!("NvsConfigStore: erasing and re-initialising flash partition");
                if unsafe { nvs_flash_erase() } != ESP_OK || unsafe { nvs_flash_init() } != ESP_OK {
                    return Err(ConfigError::Storage("nvs_flash_init failed".into()));
                }
            } else if ret != ESP_OK {
                return Err(ConfigError::Storage(format!("nvs_flash_init: {ret}")));
            }
            info!("NvsConfigStore: ESP-IDF NVS initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("NvsConfigStore: simulation backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(not(target_os = "espidf"))]
    fn composite_key() -> String {
        format!("{CONFIG_NAMESPACE}::{CONFIG_KEY}")
    }

    /// Open the config namespace, run `f` with the handle, close it.
    #[cfg(target_os = "espidf")]
    fn with_handle<F, T>(write: bool, f: F) -> Result<T, i32>
    where
        F: FnOnce(nvs_handle_t) -> Result<T, i32>,
    {
        let namespace = b"fwkernel\0";
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };
        let mut handle: nvs_handle_t = 0;
        let ret = unsafe { nvs_open(namespace.as_ptr().cast(), mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }
        let result = f(handle);
        unsafe { nvs_close(handle) };
        result
    }

    #[cfg(not(target_os = "espidf"))]
    fn read_blob(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        Ok(self.store.lock().get(&Self::composite_key()).cloned())
    }

    #[cfg(target_os = "espidf")]
    fn read_blob(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        let key = b"config\0";
        let result = Self::with_handle(false, |handle| {
            let mut size: usize = 0;
            let ret = unsafe {
                nvs_get_blob(handle, key.as_ptr().cast(), core::ptr::null_mut(), &mut size)
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            if size == 0 || size > MAX_BLOB_SIZE {
                return Err(ESP_ERR_NVS_INVALID_LENGTH);
            }
            let mut buf = vec![0u8; size];
            let ret = unsafe {
                nvs_get_blob(handle, key.as_ptr().cast(), buf.as_mut_ptr().cast(), &mut size)
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(buf)
        });
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Ok(None),
            Err(e) => {
                warn!("NvsConfigStore: NVS read error {}", e);
                Err(ConfigError::Storage(format!("nvs read: {e}")))
            }
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn write_blob(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        self.store
            .lock()
            .insert(Self::composite_key(), bytes.to_vec());
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    fn write_blob(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        let key = b"config\0";
        Self::with_handle(true, |handle| {
            let ret = unsafe {
                nvs_set_blob(handle, key.as_ptr().cast(), bytes.as_ptr().cast(), bytes.len())
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            let ret = unsafe { nvs_commit(handle) };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(())
        })
        .map_err(|e| {
            warn!("NvsConfigStore: NVS write error {}", e);
            ConfigError::Storage(format!("nvs write: {e}"))
        })
    }

    /// Remove the stored document (factory reset).
    #[cfg(not(target_os = "espidf"))]
    pub fn erase(&self) -> Result<(), ConfigError> {
        self.store.lock().remove(&Self::composite_key());
        Ok(())
    }

    #[cfg(target_os = "espidf")]
    pub fn erase(&self) -> Result<(), ConfigError> {
        let key = b"config\0";
        Self::with_handle(true, |handle| {
            let ret = unsafe { nvs_erase_key(handle, key.as_ptr().cast()) };
            if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                return Err(ret);
            }
            let ret = unsafe { nvs_commit(handle) };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(())
        })
        .map_err(|e| ConfigError::Storage(format!("nvs erase: {e}")))
    }
}

impl ConfigStore for NvsConfigStore {
    fn load(&self) -> Result<Option<ConfigTree>, ConfigError> {
        let Some(bytes) = self.read_blob()? else {
            info!("NvsConfigStore: no stored config");
            return Ok(None);
        };
        let tree = ConfigTree::from_slice(&bytes)
            .map_err(|e| ConfigError::Storage(format!("stored config corrupted: {e}")))?;
        info!("NvsConfigStore: loaded config ({} bytes)", bytes.len());
        Ok(Some(tree))
    }

    fn save(&self, tree: &ConfigTree) -> Result<(), ConfigError> {
        let json = tree.to_json()?;
        if json.len() > MAX_BLOB_SIZE {
            return Err(ConfigError::Storage(format!(
                "config is {} bytes, limit {}",
                json.len(),
                MAX_BLOB_SIZE
            )));
        }
        self.write_blob(json.as_bytes())?;
        info!("NvsConfigStore: config saved ({} bytes)", json.len());
        Ok(())
    }
}
