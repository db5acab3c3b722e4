//! Image storage over the OTA partitions.
//!
//! ```text
//!   running slot   ── Region::Running       (read only)
//!   next OTA slot  ── Region::Update        (esp_ota_* session)
//!   ota_patch      ── Region::PatchStaging  (raw partition, erased per job)
//! ```
//!
//! On ESP-IDF the update region is written through an `esp_ota` session
//! opened by [`ImageStore::prepare`] and closed by `finalize`, which
//! verifies the image before selecting it for boot.  On host targets the
//! three regions are plain byte vectors.

use log::{info, warn};

use crate::app::ports::{FlashError, ImageStore, Region};

/// Label of the patch staging partition in `partitions.csv`.
pub const PATCH_PARTITION_LABEL: &str = "ota_patch";

// ───────────────────────────────────────────────────────────────
// Boot validation
// ───────────────────────────────────────────────────────────────

/// Cancel a pending rollback once the new image is up.
#[cfg(target_os = "espidf")]
pub fn mark_running_valid() {
    match esp_ota::mark_app_valid() {
        Ok(()) => info!("Flash: running image marked valid"),
        Err(e) => warn!("Flash: could not mark running image valid: {:?}", e),
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn mark_running_valid() {
    info!("Flash(sim): rollback check skipped");
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
mod esp {
    use core::ffi::c_void;

    use esp_idf_svc::sys::{
        ESP_OK, ESP_PARTITION_SUBTYPE_ANY, ESP_PARTITION_TYPE_DATA, esp_ota_abort,
        esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
        esp_ota_get_running_partition, esp_ota_handle_t, esp_ota_set_boot_partition,
        esp_ota_write_with_offset, esp_partition_erase_range, esp_partition_find_first,
        esp_partition_read, esp_partition_t, esp_partition_write, OTA_SIZE_UNKNOWN,
    };
    use log::{error, info, warn};

    use super::PATCH_PARTITION_LABEL;
    use crate::app::ports::{FlashError, ImageStore, Region};

    pub struct EspImageStore {
        running: *const esp_partition_t,
        update: *const esp_partition_t,
        staging: *const esp_partition_t,
        session: Option<esp_ota_handle_t>,
    }

    // SAFETY: partition descriptors are static tables owned by ESP-IDF and
    // never freed; the OTA handle is only used from the owning agent.
    unsafe impl Send for EspImageStore {}

    impl EspImageStore {
        pub fn new() -> Result<Self, FlashError> {
            let label = format!("{PATCH_PARTITION_LABEL}\0");
            // SAFETY: plain lookups into the partition table.
            let (running, update, staging) = unsafe {
                (
                    esp_ota_get_running_partition(),
                    esp_ota_get_next_update_partition(core::ptr::null()),
                    esp_partition_find_first(
                        ESP_PARTITION_TYPE_DATA,
                        ESP_PARTITION_SUBTYPE_ANY,
                        label.as_ptr().cast(),
                    ),
                )
            };
            if running.is_null() || update.is_null() || staging.is_null() {
                error!("Flash: OTA partition layout incomplete");
                return Err(FlashError::NoPartition);
            }
            Ok(Self {
                running,
                update,
                staging,
                session: None,
            })
        }

        fn partition(&self, region: Region) -> *const esp_partition_t {
            match region {
                Region::Running => self.running,
                Region::Update => self.update,
                Region::PatchStaging => self.staging,
            }
        }

        fn size(&self, region: Region) -> u32 {
            // SAFETY: descriptor checked non-null in `new`.
            unsafe { (*self.partition(region)).size }
        }
    }

    impl ImageStore for EspImageStore {
        fn prepare(&mut self, region: Region) -> Result<(), FlashError> {
            match region {
                Region::Running => Err(FlashError::OutOfRange),
                Region::Update => {
                    self.abort();
                    let mut handle: esp_ota_handle_t = 0;
                    // SAFETY: `update` is a valid app partition.
                    let ret = unsafe {
                        esp_ota_begin(self.update, OTA_SIZE_UNKNOWN as usize, &mut handle)
                    };
                    if ret != ESP_OK {
                        error!("Flash: esp_ota_begin failed ({})", ret);
                        return Err(FlashError::EraseFailed);
                    }
                    self.session = Some(handle);
                    info!("Flash: update session open");
                    Ok(())
                }
                Region::PatchStaging => {
                    let size = self.size(region) as usize;
                    // SAFETY: erase covers exactly the partition.
                    let ret = unsafe { esp_partition_erase_range(self.staging, 0, size) };
                    if ret == ESP_OK {
                        Ok(())
                    } else {
                        error!("Flash: patch region erase failed ({})", ret);
                        Err(FlashError::EraseFailed)
                    }
                }
            }
        }

        fn capacity(&self, region: Region) -> u32 {
            self.size(region)
        }

        fn write_at(&mut self, region: Region, offset: u32, data: &[u8]) -> Result<(), FlashError> {
            let end = offset as usize + data.len();
            if end > self.size(region) as usize {
                return Err(FlashError::OutOfRange);
            }
            // SAFETY: bounds checked above; `data` outlives the call.
            let ret = unsafe {
                match region {
                    Region::Running => return Err(FlashError::OutOfRange),
                    Region::Update => {
                        let handle = self.session.ok_or(FlashError::NotPrepared)?;
                        esp_ota_write_with_offset(
                            handle,
                            data.as_ptr().cast::<c_void>(),
                            data.len(),
                            offset,
                        )
                    }
                    Region::PatchStaging => esp_partition_write(
                        self.staging,
                        offset as usize,
                        data.as_ptr().cast::<c_void>(),
                        data.len(),
                    ),
                }
            };
            if ret == ESP_OK {
                Ok(())
            } else {
                error!("Flash: write at {:#x} failed ({})", offset, ret);
                Err(FlashError::WriteFailed)
            }
        }

        fn read_at(&self, region: Region, offset: u32, buf: &mut [u8]) -> Result<usize, FlashError> {
            let size = self.size(region) as usize;
            let offset = offset as usize;
            if offset >= size {
                return Ok(0);
            }
            let len = buf.len().min(size - offset);
            // SAFETY: `len` bytes fit both the partition and `buf`.
            let ret = unsafe {
                esp_partition_read(
                    self.partition(region),
                    offset,
                    buf.as_mut_ptr().cast::<c_void>(),
                    len,
                )
            };
            if ret == ESP_OK {
                Ok(len)
            } else {
                Err(FlashError::ReadFailed)
            }
        }

        fn finalize(&mut self, image_len: u32) -> Result<(), FlashError> {
            let handle = self.session.take().ok_or(FlashError::NotPrepared)?;
            info!("Flash: verifying {} byte image", image_len);
            // SAFETY: the handle came from esp_ota_begin and is consumed here.
            if unsafe { esp_ota_end(handle) } != ESP_OK {
                error!("Flash: image verification failed");
                return Err(FlashError::VerifyFailed);
            }
            // SAFETY: `update` holds a verified image.
            if unsafe { esp_ota_set_boot_partition(self.update) } != ESP_OK {
                return Err(FlashError::BootSetFailed);
            }
            info!("Flash: new image selected for boot");
            Ok(())
        }

        fn abort(&mut self) {
            if let Some(handle) = self.session.take() {
                // SAFETY: handle is live until this call.
                let ret = unsafe { esp_ota_abort(handle) };
                if ret != ESP_OK {
                    warn!("Flash: esp_ota_abort returned {}", ret);
                }
            }
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspImageStore;

// ───────────────────────────────────────────────────────────────
// Host simulation backend
// ───────────────────────────────────────────────────────────────

/// In-memory image store.  The boot selection is recorded, not acted on.
#[derive(Debug)]
pub struct SimImageStore {
    running: Vec<u8>,
    update: Vec<u8>,
    staging: Vec<u8>,
    session_open: bool,
    boot_image_len: Option<u32>,
}

impl SimImageStore {
    /// `running` is the image currently "executing"; the other two regions
    /// get `slot_size` bytes of erased flash.
    pub fn new(running: &[u8], slot_size: usize) -> Self {
        Self {
            running: running.to_vec(),
            update: vec![0xFF; slot_size],
            staging: vec![0xFF; slot_size],
            session_open: false,
            boot_image_len: None,
        }
    }

    /// Image selected for next boot, if any.
    pub fn boot_image(&self) -> Option<&[u8]> {
        self.boot_image_len
            .map(|len| &self.update[..len as usize])
    }

    pub fn region(&self, region: Region) -> &[u8] {
        match region {
            Region::Running => &self.running,
            Region::Update => &self.update,
            Region::PatchStaging => &self.staging,
        }
    }

    fn region_mut(&mut self, region: Region) -> &mut Vec<u8> {
        match region {
            Region::Running => &mut self.running,
            Region::Update => &mut self.update,
            Region::PatchStaging => &mut self.staging,
        }
    }
}

impl ImageStore for SimImageStore {
    fn prepare(&mut self, region: Region) -> Result<(), FlashError> {
        match region {
            Region::Running => return Err(FlashError::OutOfRange),
            Region::Update => self.session_open = true,
            Region::PatchStaging => {}
        }
        self.region_mut(region).fill(0xFF);
        Ok(())
    }

    fn capacity(&self, region: Region) -> u32 {
        self.region(region).len() as u32
    }

    fn write_at(&mut self, region: Region, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        match region {
            Region::Running => return Err(FlashError::OutOfRange),
            Region::Update if !self.session_open => return Err(FlashError::NotPrepared),
            _ => {}
        }
        let start = offset as usize;
        let dst = self
            .region_mut(region)
            .get_mut(start..start + data.len())
            .ok_or(FlashError::OutOfRange)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_at(&self, region: Region, offset: u32, buf: &mut [u8]) -> Result<usize, FlashError> {
        let src = self.region(region);
        let start = (offset as usize).min(src.len());
        let n = buf.len().min(src.len() - start);
        buf[..n].copy_from_slice(&src[start..start + n]);
        Ok(n)
    }

    fn finalize(&mut self, image_len: u32) -> Result<(), FlashError> {
        if !self.session_open {
            return Err(FlashError::NotPrepared);
        }
        self.session_open = false;
        if image_len == 0 || image_len as usize > self.update.len() {
            warn!("Flash(sim): image of {} bytes does not verify", image_len);
            return Err(FlashError::VerifyFailed);
        }
        self.boot_image_len = Some(image_len);
        info!("Flash(sim): {} byte image selected for boot", image_len);
        Ok(())
    }

    fn abort(&mut self) {
        self.session_open = false;
    }
}
