//! Key pair and signing request generation.
//!
//! On ESP-IDF this is mbedtls: a P-256 key from the hardware RNG and a
//! SHA-256 signed PKCS#10 request.  On host targets the output has the
//! right PEM framing around seeded random bytes, enough for the cloud
//! mocks, which never parse it.

use crate::app::ports::{CryptoError, CsrPort, KeyMaterial};

fn wrap_pem(label: &str, body: &[u8]) -> String {
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(body);
    let mut pem = format!("-----BEGIN {label}-----\n");
    for line in encoded.as_bytes().chunks(64) {
        // base64 output is ASCII.
        pem.push_str(core::str::from_utf8(line).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    pem
}

// ───────────────────────────────────────────────────────────────
// Host simulation
// ───────────────────────────────────────────────────────────────

pub struct SimCsr {
    rng: rand::rngs::SmallRng,
}

impl SimCsr {
    pub fn new(seed: u64) -> Self {
        use rand::SeedableRng;
        Self {
            rng: rand::rngs::SmallRng::seed_from_u64(seed),
        }
    }
}

impl CsrPort for SimCsr {
    fn generate_keypair_and_csr(&mut self, subject: &str) -> Result<KeyMaterial, CryptoError> {
        use rand::RngCore;
        if subject.is_empty() {
            return Err(CryptoError::CsrEncoding);
        }
        let mut key = [0u8; 32];
        self.rng.fill_bytes(&mut key);
        let mut request = subject.as_bytes().to_vec();
        request.extend_from_slice(&key);
        Ok(KeyMaterial {
            private_key_pem: wrap_pem("EC PRIVATE KEY", &key),
            csr_pem: wrap_pem("CERTIFICATE REQUEST", &request),
        })
    }
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF mbedtls
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
mod esp {
    use core::ffi::{c_int, c_uchar, c_void};

    use esp_idf_svc::sys::{
        esp_fill_random, mbedtls_ecp_gen_key, mbedtls_ecp_group_id_MBEDTLS_ECP_DP_SECP256R1,
        mbedtls_ecp_keypair, mbedtls_md_type_t_MBEDTLS_MD_SHA256, mbedtls_pk_context,
        mbedtls_pk_free, mbedtls_pk_info_from_type, mbedtls_pk_init, mbedtls_pk_setup,
        mbedtls_pk_type_t_MBEDTLS_PK_ECKEY, mbedtls_pk_write_key_pem, mbedtls_x509write_csr,
        mbedtls_x509write_csr_free, mbedtls_x509write_csr_init, mbedtls_x509write_csr_pem,
        mbedtls_x509write_csr_set_key, mbedtls_x509write_csr_set_md_alg,
        mbedtls_x509write_csr_set_subject_name,
    };
    use log::{error, info};

    use crate::app::ports::{CryptoError, CsrPort, KeyMaterial};

    /// Largest PEM the generator will produce.
    const PEM_CAPACITY: usize = 4096;

    unsafe extern "C" fn hw_random(_: *mut c_void, out: *mut c_uchar, len: usize) -> c_int {
        // SAFETY: mbedtls hands us a writable buffer of `len` bytes.
        unsafe { esp_fill_random(out.cast(), len) };
        0
    }

    /// Owns the mbedtls contexts so every exit path frees them.
    struct Contexts {
        pk: mbedtls_pk_context,
        csr: mbedtls_x509write_csr,
    }

    impl Contexts {
        fn new() -> Self {
            // SAFETY: zeroed contexts are what the init functions expect.
            let mut ctx: Self = unsafe { core::mem::zeroed() };
            unsafe {
                mbedtls_pk_init(&mut ctx.pk);
                mbedtls_x509write_csr_init(&mut ctx.csr);
            }
            ctx
        }
    }

    impl Drop for Contexts {
        fn drop(&mut self) {
            // SAFETY: both were initialised in `new`.
            unsafe {
                mbedtls_x509write_csr_free(&mut self.csr);
                mbedtls_pk_free(&mut self.pk);
            }
        }
    }

    fn pem_from(buf: &[u8]) -> Result<String, CryptoError> {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8(buf[..end].to_vec()).map_err(|_| CryptoError::CsrEncoding)
    }

    #[derive(Default)]
    pub struct EspCsr;

    impl CsrPort for EspCsr {
        fn generate_keypair_and_csr(&mut self, subject: &str) -> Result<KeyMaterial, CryptoError> {
            let subject = format!("{subject}\0");
            let mut ctx = Contexts::new();
            let mut key_pem = vec![0u8; PEM_CAPACITY];
            let mut csr_pem = vec![0u8; PEM_CAPACITY];

            // SAFETY: every pointer below refers to a live context or buffer
            // owned by this frame; lengths match the buffers.
            unsafe {
                let info = mbedtls_pk_info_from_type(mbedtls_pk_type_t_MBEDTLS_PK_ECKEY);
                if mbedtls_pk_setup(&mut ctx.pk, info) != 0 {
                    return Err(CryptoError::KeyGeneration);
                }
                let keypair = ctx.pk.private_pk_ctx.cast::<mbedtls_ecp_keypair>();
                let ret = mbedtls_ecp_gen_key(
                    mbedtls_ecp_group_id_MBEDTLS_ECP_DP_SECP256R1,
                    keypair,
                    Some(hw_random),
                    core::ptr::null_mut(),
                );
                if ret != 0 {
                    error!("CSR: key generation failed ({})", ret);
                    return Err(CryptoError::KeyGeneration);
                }
                if mbedtls_pk_write_key_pem(&ctx.pk, key_pem.as_mut_ptr(), key_pem.len()) != 0 {
                    return Err(CryptoError::KeyGeneration);
                }

                if mbedtls_x509write_csr_set_subject_name(&mut ctx.csr, subject.as_ptr().cast())
                    != 0
                {
                    return Err(CryptoError::CsrEncoding);
                }
                mbedtls_x509write_csr_set_key(&mut ctx.csr, &mut ctx.pk);
                mbedtls_x509write_csr_set_md_alg(&mut ctx.csr, mbedtls_md_type_t_MBEDTLS_MD_SHA256);
                let ret = mbedtls_x509write_csr_pem(
                    &mut ctx.csr,
                    csr_pem.as_mut_ptr(),
                    csr_pem.len(),
                    Some(hw_random),
                    core::ptr::null_mut(),
                );
                if ret != 0 {
                    error!("CSR: encoding failed ({})", ret);
                    return Err(CryptoError::CsrEncoding);
                }
            }

            info!("CSR: generated P-256 key and request");
            Ok(KeyMaterial {
                private_key_pem: pem_from(&key_pem)?,
                csr_pem: pem_from(&csr_pem)?,
            })
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspCsr;
