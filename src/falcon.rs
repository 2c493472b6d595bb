// src/falcon.rs
//! Falcon-512 signing inside an isolated computation module.
//!
//! The module owns its own heap. Callers move bytes across the boundary into
//! regions they allocate, invoke an entry point that reports a status code, and
//! copy results back out. [`FalconSigner`] wraps every region in a guard so that
//! all of them are released on every exit path, including failed signing.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use ethers::utils::keccak256;
use fn_dsa::{
    sign_key_size, signature_size, vrfy_key_size, KeyPairGenerator, KeyPairGeneratorStandard,
    SigningKey, SigningKeyStandard, DOMAIN_NONE, FN_DSA_LOGN_512, HASH_ID_RAW,
};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

pub const SEED_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 897;
pub const SECRET_KEY_LEN: usize = 1281;
pub const SIGNATURE_MAX_LEN: usize = 690;

/// Status codes returned by the module entry points.
pub const STATUS_OK: i32 = 0;
pub const STATUS_BAD_REGION: i32 = -1;
pub const STATUS_BAD_KEY: i32 = -2;
pub const STATUS_OUTPUT_TOO_SMALL: i32 = -3;

const DEFAULT_HEAP_LIMIT: usize = 1 << 20;

/// Offset of a region inside the module heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionPtr(u32);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("Module heap exhausted allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("Unknown region {0:?}")]
    UnknownRegion(RegionPtr),

    #[error("Access of {len} bytes overruns region {ptr:?} of {size} bytes")]
    OutOfBounds { ptr: RegionPtr, len: usize, size: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PqError {
    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Key generation failed with status {0}")]
    KeygenFailure(i32),

    #[error("Signing failed with status {0}")]
    SignFailure(i32),

    #[error("Secret key must be {SECRET_KEY_LEN} bytes, got {0}")]
    InvalidSecretKey(usize),

    #[error("Module reported signed length {reported} beyond buffer of {capacity}")]
    InvalidOutputLength { reported: u64, capacity: usize },
}

/// Entry points and heap of the isolated module, mirroring the NIST `crypto_*` API.
pub trait FalconModule: Send + Sync {
    fn malloc(&self, len: usize) -> Result<RegionPtr, ModuleError>;

    fn free(&self, ptr: RegionPtr);

    fn write(&self, ptr: RegionPtr, data: &[u8]) -> Result<(), ModuleError>;

    fn read(&self, ptr: RegionPtr, len: usize) -> Result<Vec<u8>, ModuleError>;

    /// Derives a keypair from the 32-byte seed stored at `seed`.
    fn crypto_keypair(&self, pk: RegionPtr, sk: RegionPtr, seed: RegionPtr) -> i32;

    /// Writes `signature ‖ message` to `sm` and its length, as a little-endian
    /// u64, to `smlen`.
    fn crypto_sign(&self, sm: RegionPtr, smlen: RegionPtr, m: RegionPtr, mlen: u64, sk: RegionPtr) -> i32;
}

/// A module allocation released when dropped.
struct Region<'m> {
    module: &'m dyn FalconModule,
    ptr: RegionPtr,
    len: usize,
}

impl<'m> Region<'m> {
    fn alloc(module: &'m dyn FalconModule, len: usize) -> Result<Self, ModuleError> {
        let ptr = module.malloc(len)?;
        Ok(Self { module, ptr, len })
    }

    fn with_bytes(module: &'m dyn FalconModule, data: &[u8]) -> Result<Self, ModuleError> {
        let region = Self::alloc(module, data.len())?;
        module.write(region.ptr, data)?;
        Ok(region)
    }

    fn read(&self) -> Result<Vec<u8>, ModuleError> {
        self.read_prefix(self.len)
    }

    fn read_prefix(&self, len: usize) -> Result<Vec<u8>, ModuleError> {
        self.module.read(self.ptr, len)
    }
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        self.module.free(self.ptr);
    }
}

#[derive(Default)]
struct Heap {
    regions: HashMap<u32, Vec<u8>>,
    next: u32,
    used: usize,
}

/// In-process module backed by `fn-dsa`, with a bounded private heap.
pub struct NativeFalconModule {
    heap: Mutex<Heap>,
    limit: usize,
}

impl Default for NativeFalconModule {
    fn default() -> Self {
        Self::with_heap_limit(DEFAULT_HEAP_LIMIT)
    }
}

impl NativeFalconModule {
    pub fn with_heap_limit(limit: usize) -> Self {
        Self {
            heap: Mutex::new(Heap::default()),
            limit,
        }
    }

    /// Number of regions currently allocated.
    pub fn live_regions(&self) -> usize {
        self.heap().regions.len()
    }

    fn heap(&self) -> std::sync::MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_exact<const N: usize>(&self, ptr: RegionPtr) -> Option<Zeroizing<[u8; N]>> {
        let bytes = Zeroizing::new(self.read(ptr, N).ok()?);
        let mut out = Zeroizing::new([0u8; N]);
        out.copy_from_slice(&bytes);
        Some(out)
    }
}

impl FalconModule for NativeFalconModule {
    fn malloc(&self, len: usize) -> Result<RegionPtr, ModuleError> {
        let mut heap = self.heap();
        if heap.used + len > self.limit {
            return Err(ModuleError::OutOfMemory(len));
        }
        heap.next = heap.next.wrapping_add(1);
        let ptr = heap.next;
        heap.regions.insert(ptr, vec![0u8; len]);
        heap.used += len;
        Ok(RegionPtr(ptr))
    }

    fn free(&self, ptr: RegionPtr) {
        let mut heap = self.heap();
        match heap.regions.remove(&ptr.0) {
            Some(mut region) => {
                heap.used -= region.len();
                region.zeroize();
            }
            None => warn!("free of unknown region {:?}", ptr),
        }
    }

    fn write(&self, ptr: RegionPtr, data: &[u8]) -> Result<(), ModuleError> {
        let mut heap = self.heap();
        let region = heap
            .regions
            .get_mut(&ptr.0)
            .ok_or(ModuleError::UnknownRegion(ptr))?;
        if data.len() > region.len() {
            return Err(ModuleError::OutOfBounds {
                ptr,
                len: data.len(),
                size: region.len(),
            });
        }
        region[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, ptr: RegionPtr, len: usize) -> Result<Vec<u8>, ModuleError> {
        let heap = self.heap();
        let region = heap.regions.get(&ptr.0).ok_or(ModuleError::UnknownRegion(ptr))?;
        if len > region.len() {
            return Err(ModuleError::OutOfBounds {
                ptr,
                len,
                size: region.len(),
            });
        }
        Ok(region[..len].to_vec())
    }

    fn crypto_keypair(&self, pk: RegionPtr, sk: RegionPtr, seed: RegionPtr) -> i32 {
        let Some(seed) = self.read_exact::<SEED_LEN>(seed) else {
            return STATUS_BAD_REGION;
        };
        let mut rng = ChaCha20Rng::from_seed(*seed);
        let mut sign_key = Zeroizing::new(vec![0u8; sign_key_size(FN_DSA_LOGN_512)]);
        let mut vrfy_key = vec![0u8; vrfy_key_size(FN_DSA_LOGN_512)];
        KeyPairGeneratorStandard::default().keygen(FN_DSA_LOGN_512, &mut rng, &mut sign_key, &mut vrfy_key);

        if self.write(pk, &vrfy_key).is_err() || self.write(sk, &sign_key).is_err() {
            return STATUS_BAD_REGION;
        }
        STATUS_OK
    }

    fn crypto_sign(&self, sm: RegionPtr, smlen: RegionPtr, m: RegionPtr, mlen: u64, sk: RegionPtr) -> i32 {
        let Ok(message) = self.read(m, mlen as usize) else {
            return STATUS_BAD_REGION;
        };
        let Some(sign_key) = self.read_exact::<SECRET_KEY_LEN>(sk) else {
            return STATUS_BAD_REGION;
        };
        let Some(mut key) = SigningKeyStandard::decode(&sign_key[..]) else {
            return STATUS_BAD_KEY;
        };

        // Nonce randomness is derived from the key and message so equal inputs
        // give equal signatures.
        let mut rng_seed = Zeroizing::new(sign_key.to_vec());
        rng_seed.extend_from_slice(&message);
        let mut rng = ChaCha20Rng::from_seed(keccak256(&rng_seed[..]));

        let mut signed = vec![0u8; signature_size(key.get_logn())];
        key.sign(&mut rng, &DOMAIN_NONE, &HASH_ID_RAW, &message, &mut signed);
        signed.extend_from_slice(&message);

        match self.write(sm, &signed) {
            Ok(()) => {}
            Err(ModuleError::OutOfBounds { .. }) => return STATUS_OUTPUT_TOO_SMALL,
            Err(_) => return STATUS_BAD_REGION,
        }
        if self.write(smlen, &(signed.len() as u64).to_le_bytes()).is_err() {
            return STATUS_BAD_REGION;
        }
        STATUS_OK
    }
}

pub struct FalconKeypair {
    pub public_key: Vec<u8>,
    pub secret_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for FalconKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FalconKeypair")
            .field("public_key", &crate::codec::encode_hex(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// Signing key input: either the seed the keypair is derived from, or the
/// encoded secret key itself.
#[derive(Clone, Copy)]
pub enum PqKeyMaterial<'a> {
    Seed(&'a [u8; SEED_LEN]),
    SecretKey(&'a [u8]),
}

/// Output of `crypto_sign`: the detached signature followed by the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PqSignature {
    signed_message: Vec<u8>,
    signature_len: usize,
}

impl PqSignature {
    pub fn signed_message(&self) -> &[u8] {
        &self.signed_message
    }

    pub fn detached(&self) -> &[u8] {
        &self.signed_message[..self.signature_len]
    }

    pub fn message(&self) -> &[u8] {
        &self.signed_message[self.signature_len..]
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.signed_message
    }
}

pub struct FalconSigner<M = NativeFalconModule> {
    module: M,
}

impl Default for FalconSigner<NativeFalconModule> {
    fn default() -> Self {
        Self::new(NativeFalconModule::default())
    }
}

impl<M: FalconModule> FalconSigner<M> {
    pub fn new(module: M) -> Self {
        Self { module }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn keypair_from(&self, seed: &[u8; SEED_LEN]) -> Result<FalconKeypair, PqError> {
        let pk = Region::alloc(&self.module, PUBLIC_KEY_LEN)?;
        let sk = Region::alloc(&self.module, SECRET_KEY_LEN)?;
        self.generate(&pk, &sk, seed)?;

        Ok(FalconKeypair {
            public_key: pk.read()?,
            secret_key: Zeroizing::new(sk.read()?),
        })
    }

    pub fn sign(&self, key: PqKeyMaterial<'_>, message: &[u8]) -> Result<PqSignature, PqError> {
        let sk = match key {
            PqKeyMaterial::Seed(seed) => {
                let pk = Region::alloc(&self.module, PUBLIC_KEY_LEN)?;
                let sk = Region::alloc(&self.module, SECRET_KEY_LEN)?;
                self.generate(&pk, &sk, seed)?;
                sk
            }
            PqKeyMaterial::SecretKey(secret) => {
                if secret.len() != SECRET_KEY_LEN {
                    return Err(PqError::InvalidSecretKey(secret.len()));
                }
                Region::with_bytes(&self.module, secret)?
            }
        };

        let msg = Region::with_bytes(&self.module, message)?;
        let capacity = message.len() + SIGNATURE_MAX_LEN;
        let sm = Region::alloc(&self.module, capacity)?;
        let smlen = Region::alloc(&self.module, 8)?;

        let status = self
            .module
            .crypto_sign(sm.ptr, smlen.ptr, msg.ptr, message.len() as u64, sk.ptr);
        if status != STATUS_OK {
            warn!("crypto_sign returned status {}", status);
            return Err(PqError::SignFailure(status));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&smlen.read()?);
        let reported = u64::from_le_bytes(len_bytes);
        if reported as usize > capacity || (reported as usize) < message.len() {
            return Err(PqError::InvalidOutputLength { reported, capacity });
        }

        let signed_message = sm.read_prefix(reported as usize)?;
        let signature_len = signed_message.len() - message.len();
        debug!(signature_len, "post-quantum signature produced");

        Ok(PqSignature {
            signed_message,
            signature_len,
        })
    }

    fn generate(&self, pk: &Region<'_>, sk: &Region<'_>, seed: &[u8; SEED_LEN]) -> Result<(), PqError> {
        let seed_region = Region::with_bytes(&self.module, seed)?;
        let status = self.module.crypto_keypair(pk.ptr, sk.ptr, seed_region.ptr);
        if status != STATUS_OK {
            return Err(PqError::KeygenFailure(status));
        }
        Ok(())
    }
}
