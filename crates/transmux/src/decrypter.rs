//! AES-128-CBC segment decryption.
//!
//! Two paths exist. The software path decrypts progressively: each call consumes
//! whole blocks and keeps a partial trailing block for the next call. The final
//! decrypted block is also held back because its PKCS7 padding can only be
//! stripped once the end of the segment is known. The offloaded path decrypts a
//! complete payload on the blocking thread pool and resolves through
//! [`PendingDecrypt`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::Aes128;
use bytes::{Bytes, BytesMut};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::TransmuxError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const AES_BLOCK_SIZE: usize = 16;

/// Supported segment encryption methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptMethod {
    Aes128,
}

/// Key material for one encrypted fragment.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptParams {
    pub method: DecryptMethod,
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl DecryptParams {
    pub fn aes128(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self {
            method: DecryptMethod::Aes128,
            key,
            iv,
        }
    }
}

impl fmt::Debug for DecryptParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptParams")
            .field("method", &self.method)
            .field("key", &"<redacted>")
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

struct CbcState {
    key: [u8; 16],
    iv: [u8; 16],
    cipher: Aes128CbcDec,
}

/// Progressive AES-128-CBC decrypter.
#[derive(Default)]
pub struct Decrypter {
    state: Option<CbcState>,
    remainder: BytesMut,
    held: Option<[u8; AES_BLOCK_SIZE]>,
}

impl fmt::Debug for Decrypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decrypter")
            .field("active", &self.state.is_some())
            .field("remainder", &self.remainder.len())
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl Decrypter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decrypt as many whole blocks as are available.
    ///
    /// Returns `None` when nothing can be released yet.
    pub fn software_decrypt(
        &mut self,
        data: &[u8],
        params: &DecryptParams,
    ) -> Result<Option<Bytes>, TransmuxError> {
        let reuse = self
            .state
            .as_ref()
            .is_some_and(|s| s.key == params.key && s.iv == params.iv);
        if !reuse {
            self.reset();
            let cipher = Aes128CbcDec::new_from_slices(&params.key, &params.iv).map_err(|e| {
                TransmuxError::decryption(format!("failed to initialize AES decryptor: {e}"))
            })?;
            self.state = Some(CbcState {
                key: params.key,
                iv: params.iv,
                cipher,
            });
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(None);
        };

        self.remainder.extend_from_slice(data);
        let whole = self.remainder.len() / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
        if whole == 0 {
            return Ok(None);
        }

        let mut blocks = self.remainder.split_to(whole);
        for block in blocks.chunks_exact_mut(AES_BLOCK_SIZE) {
            state
                .cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }

        let last = whole - AES_BLOCK_SIZE;
        let mut out = BytesMut::with_capacity(whole);
        if let Some(previous) = self.held.take() {
            out.extend_from_slice(&previous);
        }
        out.extend_from_slice(&blocks[..last]);

        let mut tail = [0u8; AES_BLOCK_SIZE];
        tail.copy_from_slice(&blocks[last..]);
        self.held = Some(tail);

        trace!(
            released = out.len(),
            cached = self.remainder.len(),
            "Progressive decrypt"
        );
        Ok((!out.is_empty()).then(|| out.freeze()))
    }

    /// Release the held final block with its padding removed and reset.
    pub fn flush(&mut self) -> Result<Option<Bytes>, TransmuxError> {
        if !self.remainder.is_empty() {
            warn!(
                bytes = self.remainder.len(),
                "Discarding trailing bytes that do not form a whole AES block"
            );
        }
        let held = self.held.take();
        self.reset();
        let Some(block) = held else {
            return Ok(None);
        };
        let unpadded = strip_pkcs7(&block)?;
        Ok((!unpadded.is_empty()).then(|| Bytes::copy_from_slice(unpadded)))
    }

    pub fn reset(&mut self) {
        self.state = None;
        self.remainder.clear();
        self.held = None;
    }
}

fn strip_pkcs7(block: &[u8; AES_BLOCK_SIZE]) -> Result<&[u8], TransmuxError> {
    let pad = block[AES_BLOCK_SIZE - 1] as usize;
    if pad == 0 || pad > AES_BLOCK_SIZE {
        return Err(TransmuxError::decryption(format!(
            "invalid PKCS7 padding length {pad}"
        )));
    }
    let body = AES_BLOCK_SIZE - pad;
    if block[body..].iter().any(|&b| b as usize != pad) {
        return Err(TransmuxError::decryption("inconsistent PKCS7 padding"));
    }
    Ok(&block[..body])
}

/// Decrypt a complete payload in one go.
pub fn decrypt_all(data: &[u8], params: &DecryptParams) -> Result<Bytes, TransmuxError> {
    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new_from_slices(&params.key, &params.iv).map_err(|e| {
        TransmuxError::decryption(format!("failed to initialize AES decryptor: {e}"))
    })?;
    let decrypted_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| TransmuxError::decryption(format!("decryption failed: {e}")))?
        .len();
    buffer.truncate(decrypted_len);
    Ok(Bytes::from(buffer))
}

/// Decryption running on the blocking thread pool.
///
/// Resolves to the decrypted bytes of the payload handed to [`PendingDecrypt::spawn`].
pub struct PendingDecrypt {
    handle: JoinHandle<Result<Bytes, TransmuxError>>,
}

impl PendingDecrypt {
    /// Must be called from within a tokio runtime.
    pub fn spawn(data: Bytes, params: DecryptParams) -> Self {
        let handle = tokio::task::spawn_blocking(move || decrypt_all(&data, &params));
        Self { handle }
    }
}

impl fmt::Debug for PendingDecrypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDecrypt")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

impl Future for PendingDecrypt {
    type Output = Result<Bytes, TransmuxError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(TransmuxError::decryption(format!(
                "decryption offload task failed: {e}"
            )))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cipher::BlockEncryptMut;
    use proptest::prelude::*;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    pub(crate) fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = (plaintext.len() / 16 + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    fn params() -> DecryptParams {
        DecryptParams::aes128([0x42; 16], [0x24; 16])
    }

    fn decrypt_in_pieces(ciphertext: &[u8], sizes: &[usize]) -> Vec<u8> {
        let params = params();
        let mut decrypter = Decrypter::new();
        let mut out = Vec::new();
        let mut offset = 0;
        for &size in sizes {
            if offset >= ciphertext.len() {
                break;
            }
            let end = (offset + size).min(ciphertext.len());
            if let Some(chunk) = decrypter
                .software_decrypt(&ciphertext[offset..end], &params)
                .unwrap()
            {
                out.extend_from_slice(&chunk);
            }
            offset = end;
        }
        if offset < ciphertext.len() {
            if let Some(chunk) = decrypter
                .software_decrypt(&ciphertext[offset..], &params)
                .unwrap()
            {
                out.extend_from_slice(&chunk);
            }
        }
        if let Some(chunk) = decrypter.flush().unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn test_partial_block_is_cached() {
        let params = params();
        let ciphertext = encrypt(&[9u8; 40], &params.key, &params.iv);
        let mut decrypter = Decrypter::new();

        assert!(decrypter.software_decrypt(&ciphertext[..10], &params).unwrap().is_none());
        // First whole block is held back until more data arrives.
        assert!(decrypter.software_decrypt(&ciphertext[10..20], &params).unwrap().is_none());
        let released = decrypter
            .software_decrypt(&ciphertext[20..], &params)
            .unwrap()
            .unwrap();
        assert_eq!(released.len(), 32);
        let tail = decrypter.flush().unwrap().unwrap();
        assert_eq!(tail.len(), 8);
        assert!(decrypter.flush().unwrap().is_none());
    }

    #[test]
    fn test_exact_multiple_plaintext_flushes_to_nothing_extra() {
        let params = params();
        let plaintext = vec![3u8; 32];
        let ciphertext = encrypt(&plaintext, &params.key, &params.iv);
        assert_eq!(ciphertext.len(), 48);
        assert_eq!(decrypt_in_pieces(&ciphertext, &[48]), plaintext);
    }

    #[test]
    fn test_invalid_padding_is_rejected() {
        let params = params();
        let mut decrypter = Decrypter::new();
        // Garbage ciphertext almost never decrypts to valid padding; craft a block that
        // decrypts to a zero pad byte by encrypting a block without padding.
        let mut block = [0u8; 16];
        let mut enc = Aes128CbcEnc::new_from_slices(&params.key, &params.iv).unwrap();
        enc.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        decrypter.software_decrypt(&block, &params).unwrap();
        assert!(matches!(
            decrypter.flush(),
            Err(TransmuxError::Decryption { .. })
        ));
    }

    #[test]
    fn test_key_change_resets_state() {
        let first = params();
        let second = DecryptParams::aes128([0x11; 16], [0x22; 16]);
        let mut decrypter = Decrypter::new();
        let ct1 = encrypt(&[1u8; 20], &first.key, &first.iv);
        decrypter.software_decrypt(&ct1[..16], &first).unwrap();

        let ct2 = encrypt(&[2u8; 20], &second.key, &second.iv);
        let mut out = Vec::new();
        if let Some(chunk) = decrypter.software_decrypt(&ct2, &second).unwrap() {
            out.extend_from_slice(&chunk);
        }
        if let Some(chunk) = decrypter.flush().unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, vec![2u8; 20]);
    }

    #[test]
    fn test_params_debug_hides_key() {
        let rendered = format!("{:?}", DecryptParams::aes128([0xAB; 16], [0x0F; 16]));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains(&"0f".repeat(16)));
        assert!(!rendered.contains("abab"));
    }

    #[tokio::test]
    async fn test_offloaded_decrypt_matches_plaintext() {
        let params = params();
        let plaintext: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let ciphertext = encrypt(&plaintext, &params.key, &params.iv);
        let out = PendingDecrypt::spawn(Bytes::from(ciphertext), params)
            .await
            .unwrap();
        assert_eq!(&out[..], &plaintext[..]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_split_decrypt_equals_whole(
            plaintext in proptest::collection::vec(any::<u8>(), 0..600),
            sizes in proptest::collection::vec(1usize..70, 1..20),
        ) {
            let params = params();
            let ciphertext = encrypt(&plaintext, &params.key, &params.iv);
            let whole = decrypt_all(&ciphertext, &params).unwrap();
            prop_assert_eq!(&whole[..], &plaintext[..]);
            prop_assert_eq!(decrypt_in_pieces(&ciphertext, &sizes), plaintext);
        }
    }
}
