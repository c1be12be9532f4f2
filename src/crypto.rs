//! AES-128-ECB encryption used by protocol 3.1 through 3.4.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};

const BLOCK: usize = 16;

/// TuyaCipher wraps a 16-byte device or session key.
pub struct TuyaCipher {
    key: [u8; BLOCK],
}

impl TuyaCipher {
    /// Create a new TuyaCipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; BLOCK] = key.try_into().map_err(|_| TuyaError::EncryptionFailed)?;
        Ok(Self { key })
    }

    /// Encrypt `data`. With `padding` off the input must already be block aligned.
    pub fn encrypt(&self, data: &[u8], padding: bool) -> Result<Vec<u8>> {
        let mut buf = data.to_vec();
        if padding {
            let pad = BLOCK - data.len() % BLOCK;
            buf.resize(data.len() + pad, pad as u8);
        } else if !buf.len().is_multiple_of(BLOCK) {
            return Err(TuyaError::EncryptionFailed);
        }

        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(buf)
    }

    /// Decrypt `data` and strip PKCS7 padding.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(BLOCK) {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut buf = data.to_vec();
        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        for chunk in buf.chunks_mut(BLOCK) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }

        let pad = buf[buf.len() - 1] as usize;
        if pad == 0 || pad > BLOCK || buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
            return Err(TuyaError::DecryptionFailed);
        }
        buf.truncate(buf.len() - pad);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef";

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            TuyaCipher::new(b"short"),
            Err(TuyaError::EncryptionFailed)
        ));
    }

    #[test]
    fn padding_fills_a_whole_block_on_aligned_input() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        let encrypted = cipher.encrypt(&[7u8; 16], true).unwrap();
        assert_eq!(encrypted.len(), 32);
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn unpadded_encrypt_requires_alignment() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        assert!(cipher.encrypt(b"not aligned", false).is_err());
        assert_eq!(cipher.encrypt(&[0u8; 32], false).unwrap().len(), 32);
    }

    #[test]
    fn wrong_key_fails_padding_check() {
        let cipher = TuyaCipher::new(KEY).unwrap();
        let encrypted = cipher.encrypt(br#"{"dps":{"1":true}}"#, true).unwrap();
        let other = TuyaCipher::new(b"fedcba9876543210").unwrap();
        // A wrong key yields garbage whose last byte is almost never valid padding.
        match other.decrypt(&encrypted) {
            Err(TuyaError::DecryptionFailed) => {}
            Ok(plain) => assert_ne!(plain, br#"{"dps":{"1":true}}"#.to_vec()),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
