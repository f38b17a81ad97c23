//! Codec & crypto primitives (§4.1).
//!
//! Opus at 48kHz mono VoIP, AES-256-GCM with a 12-byte IV and 16-byte tag,
//! and the base64 framing used to carry encrypted payloads over JSON.

use aes_gcm::aead::{rand_core::RngCore, Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::constants::{IV_LEN, KEY_LEN, SAMPLE_RATE, SAMPLES_PER_FRAME, TAG_LEN};
use crate::error::CryptoError;

pub fn new_encoder() -> Result<opus::Encoder, CryptoError> {
    let mut encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
        .map_err(|e| CryptoError::OpusEncode(e.to_string()))?;
    // Best-effort: some opus builds don't expose bitrate/vbr tuning knobs.
    let _ = encoder.set_bitrate(opus::Bitrate::Bits(64_000));
    let _ = encoder.set_vbr(true);
    Ok(encoder)
}

pub fn new_decoder() -> Result<opus::Decoder, CryptoError> {
    opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono).map_err(|e| CryptoError::OpusDecode(e.to_string()))
}

/// Converts float samples in [-1, 1] to signed 16-bit PCM with saturation.
pub fn float_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32767.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts signed 16-bit PCM to float samples in [-1, 1].
pub fn i16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32767.0).collect()
}

pub fn encode_frame(encoder: &mut opus::Encoder, pcm: &[i16]) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; 4000];
    let len = encoder
        .encode(pcm, &mut out)
        .map_err(|e| CryptoError::OpusEncode(e.to_string()))?;
    out.truncate(len);
    Ok(out)
}

pub fn decode_frame(decoder: &mut opus::Decoder, data: &[u8]) -> Result<Vec<i16>, CryptoError> {
    let mut out = vec![0i16; SAMPLES_PER_FRAME];
    let len = decoder
        .decode(data, &mut out, false)
        .map_err(|e| CryptoError::OpusDecode(e.to_string()))?;
    out.truncate(len);
    Ok(out)
}

/// Encrypts `plaintext` with AES-256-GCM. Wire layout: `IV(12) || ciphertext || Tag(16)`.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a `IV(12) || ciphertext || Tag(16)` blob. Verifies the tag.
pub fn decrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_LEN + TAG_LEN {
        return Err(CryptoError::CiphertextTooShort(data.len()));
    }
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&data[..IV_LEN]);
    cipher
        .decrypt(nonce, &data[IV_LEN..])
        .map_err(|_| CryptoError::TagVerificationFailed)
}

pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decodes base64; returns an empty vector on malformed input rather than
/// erroring, matching how callers treat an empty result as "nothing to do".
pub fn decode_base64(input: &str) -> Vec<u8> {
    STANDARD.decode(input).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(fill: u8) -> [u8; KEY_LEN] {
        [fill; KEY_LEN]
    }

    #[test]
    fn aes_gcm_round_trip() {
        let key = test_key(7);
        let plaintext = b"hello world, this is opus audio bytes";
        let blob = encrypt(plaintext, &key).unwrap();
        assert_eq!(blob.len(), plaintext.len() + IV_LEN + TAG_LEN);
        let decrypted = decrypt(&blob, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_gcm_rejects_short_key() {
        let err = encrypt(b"data", &[0u8; 16]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyLength(16)));
    }

    #[test]
    fn aes_gcm_rejects_short_ciphertext() {
        let key = test_key(1);
        let err = decrypt(&[0u8; 27], &key).unwrap_err();
        assert!(matches!(err, CryptoError::CiphertextTooShort(27)));
    }

    #[test]
    fn aes_gcm_exactly_28_bytes_decrypts_to_empty() {
        let key = test_key(2);
        let blob = encrypt(b"", &key).unwrap();
        assert_eq!(blob.len(), IV_LEN + TAG_LEN);
        let decrypted = decrypt(&blob, &key).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn aes_gcm_tag_flip_fails() {
        let key = test_key(3);
        let mut blob = encrypt(b"audio payload", &key).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(matches!(decrypt(&blob, &key), Err(CryptoError::TagVerificationFailed)));
    }

    #[test]
    fn pcm_round_trip_saturates() {
        let samples = [2.0f32, -2.0, 0.5, -0.5, 0.0];
        let pcm = float_to_i16(&samples);
        assert_eq!(pcm[0], i16::MAX);
        assert_eq!(pcm[1], i16::MIN);
        let back = i16_to_float(&pcm);
        assert!((back[2] - 0.5).abs() < 0.01);
    }

    #[test]
    fn opus_round_trip_preserves_frame_size() {
        let mut enc = new_encoder().unwrap();
        let mut dec = new_decoder().unwrap();

        let mut pcm = vec![0i16; SAMPLES_PER_FRAME];
        for (i, s) in pcm.iter_mut().enumerate() {
            let t = i as f32 / SAMPLE_RATE as f32;
            *s = ((t * 1000.0 * std::f32::consts::TAU).sin() * 10000.0) as i16;
        }

        let encoded = encode_frame(&mut enc, &pcm).unwrap();
        assert!(!encoded.is_empty());
        let decoded = decode_frame(&mut dec, &encoded).unwrap();
        assert_eq!(decoded.len(), SAMPLES_PER_FRAME);
    }

    #[test]
    fn base64_round_trip() {
        let data = vec![1u8, 2, 3, 250, 251];
        let encoded = encode_base64(&data);
        assert_eq!(decode_base64(&encoded), data);
    }

    #[test]
    fn base64_malformed_input_returns_empty() {
        assert!(decode_base64("not valid base64!!").is_empty());
    }
}
