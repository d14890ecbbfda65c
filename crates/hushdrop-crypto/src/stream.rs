/// Streaming AES-128-GCM codec.
///
/// ```text
/// [0..12]          Nonce (random per frame)
/// [12..len-16]     Ciphertext, same length as the plaintext
/// [len-16..len]    GCM tag over the whole ciphertext
/// ```
///
/// Byte-identical to a one-shot AES-128-GCM seal with empty associated data,
/// but produced and consumed in CHUNK_SIZE steps so memory stays constant in
/// the file size. The tag only covers the complete stream: decrypted bytes
/// handed to the writer are unauthenticated until `decrypt_stream` returns Ok.

use std::io::{self, Read, Write};

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ghash::GHash;
use ghash::universal_hash::UniversalHash;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::keys::SymmetricKey;

/// GCM nonce length (96-bit IV).
pub const NONCE_LEN: usize = 12;

/// GCM tag length (128-bit).
pub const TAG_LEN: usize = 16;

/// Plaintext bytes processed per step.
pub const CHUNK_SIZE: usize = 4096;

/// Smallest valid frame: nonce + tag around an empty file.
pub const MIN_FRAME_LEN: usize = NONCE_LEN + TAG_LEN;

const BLOCK_LEN: usize = 16;

type Aes128Ctr = ctr::Ctr32BE<Aes128>;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encrypted stream is truncated or malformed")]
    MalformedStream,
    #[error("authentication failed: wrong password or tampered data")]
    AuthenticationFailure,
    #[error("cancelled")]
    Cancelled,
    #[error("stream exceeds the AES-GCM length limit for one nonce")]
    StreamTooLong,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Hooks consulted by the codec between chunks.
pub trait ChunkObserver {
    /// Checked before every chunk. Returning false aborts with `Cancelled`.
    fn should_continue(&self) -> bool {
        true
    }

    /// Running count of plaintext bytes processed.
    fn on_progress(&self, _bytes: u64) {}
}

impl ChunkObserver for () {}

/// Incremental GCM: CTR keystream from inc32(J0), GHASH over the ciphertext.
struct GcmState {
    ctr: Aes128Ctr,
    ghash: GHash,
    tag_mask: aes::Block,
    partial: [u8; BLOCK_LEN],
    partial_len: usize,
    ciphertext_len: u64,
}

impl GcmState {
    fn new(key: &SymmetricKey, nonce: &[u8; NONCE_LEN]) -> Self {
        let key = GenericArray::from_slice(key.as_bytes());
        let cipher = Aes128::new(key);

        let mut hash_key = aes::Block::default();
        cipher.encrypt_block(&mut hash_key);

        let mut counter = [0u8; BLOCK_LEN];
        counter[..NONCE_LEN].copy_from_slice(nonce);
        counter[BLOCK_LEN - 1] = 1;
        let mut tag_mask = aes::Block::clone_from_slice(&counter);
        cipher.encrypt_block(&mut tag_mask);

        // Payload keystream starts one block after J0.
        counter[BLOCK_LEN - 1] = 2;
        let ctr = Aes128Ctr::new(key, GenericArray::from_slice(&counter));

        Self {
            ctr,
            ghash: GHash::new(&hash_key),
            tag_mask,
            partial: [0u8; BLOCK_LEN],
            partial_len: 0,
            ciphertext_len: 0,
        }
    }

    fn apply_keystream(&mut self, buf: &mut [u8]) -> Result<(), CodecError> {
        self.ctr
            .try_apply_keystream(buf)
            .map_err(|_| CodecError::StreamTooLong)
    }

    /// Feed ciphertext into GHASH. Only whole blocks are hashed; a trailing
    /// partial block waits for more data or for `finish`.
    fn absorb(&mut self, mut data: &[u8]) {
        self.ciphertext_len += data.len() as u64;

        if self.partial_len > 0 {
            let take = (BLOCK_LEN - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];
            if self.partial_len < BLOCK_LEN {
                return;
            }
            self.ghash.update_padded(&self.partial);
            self.partial_len = 0;
        }

        let whole = data.len() - data.len() % BLOCK_LEN;
        if whole > 0 {
            self.ghash.update_padded(&data[..whole]);
        }
        let rest = &data[whole..];
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }

    fn finish(mut self) -> [u8; TAG_LEN] {
        if self.partial_len > 0 {
            self.ghash.update_padded(&self.partial[..self.partial_len]);
        }

        // len(A) = 0 || len(C) in bits, both u64 BE
        let mut lengths = [0u8; BLOCK_LEN];
        lengths[8..].copy_from_slice(&(self.ciphertext_len * 8).to_be_bytes());
        self.ghash.update_padded(&lengths);

        let digest = self.ghash.finalize();
        let mut tag = [0u8; TAG_LEN];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = digest[i] ^ self.tag_mask[i];
        }
        tag
    }
}

/// Encrypt `reader` into `writer` as one frame with a fresh random nonce.
/// Returns the number of plaintext bytes consumed.
pub fn encrypt_stream<R: Read, W: Write>(
    reader: R,
    writer: W,
    key: &SymmetricKey,
    observer: &dyn ChunkObserver,
) -> Result<u64, CodecError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(reader, writer, key, &nonce, observer)
}

fn encrypt_with_nonce<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &SymmetricKey,
    nonce: &[u8; NONCE_LEN],
    observer: &dyn ChunkObserver,
) -> Result<u64, CodecError> {
    let mut state = GcmState::new(key, nonce);
    writer.write_all(nonce)?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        if !observer.should_continue() {
            return Err(CodecError::Cancelled);
        }

        let n = read_full(&mut reader, &mut buf)?;
        if n > 0 {
            let chunk = &mut buf[..n];
            state.apply_keystream(chunk)?;
            state.absorb(chunk);
            writer.write_all(chunk)?;
            total += n as u64;
            observer.on_progress(total);
        }
        if n < CHUNK_SIZE {
            break;
        }
    }

    writer.write_all(&state.finish())?;
    writer.flush()?;
    Ok(total)
}

/// Decrypt one frame from `reader` into `writer`.
///
/// The final TAG_LEN bytes of the stream are held back until end of input and
/// then checked against the computed tag in constant time. Returns the number
/// of plaintext bytes written. On error the writer may hold unauthenticated
/// plaintext and the caller must discard it.
pub fn decrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &SymmetricKey,
    observer: &dyn ChunkObserver,
) -> Result<u64, CodecError> {
    let mut nonce = [0u8; NONCE_LEN];
    if read_full(&mut reader, &mut nonce)? < NONCE_LEN {
        return Err(CodecError::MalformedStream);
    }
    let mut state = GcmState::new(key, &nonce);

    // window[..held] = unprocessed bytes, the last TAG_LEN of which may be the tag
    let mut window = vec![0u8; TAG_LEN + CHUNK_SIZE];
    let mut held = 0usize;
    let mut total: u64 = 0;
    loop {
        if !observer.should_continue() {
            return Err(CodecError::Cancelled);
        }

        let wanted = window.len() - held;
        let n = read_full(&mut reader, &mut window[held..])?;
        held += n;

        if held > TAG_LEN {
            let ready = held - TAG_LEN;
            let chunk = &mut window[..ready];
            state.absorb(chunk);
            state.apply_keystream(chunk)?;
            writer.write_all(chunk)?;
            total += ready as u64;
            observer.on_progress(total);

            window.copy_within(ready..held, 0);
            held = TAG_LEN;
        }

        if n < wanted {
            break;
        }
    }

    if held < TAG_LEN {
        return Err(CodecError::MalformedStream);
    }

    let expected = state.finish();
    if !bool::from(expected[..].ct_eq(&window[..TAG_LEN])) {
        return Err(CodecError::AuthenticationFailure);
    }

    writer.flush()?;
    Ok(total)
}

/// Encrypt an in-memory payload into a complete frame.
pub fn seal(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CodecError> {
    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + plaintext.len());
    encrypt_stream(plaintext, &mut frame, key, &())?;
    Ok(frame)
}

/// Decrypt an in-memory frame. Never returns partial plaintext.
pub fn open(frame: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CodecError> {
    let mut plaintext = Vec::with_capacity(frame.len().saturating_sub(MIN_FRAME_LEN));
    decrypt_stream(frame, &mut plaintext, key, &())?;
    Ok(plaintext)
}

/// Read until `buf` is full or the reader reports end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use aes_gcm::aead::{Aead, KeyInit as _};
    use aes_gcm::{Aes128Gcm, Nonce};

    use super::*;
    use crate::keys::derive_key;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Hands out at most 7 bytes per read to exercise partial blocks.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.0.len()).min(7);
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn roundtrip_across_chunk_boundaries() {
        let key = derive_key("secret123");
        for len in [0, 1, 15, 16, 17, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, 3 * CHUNK_SIZE + 7] {
            let plaintext = pattern(len);
            let frame = seal(&plaintext, &key).unwrap();
            assert_eq!(frame.len(), MIN_FRAME_LEN + len);
            assert_eq!(open(&frame, &key).unwrap(), plaintext, "len {}", len);
        }
    }

    #[test]
    fn matches_nist_gcm_test_case_2() {
        // AES-128-GCM, K = 0^128, IV = 0^96, P = 0^128
        let key = SymmetricKey::from_bytes([0u8; 16]);
        let mut frame = Vec::new();
        encrypt_with_nonce(&[0u8; 16][..], &mut frame, &key, &[0u8; NONCE_LEN], &()).unwrap();

        let expected_ct = [
            0x03, 0x88, 0xda, 0xce, 0x60, 0xb6, 0xa3, 0x92, 0xf3, 0x28, 0xc2, 0xb9, 0x71, 0xb2,
            0xfe, 0x78,
        ];
        let expected_tag = [
            0xab, 0x6e, 0x47, 0xd4, 0x2c, 0xec, 0x13, 0xbd, 0xf5, 0x3a, 0x67, 0xb2, 0x12, 0x57,
            0xbd, 0xdf,
        ];
        assert_eq!(&frame[NONCE_LEN..NONCE_LEN + 16], &expected_ct);
        assert_eq!(&frame[NONCE_LEN + 16..], &expected_tag);
    }

    #[test]
    fn interoperates_with_one_shot_aes_gcm() {
        let key = derive_key("correct horse");
        let reference = Aes128Gcm::new_from_slice(key.as_bytes()).unwrap();
        let plaintext = pattern(2 * CHUNK_SIZE + 333);

        // Our frame opens with the reference implementation.
        let frame = seal(&plaintext, &key).unwrap();
        let opened = reference
            .decrypt(Nonce::from_slice(&frame[..NONCE_LEN]), &frame[NONCE_LEN..])
            .unwrap();
        assert_eq!(opened, plaintext);

        // A reference frame opens with ours.
        let nonce = [7u8; NONCE_LEN];
        let mut foreign = nonce.to_vec();
        foreign.extend(reference.encrypt(Nonce::from_slice(&nonce), &plaintext[..]).unwrap());
        assert_eq!(open(&foreign, &key).unwrap(), plaintext);
    }

    #[test]
    fn short_reads_do_not_change_output() {
        let key = derive_key("trickle");
        let plaintext = pattern(CHUNK_SIZE + 50);
        let nonce = [3u8; NONCE_LEN];

        let mut whole = Vec::new();
        encrypt_with_nonce(&plaintext[..], &mut whole, &key, &nonce, &()).unwrap();
        let mut trickled = Vec::new();
        encrypt_with_nonce(Trickle(&plaintext), &mut trickled, &key, &nonce, &()).unwrap();
        assert_eq!(whole, trickled);

        let mut out = Vec::new();
        decrypt_stream(Trickle(&whole), &mut out, &key, &()).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn wrong_password_is_authentication_failure() {
        let frame = seal(b"hello world", &derive_key("secret123")).unwrap();
        let result = open(&frame, &derive_key("wrongpass"));
        assert!(matches!(result, Err(CodecError::AuthenticationFailure)));
    }

    #[test]
    fn any_flipped_bit_is_detected() {
        let key = derive_key("tamper");
        let frame = seal(&pattern(40), &key).unwrap();
        for pos in 0..frame.len() {
            for bit in [0x01u8, 0x80] {
                let mut tampered = frame.clone();
                tampered[pos] ^= bit;
                assert!(
                    matches!(open(&tampered, &key), Err(CodecError::AuthenticationFailure)),
                    "flip at byte {} not detected",
                    pos
                );
            }
        }
    }

    #[test]
    fn truncated_frames_are_malformed() {
        let key = derive_key("short");
        let frame = seal(b"", &key).unwrap();
        assert_eq!(frame.len(), MIN_FRAME_LEN);
        for len in [0, 5, NONCE_LEN - 1, NONCE_LEN, NONCE_LEN + 3, MIN_FRAME_LEN - 1] {
            assert!(
                matches!(open(&frame[..len], &key), Err(CodecError::MalformedStream)),
                "len {}",
                len
            );
        }
    }

    #[test]
    fn dropped_tail_fails_authentication() {
        let key = derive_key("tail");
        let frame = seal(&pattern(100), &key).unwrap();
        let result = open(&frame[..frame.len() - 1], &key);
        assert!(matches!(result, Err(CodecError::AuthenticationFailure)));
    }

    #[test]
    fn fresh_nonce_per_frame() {
        let key = derive_key("same");
        let a = seal(b"identical plaintext", &key).unwrap();
        let b = seal(b"identical plaintext", &key).unwrap();
        assert_ne!(&a[..NONCE_LEN], &b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    struct StopAfter {
        chunks_allowed: Cell<usize>,
        last_progress: Cell<u64>,
    }

    impl ChunkObserver for StopAfter {
        fn should_continue(&self) -> bool {
            let left = self.chunks_allowed.get();
            if left == 0 {
                return false;
            }
            self.chunks_allowed.set(left - 1);
            true
        }

        fn on_progress(&self, bytes: u64) {
            self.last_progress.set(bytes);
        }
    }

    #[test]
    fn cancellation_stops_within_one_chunk() {
        let key = derive_key("cancel");
        let plaintext = pattern(10 * CHUNK_SIZE);
        let observer = StopAfter {
            chunks_allowed: Cell::new(2),
            last_progress: Cell::new(0),
        };

        let mut out = Vec::new();
        let result = encrypt_stream(&plaintext[..], &mut out, &key, &observer);
        assert!(matches!(result, Err(CodecError::Cancelled)));
        assert_eq!(observer.last_progress.get(), 2 * CHUNK_SIZE as u64);
        assert_eq!(out.len(), NONCE_LEN + 2 * CHUNK_SIZE);
    }
}
