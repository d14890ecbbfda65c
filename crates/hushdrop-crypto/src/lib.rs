/// Hushdrop Crypto Library
///
/// Password-derived AES-128-GCM for single-file transfers:
/// - `keys`: credential handling and the password → key derivation
/// - `stream`: chunked GCM codec producing `[nonce][ciphertext][tag]` frames
///
/// The key derivation is a single unsalted SHA-256 truncated to 128 bits so
/// that two peers typing the same password land on the same key without
/// exchanging anything. It is weak against offline guessing and yields the
/// same key for every session that reuses a password. Replacing it with a
/// salted memory-hard KDF requires a salt on the wire and therefore a
/// protocol change on both peers.

pub mod keys;
pub mod stream;

pub use keys::{Credential, EmptyCredential, KEY_LEN, SymmetricKey, derive_key};
pub use stream::{
    CHUNK_SIZE, ChunkObserver, CodecError, MIN_FRAME_LEN, NONCE_LEN, TAG_LEN, decrypt_stream,
    encrypt_stream, open, seal,
};
