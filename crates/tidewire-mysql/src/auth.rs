//! Authentication plugins.
//!
//! Supported plugins:
//! - `mysql_native_password`: `SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))`
//! - `caching_sha2_password`: fast path
//!   `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)`, with full
//!   authentication over RSA when the server has no cached entry
//!
//! TLS is not negotiated, so the full-auth path always encrypts the
//! password with the server's RSA public key.

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tidewire_core::{ConnectionErrorKind, Error, Result};

/// Plugin name for SHA1 scrambles.
pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
/// Plugin name for SHA256 scrambles with a server-side cache.
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Status bytes the server sends during `caching_sha2_password`.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Fast auth succeeded; an OK packet follows
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Cache miss; full authentication required
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// An authentication plugin the client can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
}

impl AuthPlugin {
    /// Resolve a plugin by the name the server announces.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            MYSQL_NATIVE_PASSWORD | "" => Ok(AuthPlugin::NativePassword),
            CACHING_SHA2_PASSWORD => Ok(AuthPlugin::CachingSha2Password),
            other => Err(Error::connection(
                ConnectionErrorKind::Authentication,
                format!("unsupported authentication plugin '{other}'"),
            )),
        }
    }

    /// Plugin name as sent in the handshake response.
    pub const fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => MYSQL_NATIVE_PASSWORD,
            AuthPlugin::CachingSha2Password => CACHING_SHA2_PASSWORD,
        }
    }

    /// Scramble `password` against the server's `seed`.
    ///
    /// An empty password yields an empty response for every plugin.
    pub fn scramble(self, password: &str, seed: &[u8]) -> Vec<u8> {
        if password.is_empty() {
            return Vec::new();
        }
        let seed = trim_seed(seed);
        match self {
            AuthPlugin::NativePassword => native_scramble(password.as_bytes(), seed),
            AuthPlugin::CachingSha2Password => sha2_scramble(password.as_bytes(), seed),
        }
    }
}

/// Servers send a 20-byte scramble, sometimes followed by a NUL.
fn trim_seed(seed: &[u8]) -> &[u8] {
    match seed {
        [head @ .., 0] if head.len() == 20 => head,
        _ if seed.len() > 20 => &seed[..20],
        _ => seed,
    }
}

fn xor_into(mut left: Vec<u8>, right: &[u8]) -> Vec<u8> {
    for (l, r) in left.iter_mut().zip(right) {
        *l ^= r;
    }
    left
}

fn native_scramble(password: &[u8], seed: &[u8]) -> Vec<u8> {
    let hashed = Sha1::digest(password);
    let double_hashed = Sha1::digest(hashed);
    let salted = Sha1::new()
        .chain_update(seed)
        .chain_update(double_hashed)
        .finalize();
    xor_into(hashed.to_vec(), &salted)
}

fn sha2_scramble(password: &[u8], seed: &[u8]) -> Vec<u8> {
    let hashed = Sha256::digest(password);
    let double_hashed = Sha256::digest(hashed);
    let salted = Sha256::new()
        .chain_update(double_hashed)
        .chain_update(seed)
        .finalize();
    xor_into(hashed.to_vec(), &salted)
}

/// Encrypt the NUL-terminated password, XORed with the rotating seed,
/// under the server's RSA public key (OAEP padding).
pub fn rsa_encrypt_password(password: &str, seed: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    let seed = trim_seed(seed);
    if seed.is_empty() {
        return Err(auth_error("server sent an empty scramble"));
    }
    let mut plain: Vec<u8> = password.bytes().chain(std::iter::once(0)).collect();
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("server public key is not PEM text: {e}")))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("cannot parse server public key: {e}")))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
        .map_err(|e| auth_error(format!("RSA encryption failed: {e}")))
}

fn auth_error(message: impl Into<String>) -> Error {
    Error::connection(ConnectionErrorKind::Authentication, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 20] = [
        0x3d, 0x4c, 0x5e, 0x2f, 0x1a, 0x0b, 0x7c, 0x8d, 0x9e, 0xaf, 0x10, 0x21, 0x32, 0x43, 0x54,
        0x65, 0x76, 0x87, 0x98, 0xa9,
    ];

    #[test]
    fn empty_password_sends_nothing() {
        assert!(AuthPlugin::NativePassword.scramble("", &SEED).is_empty());
        assert!(AuthPlugin::CachingSha2Password.scramble("", &SEED).is_empty());
    }

    #[test]
    fn scramble_lengths() {
        assert_eq!(AuthPlugin::NativePassword.scramble("secret", &SEED).len(), 20);
        assert_eq!(AuthPlugin::CachingSha2Password.scramble("secret", &SEED).len(), 32);
    }

    #[test]
    fn native_scramble_is_reversible_by_server() {
        // The server recovers SHA1(pw) by XORing with SHA1(seed + stored hash).
        let scrambled = AuthPlugin::NativePassword.scramble("secret", &SEED);
        let stored = Sha1::digest(Sha1::digest(b"secret"));
        let mask = Sha1::new().chain_update(SEED).chain_update(stored).finalize();
        let recovered = xor_into(scrambled, &mask);
        assert_eq!(Sha1::digest(&recovered).as_slice(), stored.as_slice());
    }

    #[test]
    fn trailing_nul_in_seed_is_ignored() {
        let mut with_nul = SEED.to_vec();
        with_nul.push(0);
        for plugin in [AuthPlugin::NativePassword, AuthPlugin::CachingSha2Password] {
            assert_eq!(plugin.scramble("pw", &with_nul), plugin.scramble("pw", &SEED));
        }
    }

    #[test]
    fn plugin_names() {
        assert_eq!(
            AuthPlugin::from_name("caching_sha2_password").unwrap(),
            AuthPlugin::CachingSha2Password
        );
        assert_eq!(AuthPlugin::NativePassword.name(), "mysql_native_password");
        let err = AuthPlugin::from_name("auth_gssapi_client").unwrap_err();
        assert!(matches!(err, Error::Connection(ref c) if c.kind == ConnectionErrorKind::Authentication));
    }

    #[test]
    fn rsa_rejects_garbage_key() {
        assert!(rsa_encrypt_password("pw", &SEED, b"not a key").is_err());
    }
}
