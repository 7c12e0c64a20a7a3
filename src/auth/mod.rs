//! Authentication handshake codecs.
//!
//! SCRAM-SHA-256 (and -PLUS) through [`scram`], mechanism lookup through
//! [`mechanism`], and the legacy MD5 password hash.

pub mod mechanism;
pub mod scram;

pub use mechanism::{Mechanism, SCRAM_SHA_256, SCRAM_SHA_256_PLUS};
pub use scram::{ChannelBindingMode, ScramClient, ScramError};

/// MD5 password response: `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{}{}", password, user);
    let inner_hex = format!("{:x}", md5::compute(inner.as_bytes()));

    let mut outer = inner_hex.into_bytes();
    outer.extend_from_slice(salt);

    format!("md5{:x}", md5::compute(&outer))
}
