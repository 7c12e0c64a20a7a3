//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL,
//! including the `tls-server-end-point` channel binding of SCRAM-SHA-256-PLUS.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::PgError;

type HmacSha256 = Hmac<Sha256>;

/// How the client participates in channel binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelBindingMode {
    /// No TLS, or binding disabled: GS2 flag `n`.
    Unsupported,
    /// Client could bind but the server did not offer -PLUS: GS2 flag `y`.
    NotOffered,
    /// Bind to the server certificate hash: GS2 flag `p=tls-server-end-point`.
    TlsServerEndPoint(Vec<u8>),
}

impl ChannelBindingMode {
    fn gs2_header(&self) -> &'static str {
        match self {
            ChannelBindingMode::Unsupported => "n,,",
            ChannelBindingMode::NotOffered => "y,,",
            ChannelBindingMode::TlsServerEndPoint(_) => "p=tls-server-end-point,,",
        }
    }

    /// Value of the `c=` attribute: base64 of the GS2 header and binding data.
    fn channel_binding_attr(&self) -> String {
        let mut input = self.gs2_header().as_bytes().to_vec();
        if let ChannelBindingMode::TlsServerEndPoint(data) = self {
            input.extend_from_slice(data);
        }
        BASE64.encode(input)
    }
}

/// SCRAM-SHA-256 client state machine.
///
/// Lives only for the duration of one handshake.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    binding: ChannelBindingMode,
    /// Auth message for final verification
    auth_message: Option<String>,
    /// Salted password (cached for final step)
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    /// Create a new SCRAM client with a random nonce.
    pub fn new(username: &str, password: &str, binding: ChannelBindingMode) -> Self {
        // 24 random bytes, base64 encoded (32 chars)
        let nonce_bytes: [u8; 24] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes), binding)
    }

    /// Create a client with a fixed nonce.
    pub fn with_nonce(
        username: &str,
        password: &str,
        nonce: &str,
        binding: ChannelBindingMode,
    ) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            binding,
            auth_message: None,
            salted_password: None,
        }
    }

    pub fn binding(&self) -> &ChannelBindingMode {
        &self.binding
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", sasl_name(&self.username), self.client_nonce)
    }

    /// Generate the initial client message (client-first-message).
    ///
    /// Format: `<gs2-header>n=<username>,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("{}{}", self.binding.gs2_header(), self.client_first_bare()).into_bytes()
    }

    /// Process the server's first message and generate the client's final message.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_str.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ScramError::InvalidIterations)?,
                );
            } else if let Some(value) = part.strip_prefix("e=") {
                return Err(ScramError::Server(value.to_string()));
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;

        if iterations == 0 {
            return Err(ScramError::InvalidIterations);
        }

        // The server extends our nonce, it never replaces it
        if combined_nonce.len() <= self.client_nonce.len()
            || !combined_nonce.starts_with(&self.client_nonce)
        {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!(
            "c={},r={}",
            self.binding.channel_binding_attr(),
            combined_nonce
        );
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_str,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor_bytes(&client_key, &client_signature);

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        let client_final = format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        );
        Ok(client_final.into_bytes())
    }

    /// Verify the server's final message (server signature).
    ///
    /// Server message format: `v=<verifier>` or `e=<error>`
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Some(error) = server_str.strip_prefix("e=") {
            return Err(ScramError::Server(error.to_string()));
        }

        let verifier_b64 = server_str
            .split(',')
            .next()
            .and_then(|v| v.strip_prefix("v="))
            .ok_or(ScramError::InvalidServerSignature)?;

        let server_signature = BASE64
            .decode(verifier_b64)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let salted_password = self.salted_password.ok_or(ScramError::InvalidState)?;
        let auth_message = self.auth_message.as_ref().ok_or(ScramError::InvalidState)?;

        let server_key = hmac_sha256(&salted_password, b"Server Key")?;
        let mut mac =
            HmacSha256::new_from_slice(&server_key).map_err(|_| ScramError::InvalidState)?;
        mac.update(auth_message.as_bytes());
        // Constant-time comparison
        mac.verify_slice(&server_signature)
            .map_err(|_| ScramError::ServerSignatureVerificationFailed)
    }
}

/// SCRAM authentication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing nonce in server message")]
    MissingNonce,
    #[error("Missing salt in server message")]
    MissingSalt,
    #[error("Missing iterations in server message")]
    MissingIterations,
    #[error("Server nonce verification failed")]
    NonceVerificationFailed,
    #[error("Invalid server signature")]
    InvalidServerSignature,
    #[error("Server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("Server reported SCRAM error: {0}")]
    Server(String),
    #[error("Invalid SCRAM state")]
    InvalidState,
}

impl From<ScramError> for PgError {
    fn from(e: ScramError) -> Self {
        PgError::Auth(e.to_string())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
pub(crate) fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidState)?;
    Ok(output)
}

/// HMAC-SHA-256
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::InvalidState)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// SHA-256 hash
pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// XOR two byte arrays
pub(crate) fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b)) {
        *out = x ^ y;
    }
    result
}

/// Escape a username as a SCRAM `saslname`.
fn sasl_name(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}
