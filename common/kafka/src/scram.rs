//! SASL/SCRAM client (RFC 5802, RFC 7677).
//!
//! The broker's SASL layer drives a generic challenge-response exchange through
//! [`SaslClient`]; [`ScramClient`] implements it for the SCRAM family. A client
//! instance covers exactly one authentication attempt: `begin` seeds the
//! conversation from credentials, `step` answers each server challenge, and
//! `done` reports whether the server signature was verified.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine,
};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

const NONCE_LEN: usize = 24;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SaslError {
    #[error("invalid credentials: {0}")]
    Credential(String),
    #[error("no scram conversation")]
    NoConversation,
    #[error("scram conversation already completed")]
    AlreadyAuthenticated,
    #[error("scram conversation failed earlier and cannot continue")]
    ConversationFailed,
    #[error("unsupported sasl mechanism: {0}")]
    UnsupportedMechanism(String),
    #[error("malformed server message: {0}")]
    MalformedChallenge(String),
    #[error("server rejected authentication: {0}")]
    Server(String),
    #[error("server signature does not match")]
    InvalidServerSignature,
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// A pluggable SASL challenge-response client, as seen by the broker connection.
pub trait SaslClient: Send {
    /// Mechanism name announced during the SASL handshake.
    fn mechanism(&self) -> &'static str;

    /// Prepare credentials and start a new conversation.
    fn begin(&mut self, username: &str, password: &str, authz_id: &str) -> Result<(), SaslError>;

    /// Feed the server challenge (empty for the first round) and return the response.
    fn step(&mut self, challenge: &str) -> Result<String, SaslError>;

    /// Whether the conversation reached its authenticated terminal state.
    fn done(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramMechanism {
    Sha256,
    Sha512,
}

impl ScramMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            ScramMechanism::Sha256 => "SCRAM-SHA-256",
            ScramMechanism::Sha512 => "SCRAM-SHA-512",
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramMechanism::Sha256 => Sha256::digest(data).to_vec(),
            ScramMechanism::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, SaslError> {
        match self {
            ScramMechanism::Sha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
                    .map_err(|e| SaslError::Crypto(e.to_string()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            ScramMechanism::Sha512 => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key)
                    .map_err(|e| SaslError::Crypto(e.to_string()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }

    fn salted_password(&self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramMechanism::Sha256 => {
                let mut out = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
                out.to_vec()
            }
            ScramMechanism::Sha512 => {
                let mut out = [0u8; 64];
                pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out);
                out.to_vec()
            }
        }
    }
}

impl fmt::Display for ScramMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScramMechanism {
    type Err = SaslError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SCRAM-SHA-256" => Ok(ScramMechanism::Sha256),
            "SCRAM-SHA-512" => Ok(ScramMechanism::Sha512),
            other => Err(SaslError::UnsupportedMechanism(other.to_owned())),
        }
    }
}

/// Where the client is in the three-message exchange.
enum Stage {
    /// `begin` ran; the next step emits client-first.
    Initial,
    AwaitingServerFirst {
        gs2_header: String,
        client_first_bare: String,
    },
    AwaitingServerFinal {
        server_signature: Vec<u8>,
    },
}

struct Conversation {
    username: String,
    password: String,
    authz_id: String,
    nonce: String,
    stage: Stage,
}

enum ConversationState {
    Uninitialized,
    Active(Conversation),
    Complete,
    Failed,
}

/// SCRAM client for one authentication attempt.
pub struct ScramClient {
    mechanism: ScramMechanism,
    state: ConversationState,
}

impl ScramClient {
    pub fn new(mechanism: ScramMechanism) -> Self {
        Self {
            mechanism,
            state: ConversationState::Uninitialized,
        }
    }

    pub fn sha512() -> Self {
        Self::new(ScramMechanism::Sha512)
    }

    fn start(
        &mut self,
        username: &str,
        password: &str,
        authz_id: &str,
        nonce: String,
    ) -> Result<(), SaslError> {
        if matches!(self.state, ConversationState::Complete) {
            return Err(SaslError::AlreadyAuthenticated);
        }

        if username.is_empty() {
            return Err(SaslError::Credential("username is empty".to_owned()));
        }

        let conversation = Conversation {
            username: prepare("username", username)?,
            password: prepare("password", password)?,
            authz_id: prepare("authorization id", authz_id)?,
            nonce,
            stage: Stage::Initial,
        };
        self.state = ConversationState::Active(conversation);

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn begin_with_nonce(
        &mut self,
        username: &str,
        password: &str,
        authz_id: &str,
        nonce: &str,
    ) -> Result<(), SaslError> {
        self.start(username, password, authz_id, nonce.to_owned())
    }

    fn advance(
        &self,
        mut conversation: Conversation,
        challenge: &str,
    ) -> Result<(String, ConversationState), SaslError> {
        match conversation.stage {
            Stage::Initial => {
                let gs2_header = if conversation.authz_id.is_empty() {
                    "n,,".to_owned()
                } else {
                    format!("n,a={},", escape_name(&conversation.authz_id))
                };
                let client_first_bare = format!(
                    "n={},r={}",
                    escape_name(&conversation.username),
                    conversation.nonce
                );
                let response = format!("{gs2_header}{client_first_bare}");

                conversation.stage = Stage::AwaitingServerFirst {
                    gs2_header,
                    client_first_bare,
                };
                Ok((response, ConversationState::Active(conversation)))
            }
            Stage::AwaitingServerFirst {
                gs2_header,
                client_first_bare,
            } => {
                let server_first = parse_server_first(challenge, &conversation.nonce)?;

                let client_final_without_proof = format!(
                    "c={},r={}",
                    BASE64.encode(gs2_header.as_bytes()),
                    server_first.nonce
                );
                let auth_message =
                    format!("{client_first_bare},{challenge},{client_final_without_proof}");

                let salted = self.mechanism.salted_password(
                    conversation.password.as_bytes(),
                    &server_first.salt,
                    server_first.iterations,
                );
                let client_key = self.mechanism.hmac(&salted, b"Client Key")?;
                let stored_key = self.mechanism.digest(&client_key);
                let client_signature = self
                    .mechanism
                    .hmac(&stored_key, auth_message.as_bytes())?;
                let proof: Vec<u8> = client_key
                    .iter()
                    .zip(client_signature.iter())
                    .map(|(a, b)| a ^ b)
                    .collect();

                let server_key = self.mechanism.hmac(&salted, b"Server Key")?;
                let server_signature = self
                    .mechanism
                    .hmac(&server_key, auth_message.as_bytes())?;

                let response = format!(
                    "{client_final_without_proof},p={}",
                    BASE64.encode(proof)
                );
                conversation.stage = Stage::AwaitingServerFinal { server_signature };
                Ok((response, ConversationState::Active(conversation)))
            }
            Stage::AwaitingServerFinal { server_signature } => {
                let attributes = parse_attributes(challenge)?;
                if let Some(error) = attributes.get(&'e') {
                    return Err(SaslError::Server(error.clone()));
                }
                let verifier = attributes.get(&'v').ok_or_else(|| {
                    SaslError::MalformedChallenge("missing server verifier".to_owned())
                })?;
                let verifier = BASE64
                    .decode(verifier)
                    .map_err(|e| SaslError::MalformedChallenge(e.to_string()))?;

                if !constant_time_eq(&verifier, &server_signature) {
                    return Err(SaslError::InvalidServerSignature);
                }

                Ok((String::new(), ConversationState::Complete))
            }
        }
    }
}

impl SaslClient for ScramClient {
    fn mechanism(&self) -> &'static str {
        self.mechanism.name()
    }

    fn begin(&mut self, username: &str, password: &str, authz_id: &str) -> Result<(), SaslError> {
        self.start(username, password, authz_id, generate_nonce())
    }

    fn step(&mut self, challenge: &str) -> Result<String, SaslError> {
        match std::mem::replace(&mut self.state, ConversationState::Failed) {
            ConversationState::Uninitialized => {
                self.state = ConversationState::Uninitialized;
                Err(SaslError::NoConversation)
            }
            ConversationState::Complete => {
                self.state = ConversationState::Complete;
                Err(SaslError::AlreadyAuthenticated)
            }
            ConversationState::Failed => Err(SaslError::ConversationFailed),
            ConversationState::Active(conversation) => {
                let (response, next) = self.advance(conversation, challenge)?;
                self.state = next;
                Ok(response)
            }
        }
    }

    fn done(&self) -> bool {
        matches!(self.state, ConversationState::Complete)
    }
}

struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

fn parse_server_first(message: &str, client_nonce: &str) -> Result<ServerFirst, SaslError> {
    let attributes = parse_attributes(message)?;

    if let Some(error) = attributes.get(&'e') {
        return Err(SaslError::Server(error.clone()));
    }
    if attributes.contains_key(&'m') {
        return Err(SaslError::MalformedChallenge(
            "unsupported mandatory extension".to_owned(),
        ));
    }

    let nonce = attributes
        .get(&'r')
        .ok_or_else(|| SaslError::MalformedChallenge("missing nonce".to_owned()))?;
    if !nonce.starts_with(client_nonce) || nonce.len() <= client_nonce.len() {
        return Err(SaslError::MalformedChallenge(
            "server nonce does not extend client nonce".to_owned(),
        ));
    }

    let salt = attributes
        .get(&'s')
        .ok_or_else(|| SaslError::MalformedChallenge("missing salt".to_owned()))?;
    let salt = BASE64
        .decode(salt)
        .map_err(|e| SaslError::MalformedChallenge(format!("invalid salt: {e}")))?;

    let iterations = attributes
        .get(&'i')
        .ok_or_else(|| SaslError::MalformedChallenge("missing iteration count".to_owned()))?
        .parse::<u32>()
        .map_err(|e| SaslError::MalformedChallenge(format!("invalid iteration count: {e}")))?;
    if iterations == 0 {
        return Err(SaslError::MalformedChallenge(
            "iteration count must be positive".to_owned(),
        ));
    }

    Ok(ServerFirst {
        nonce: nonce.clone(),
        salt,
        iterations,
    })
}

fn parse_attributes(message: &str) -> Result<HashMap<char, String>, SaslError> {
    let mut attributes = HashMap::new();

    for part in message.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| SaslError::MalformedChallenge(format!("bad attribute `{part}`")))?;
        let mut chars = key.chars();
        match (chars.next(), chars.next()) {
            (Some(name), None) if name.is_ascii_alphabetic() => {
                attributes.insert(name, value.to_owned());
            }
            _ => {
                return Err(SaslError::MalformedChallenge(format!(
                    "bad attribute name `{key}`"
                )))
            }
        }
    }

    Ok(attributes)
}

fn prepare(field: &str, value: &str) -> Result<String, SaslError> {
    if value.chars().any(char::is_control) {
        return Err(SaslError::Credential(format!(
            "{field} contains control characters"
        )));
    }
    Ok(value.to_owned())
}

// saslname: ',' and '=' must be escaped
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn generate_nonce() -> String {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut nonce_bytes);
    URL_SAFE_NO_PAD.encode(nonce_bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}
