//! SSH authentication protocol (RFC 4252).
//!
//! This module implements user authentication for SSH:
//! - "publickey" - an unsigned query, then a signed request once
//!   the server answers PK_OK
//! - "password" - including the server-initiated password change
//! - "none" - always refused by the server
//!
//! [`UserAuthClient`] runs the client side after the transport is up;
//! [`UserAuthServer`] runs the server side against an [`Authenticator`].
//!
//! # Security
//!
//! - **Constant-time password comparison** in [`StaticAuthenticator`]
//! - **Attempt cap and failure delay** on the server
//! - **Passwords zeroized** when requests are dropped
//!
//! # Example
//!
//! ```rust
//! use tidewire_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let auth = AuthRequest::new(
//!     "user",
//!     "ssh-connection",
//!     AuthMethod::Password("secret".to_string()),
//! );
//! let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
//! assert_eq!(parsed.user_name(), "user");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tidewire_platform::{TidewireError, TidewireResult};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use super::codec::{Reader, Writer};
use super::dispatcher::MessageHandler;
use super::hostkey::{parse_public_key, HostKey};
use super::message::{DisconnectReason, MessageType, USERAUTH_PASSWD_CHANGEREQ};
use super::transport::Transport;

/// Name of the authentication service.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service requested after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Default number of requests the server answers before disconnecting.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Default pause after each failed request.
pub const DEFAULT_FAILURE_DELAY: Duration = Duration::from_millis(100);

/// SSH authentication method.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication.
    None,
    /// Password authentication.
    Password(String),
    /// Password change answering PASSWD_CHANGEREQ.
    PasswordChange {
        /// Current password
        old: String,
        /// Replacement password
        new: String,
    },
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (absent when only asking whether the key is acceptable)
        signature: Option<Vec<u8>>,
    },
    /// A method this implementation does not know.
    Unsupported(String),
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) | AuthMethod::PasswordChange { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::Unsupported(name) => name,
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password([REDACTED])"),
            AuthMethod::PasswordChange { .. } => f.write_str("PasswordChange([REDACTED])"),
            AuthMethod::PublicKey {
                algorithm,
                signature,
                ..
            } => f
                .debug_struct("PublicKey")
                .field("algorithm", algorithm)
                .field("signed", &signature.is_some())
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        match self {
            AuthMethod::Password(password) => password.zeroize(),
            AuthMethod::PasswordChange { old, new } => {
                old.zeroize();
                new.zeroize();
            }
            _ => {}
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service to start after authentication.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::UserauthRequest);
        w.put_str(&self.user_name);
        w.put_str(&self.service_name);
        w.put_str(self.method.name());

        match &self.method {
            AuthMethod::None | AuthMethod::Unsupported(_) => {}
            AuthMethod::Password(password) => {
                w.put_bool(false);
                w.put_str(password);
            }
            AuthMethod::PasswordChange { old, new } => {
                w.put_bool(true);
                w.put_str(old);
                w.put_str(new);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                w.put_bool(signature.is_some());
                w.put_str(algorithm);
                w.put_string(public_key);
                if let Some(sig) = signature {
                    w.put_string(sig);
                }
            }
        }
        w.into_vec()
    }

    /// Parses a request. Unknown method names parse as
    /// [`AuthMethod::Unsupported`].
    ///
    /// # Errors
    ///
    /// Returns [`TidewireError::Protocol`] if the data is malformed.
    pub fn from_bytes(data: &[u8]) -> TidewireResult<Self> {
        let mut r = Reader::new(data);
        let msg_type = r.get_u8()?;
        if msg_type != MessageType::UserauthRequest as u8 {
            return Err(TidewireError::Protocol(format!(
                "Invalid message type: expected 50 (SSH_MSG_USERAUTH_REQUEST), got {}",
                msg_type
            )));
        }

        let user_name = r.get_utf8()?;
        let service_name = r.get_utf8()?;
        let method_name = r.get_utf8()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                if r.get_bool()? {
                    AuthMethod::PasswordChange {
                        old: r.get_utf8()?,
                        new: r.get_utf8()?,
                    }
                } else {
                    AuthMethod::Password(r.get_utf8()?)
                }
            }
            "publickey" => {
                let has_signature = r.get_bool()?;
                let algorithm = r.get_utf8()?;
                let public_key = r.get_string()?.to_vec();
                let signature = if has_signature {
                    Some(r.get_string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            _ => AuthMethod::Unsupported(method_name),
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure listing the methods that may continue.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Whether the request succeeded as one step of several.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::UserauthFailure);
        w.put_name_list(&self.methods_can_continue);
        w.put_bool(self.partial_success);
        w.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TidewireResult<Self> {
        let mut r = expect_type(data, MessageType::UserauthFailure)?;
        Ok(Self {
            methods_can_continue: r.get_name_list()?,
            partial_success: r.get_bool()?,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
    language_tag: String,
}

impl AuthBanner {
    /// Creates a banner without language tag.
    pub fn new(message: String) -> Self {
        Self {
            message,
            language_tag: String::new(),
        }
    }

    /// Banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::UserauthBanner);
        w.put_str(&self.message);
        w.put_str(&self.language_tag);
        w.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TidewireResult<Self> {
        let mut r = expect_type(data, MessageType::UserauthBanner)?;
        let message = r.get_utf8()?;
        let language_tag = if r.is_empty() {
            String::new()
        } else {
            r.get_utf8()?
        };
        Ok(Self {
            message,
            language_tag,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Echoes the algorithm and key of an unsigned query.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::UserauthPkOk);
        w.put_str(&self.algorithm);
        w.put_string(&self.public_key);
        w.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TidewireResult<Self> {
        let mut r = expect_type(data, MessageType::UserauthPkOk)?;
        Ok(Self {
            algorithm: r.get_utf8()?,
            public_key: r.get_string()?.to_vec(),
        })
    }
}

fn expect_type(data: &[u8], msg_type: MessageType) -> TidewireResult<Reader<'_>> {
    let mut r = Reader::new(data);
    let actual = r.get_u8()?;
    if actual != msg_type as u8 {
        return Err(TidewireError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            msg_type as u8,
            msg_type.name(),
            actual
        )));
    }
    Ok(r)
}

/// Builds the data signed in a publickey request.
///
/// # Format
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_string(session_id);
    w.put_u8(MessageType::UserauthRequest as u8);
    w.put_str(user_name);
    w.put_str(service_name);
    w.put_str("publickey");
    w.put_bool(true);
    w.put_str(algorithm);
    w.put_string(public_key_blob);
    w.into_vec()
}

/// Compares two passwords in constant time.
///
/// # Example
///
/// ```rust
/// use tidewire_proto::ssh::auth::constant_time_compare;
///
/// assert!(constant_time_compare("secret", "secret"));
/// assert!(!constant_time_compare("secret", "wrong"));
/// ```
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    // Hashing first makes the comparison independent of the lengths.
    let hash_a = Sha256::digest(a.as_bytes());
    let hash_b = Sha256::digest(b.as_bytes());
    hash_a.ct_eq(&hash_b).into()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Supplies passwords to [`UserAuthClient`].
pub trait PasswordProvider: Send + Sync {
    /// The password for `user`, or None to skip password authentication.
    fn password(&self, user: &str) -> Option<Zeroizing<String>>;

    /// Old and new password after the server demanded a change, or None to
    /// give up.
    fn change_password(
        &self,
        user: &str,
        prompt: &str,
    ) -> Option<(Zeroizing<String>, Zeroizing<String>)> {
        let _ = (user, prompt);
        None
    }
}

/// A fixed password, with an optional replacement for change requests.
#[derive(Clone)]
pub struct StaticPassword {
    password: Zeroizing<String>,
    replacement: Option<Zeroizing<String>>,
}

impl StaticPassword {
    /// Creates a provider answering with `password`.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
            replacement: None,
        }
    }

    /// Answers change requests with `new_password`.
    pub fn with_replacement(mut self, new_password: impl Into<String>) -> Self {
        self.replacement = Some(Zeroizing::new(new_password.into()));
        self
    }
}

impl fmt::Debug for StaticPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticPassword([REDACTED])")
    }
}

impl PasswordProvider for StaticPassword {
    fn password(&self, _user: &str) -> Option<Zeroizing<String>> {
        Some(self.password.clone())
    }

    fn change_password(
        &self,
        _user: &str,
        _prompt: &str,
    ) -> Option<(Zeroizing<String>, Zeroizing<String>)> {
        self.replacement
            .clone()
            .map(|new| (self.password.clone(), new))
    }
}

/// A method the client tries, in configuration order.
#[derive(Clone)]
pub enum ClientAuthMethod {
    /// Try each key in turn.
    PublicKey(Vec<Arc<dyn HostKey>>),
    /// Ask the provider for a password.
    Password(Arc<dyn PasswordProvider>),
}

impl ClientAuthMethod {
    /// Wire name of the method.
    pub fn name(&self) -> &'static str {
        match self {
            ClientAuthMethod::PublicKey(_) => "publickey",
            ClientAuthMethod::Password(_) => "password",
        }
    }
}

impl fmt::Debug for ClientAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientAuthMethod::PublicKey(keys) => {
                let names: Vec<&str> = keys.iter().map(|k| k.algorithm_name()).collect();
                f.debug_tuple("PublicKey").field(&names).finish()
            }
            ClientAuthMethod::Password(_) => f.write_str("Password"),
        }
    }
}

/// Records banners while authentication runs.
struct BannerHandler {
    banners: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl MessageHandler for BannerHandler {
    async fn handle(&self, _transport: &Transport, payload: &[u8]) -> TidewireResult<()> {
        let banner = AuthBanner::from_bytes(payload)?;
        info!(banner = %banner.message(), "Server banner");
        self.banners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(banner.message);
        Ok(())
    }
}

/// How one attempt ended.
enum Attempt {
    Success,
    /// Refused; carries the server's list of methods that can continue.
    Failure(Option<Vec<String>>),
}

/// Client side of `ssh-userauth`.
#[derive(Debug)]
pub struct UserAuthClient {
    user: String,
    service: String,
    methods: Vec<ClientAuthMethod>,
    banners: Arc<StdMutex<Vec<String>>>,
}

impl UserAuthClient {
    /// Creates a client for `user` with no methods configured.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            service: CONNECTION_SERVICE.to_string(),
            methods: Vec::new(),
            banners: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Adds a method; methods are tried in the order added.
    pub fn with_method(mut self, method: ClientAuthMethod) -> Self {
        self.methods.push(method);
        self
    }

    /// Banners the server sent during authentication.
    pub fn banners(&self) -> Vec<String> {
        self.banners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Requests `ssh-userauth` and tries the configured methods in order.
    ///
    /// # Errors
    ///
    /// [`TidewireError::Authentication`] once every method is exhausted.
    pub async fn authenticate(&self, transport: &Transport) -> TidewireResult<()> {
        // Banners may follow SERVICE_ACCEPT immediately.
        transport.register_handlers(
            USERAUTH_SERVICE,
            &[MessageType::UserauthBanner as u8],
            Arc::new(BannerHandler {
                banners: self.banners.clone(),
            }),
        )?;
        let result = match transport.request_service(USERAUTH_SERVICE).await {
            Ok(()) => self.run(transport).await,
            Err(e) => Err(e),
        };
        transport.unregister_handlers(USERAUTH_SERVICE);
        result
    }

    async fn run(&self, transport: &Transport) -> TidewireResult<()> {
        let session_id = transport.session_id().ok_or_else(|| {
            TidewireError::Protocol("Authentication before key exchange".to_string())
        })?;
        let mut can_continue: Vec<String> =
            self.methods.iter().map(|m| m.name().to_string()).collect();

        for method in &self.methods {
            if !can_continue.iter().any(|m| m == method.name()) {
                debug!(method = method.name(), "Server no longer allows method");
                continue;
            }
            debug!(user = %self.user, method = method.name(), "Trying authentication method");

            let outcome = match method {
                ClientAuthMethod::PublicKey(keys) => {
                    self.try_public_keys(transport, &session_id, keys, &mut can_continue)
                        .await?
                }
                ClientAuthMethod::Password(provider) => {
                    self.try_password(transport, provider.as_ref()).await?
                }
            };
            match outcome {
                Attempt::Success => {
                    info!(user = %self.user, method = method.name(), "Authenticated");
                    return Ok(());
                }
                Attempt::Failure(Some(methods)) => can_continue = methods,
                Attempt::Failure(None) => {}
            }
            debug!(method = method.name(), "Authentication method failed");
        }

        Err(TidewireError::Authentication(format!(
            "No authentication method succeeded for {}",
            self.user
        )))
    }

    async fn try_public_keys(
        &self,
        transport: &Transport,
        session_id: &[u8],
        keys: &[Arc<dyn HostKey>],
        can_continue: &mut Vec<String>,
    ) -> TidewireResult<Attempt> {
        for key in keys {
            if !can_continue.iter().any(|m| m == "publickey") {
                break;
            }
            let algorithm = key.algorithm_name();
            let blob = key.public_key_bytes();

            let waiter = transport.expect(&[
                MessageType::UserauthPkOk as u8,
                MessageType::UserauthFailure as u8,
            ])?;
            let query = AuthRequest::new(
                &self.user,
                &self.service,
                AuthMethod::PublicKey {
                    algorithm: algorithm.to_string(),
                    public_key: blob.clone(),
                    signature: None,
                },
            );
            transport.send(&query.to_bytes()).await?;
            let reply = waiter.recv().await?;

            if reply.first() == Some(&(MessageType::UserauthFailure as u8)) {
                debug!(algorithm, "Server does not accept this key");
                *can_continue = AuthFailure::from_bytes(&reply)?.methods_can_continue;
                continue;
            }
            let ok = AuthPkOk::from_bytes(&reply)?;
            if ok.algorithm() != algorithm || ok.public_key() != blob.as_slice() {
                return Err(TidewireError::Protocol(
                    "PK_OK does not match the queried key".to_string(),
                ));
            }

            let data =
                construct_signature_data(session_id, &self.user, &self.service, algorithm, &blob);
            let signature = key.sign(&data)?;
            let waiter = transport.expect(&[
                MessageType::UserauthSuccess as u8,
                MessageType::UserauthFailure as u8,
            ])?;
            let request = AuthRequest::new(
                &self.user,
                &self.service,
                AuthMethod::PublicKey {
                    algorithm: algorithm.to_string(),
                    public_key: blob,
                    signature: Some(signature),
                },
            );
            transport.send(&request.to_bytes()).await?;
            let reply = waiter.recv().await?;
            if reply.first() == Some(&(MessageType::UserauthSuccess as u8)) {
                return Ok(Attempt::Success);
            }
            *can_continue = AuthFailure::from_bytes(&reply)?.methods_can_continue;
        }
        Ok(Attempt::Failure(Some(can_continue.clone())))
    }

    async fn try_password(
        &self,
        transport: &Transport,
        provider: &dyn PasswordProvider,
    ) -> TidewireResult<Attempt> {
        let Some(password) = provider.password(&self.user) else {
            return Ok(Attempt::Failure(None));
        };
        let mut method = AuthMethod::Password(password.to_string());

        loop {
            let waiter = transport.expect(&[
                MessageType::UserauthSuccess as u8,
                MessageType::UserauthFailure as u8,
                USERAUTH_PASSWD_CHANGEREQ,
            ])?;
            let request = AuthRequest::new(&self.user, &self.service, method);
            transport.send(&request.to_bytes()).await?;
            let reply = waiter.recv().await?;

            match reply.first().copied() {
                Some(t) if t == MessageType::UserauthSuccess as u8 => return Ok(Attempt::Success),
                Some(t) if t == MessageType::UserauthFailure as u8 => {
                    let failure = AuthFailure::from_bytes(&reply)?;
                    return Ok(Attempt::Failure(Some(failure.methods_can_continue)));
                }
                _ => {
                    let mut r = Reader::new(&reply);
                    r.get_u8()?;
                    let prompt = r.get_utf8()?;
                    info!(prompt = %prompt, "Server requests a password change");
                    let Some((old, new)) = provider.change_password(&self.user, &prompt) else {
                        return Ok(Attempt::Failure(None));
                    };
                    method = AuthMethod::PasswordChange {
                        old: old.to_string(),
                        new: new.to_string(),
                    };
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Decides whether credentials are valid.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// True if `password` is valid for `user`.
    async fn authenticate_password(&self, service: &str, user: &str, password: &str) -> bool;

    /// True if `key` may authenticate `user`. The signature has not been
    /// checked yet when this is called.
    async fn authenticate_public_key(&self, service: &str, user: &str, key: &dyn HostKey) -> bool;
}

/// In-memory users with passwords and authorized public keys.
#[derive(Default)]
pub struct StaticAuthenticator {
    passwords: HashMap<String, Zeroizing<String>>,
    public_keys: HashMap<String, Vec<Vec<u8>>>,
}

impl fmt::Debug for StaticAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut users: Vec<&String> = self
            .passwords
            .keys()
            .chain(self.public_keys.keys())
            .collect();
        users.sort();
        users.dedup();
        f.debug_struct("StaticAuthenticator")
            .field("users", &users)
            .finish()
    }
}

impl StaticAuthenticator {
    /// Creates an authenticator with no users.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the password of `user`.
    pub fn with_password(mut self, user: &str, password: &str) -> Self {
        self.passwords
            .insert(user.to_string(), Zeroizing::new(password.to_string()));
        self
    }

    /// Authorizes `key` for `user`.
    pub fn with_public_key(self, user: &str, key: &dyn HostKey) -> Self {
        self.with_public_key_blob(user, key.public_key_bytes())
    }

    /// Authorizes a public key blob for `user`.
    pub fn with_public_key_blob(mut self, user: &str, blob: Vec<u8>) -> Self {
        self.public_keys.entry(user.to_string()).or_default().push(blob);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate_password(&self, _service: &str, user: &str, password: &str) -> bool {
        match self.passwords.get(user) {
            Some(expected) => constant_time_compare(expected, password),
            // Compare anyway so unknown users take as long as known ones.
            None => {
                let _ = constant_time_compare("", password);
                false
            }
        }
    }

    async fn authenticate_public_key(&self, _service: &str, user: &str, key: &dyn HostKey) -> bool {
        let blob = key.public_key_bytes();
        self.public_keys
            .get(user)
            .is_some_and(|keys| keys.iter().any(|k| k == &blob))
    }
}

/// Forwards USERAUTH_REQUEST payloads to the server loop.
struct RequestQueue {
    tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

#[async_trait]
impl MessageHandler for RequestQueue {
    async fn handle(&self, _transport: &Transport, payload: &[u8]) -> TidewireResult<()> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(tx) = tx {
            let _ = tx.send(payload.to_vec());
        }
        Ok(())
    }

    async fn on_transport_closed(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Unsigned publickey requests answered before disconnecting. They do
/// not count against the attempt limit.
pub const MAX_KEY_QUERIES: u32 = 64;

/// Result of checking one request.
enum Verdict {
    Accept,
    Reject,
    PkOk(AuthPkOk),
}

/// Server side of `ssh-userauth`.
pub struct UserAuthServer {
    authenticator: Arc<dyn Authenticator>,
    methods: Vec<String>,
    max_attempts: u32,
    failure_delay: Duration,
    banner: Option<String>,
}

impl fmt::Debug for UserAuthServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAuthServer")
            .field("methods", &self.methods)
            .field("max_attempts", &self.max_attempts)
            .field("failure_delay", &self.failure_delay)
            .finish_non_exhaustive()
    }
}

impl UserAuthServer {
    /// Creates a server offering `publickey` and `password`.
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            methods: vec!["publickey".to_string(), "password".to_string()],
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            failure_delay: DEFAULT_FAILURE_DELAY,
            banner: None,
        }
    }

    /// Restricts the offered methods.
    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Sets the number of requests answered before disconnecting.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the pause after each failed request.
    pub fn with_failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay = delay;
        self
    }

    /// Sends `banner` before the first request is answered.
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    /// Runs authentication and returns the authenticated user name.
    pub async fn authenticate(&self, transport: &Transport) -> TidewireResult<String> {
        self.authenticate_then(transport, |_| Ok(())).await
    }

    /// Like [`UserAuthServer::authenticate`], calling `before_success` with
    /// the user name right before USERAUTH_SUCCESS is sent.
    ///
    /// Register the handlers of the next service there, so messages the
    /// client sends right after SUCCESS find them.
    ///
    /// # Errors
    ///
    /// Disconnects with NO_MORE_AUTH_METHODS_AVAILABLE after `max_attempts`
    /// failed requests, or after [`MAX_KEY_QUERIES`] unsigned publickey
    /// requests.
    pub async fn authenticate_then<F>(
        &self,
        transport: &Transport,
        before_success: F,
    ) -> TidewireResult<String>
    where
        F: FnOnce(&str) -> TidewireResult<()>,
    {
        let (tx, mut requests) = mpsc::unbounded_channel();
        transport.register_handlers(
            USERAUTH_SERVICE,
            &[MessageType::UserauthRequest as u8],
            Arc::new(RequestQueue {
                tx: StdMutex::new(Some(tx)),
            }),
        )?;
        let result = self.serve(transport, &mut requests, before_success).await;
        transport.unregister_handlers(USERAUTH_SERVICE);
        result
    }

    async fn serve<F>(
        &self,
        transport: &Transport,
        requests: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        before_success: F,
    ) -> TidewireResult<String>
    where
        F: FnOnce(&str) -> TidewireResult<()>,
    {
        transport.accept_service(&[USERAUTH_SERVICE]).await?;
        if let Some(banner) = &self.banner {
            transport
                .send(&AuthBanner::new(banner.clone()).to_bytes())
                .await?;
        }
        let session_id = transport.session_id().unwrap_or_default();

        let mut failures = 0;
        let mut queries = 0;
        while failures < self.max_attempts && queries < MAX_KEY_QUERIES {
            let Some(payload) = requests.recv().await else {
                return Err(TidewireError::ConnectionLost(
                    "Connection closed during authentication".to_string(),
                ));
            };
            let request = match AuthRequest::from_bytes(&payload) {
                Ok(request) => request,
                Err(e) => {
                    return Err(transport
                        .send_disconnect(DisconnectReason::ProtocolError, &e.to_string())
                        .await)
                }
            };

            let query = matches!(
                request.method(),
                AuthMethod::PublicKey {
                    signature: None,
                    ..
                }
            );
            match self.check(&session_id, &request).await {
                Verdict::Accept => {
                    info!(
                        user = %request.user_name(),
                        method = request.method().name(),
                        "User authenticated"
                    );
                    before_success(request.user_name())?;
                    transport.send(&[MessageType::UserauthSuccess as u8]).await?;
                    return Ok(request.user_name().to_string());
                }
                Verdict::PkOk(ok) => {
                    queries += 1;
                    debug!(user = %request.user_name(), "Public key acceptable");
                    transport.send(&ok.to_bytes()).await?;
                }
                Verdict::Reject if query => {
                    queries += 1;
                    debug!(user = %request.user_name(), "Public key not acceptable");
                    tokio::time::sleep(self.failure_delay).await;
                    transport
                        .send(&AuthFailure::new(self.methods.clone(), false).to_bytes())
                        .await?;
                }
                Verdict::Reject => {
                    failures += 1;
                    warn!(
                        user = %request.user_name(),
                        method = request.method().name(),
                        attempt = failures,
                        "Authentication failed"
                    );
                    tokio::time::sleep(self.failure_delay).await;
                    transport
                        .send(&AuthFailure::new(self.methods.clone(), false).to_bytes())
                        .await?;
                }
            }
        }

        Err(transport
            .send_disconnect(
                DisconnectReason::NoMoreAuthMethodsAvailable,
                "Too many authentication failures",
            )
            .await)
    }

    async fn check(&self, session_id: &[u8], request: &AuthRequest) -> Verdict {
        let service = request.service_name();
        let user = request.user_name();
        let offered = self.methods.iter().any(|m| m == request.method().name());
        if service != CONNECTION_SERVICE || !offered {
            return Verdict::Reject;
        }

        match request.method() {
            AuthMethod::Password(password) => {
                if self.authenticator.authenticate_password(service, user, password).await {
                    Verdict::Accept
                } else {
                    Verdict::Reject
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                let key = match parse_public_key(public_key) {
                    Ok(key) if key.algorithm_name() == algorithm.as_str() => key,
                    _ => return Verdict::Reject,
                };
                if !self
                    .authenticator
                    .authenticate_public_key(service, user, key.as_ref())
                    .await
                {
                    return Verdict::Reject;
                }
                match signature {
                    None => Verdict::PkOk(AuthPkOk::new(algorithm.clone(), public_key.clone())),
                    Some(signature) => {
                        let data = construct_signature_data(
                            session_id, user, service, algorithm, public_key,
                        );
                        if key.verify(&data, signature) {
                            Verdict::Accept
                        } else {
                            Verdict::Reject
                        }
                    }
                }
            }
            AuthMethod::None
            | AuthMethod::PasswordChange { .. }
            | AuthMethod::Unsupported(_) => Verdict::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{test_keys, Ed25519HostKey};
    use crate::ssh::transport::test_support::{pair, LIMIT};
    use tokio::time::timeout;

    fn fast(server: UserAuthServer) -> UserAuthServer {
        server.with_failure_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_auth_request_password() {
        let auth = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::Password("secret".to_string()),
        );
        let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
        assert_eq!(parsed, auth);
        assert_eq!(parsed.method().name(), "password");
        assert_eq!(format!("{:?}", parsed.method()), "Password([REDACTED])");
    }

    #[test]
    fn test_auth_request_password_change() {
        let auth = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::PasswordChange {
                old: "a".to_string(),
                new: "b".to_string(),
            },
        );
        assert_eq!(AuthRequest::from_bytes(&auth.to_bytes()).unwrap(), auth);
    }

    #[test]
    fn test_auth_request_publickey() {
        let auth = AuthRequest::new(
            "bob",
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3, 4],
                signature: Some(vec![9, 9]),
            },
        );
        assert_eq!(AuthRequest::from_bytes(&auth.to_bytes()).unwrap(), auth);
    }

    #[test]
    fn test_auth_request_unknown_method() {
        let auth = AuthRequest::new(
            "carol",
            "ssh-connection",
            AuthMethod::Unsupported("keyboard-interactive".to_string()),
        );
        let parsed = AuthRequest::from_bytes(&auth.to_bytes()).unwrap();
        assert_eq!(parsed.method().name(), "keyboard-interactive");
        assert!(AuthRequest::from_bytes(&[51, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_auth_failure() {
        let failure =
            AuthFailure::new(vec!["publickey".to_string(), "password".to_string()], false);
        let bytes = failure.to_bytes();
        let mut r = Reader::new(&bytes[1..]);
        assert_eq!(r.get_utf8().unwrap(), "publickey,password");
        assert_eq!(AuthFailure::from_bytes(&bytes).unwrap(), failure);
    }

    #[test]
    fn test_banner_without_language_tag() {
        let mut w = Writer::message(MessageType::UserauthBanner);
        w.put_str("welcome");
        assert_eq!(AuthBanner::from_bytes(w.as_slice()).unwrap().message(), "welcome");
    }

    #[test]
    fn test_signature_data_layout() {
        let data = construct_signature_data(b"sid", "u", "ssh-connection", "ssh-ed25519", b"blob");
        let mut r = Reader::new(&data);
        assert_eq!(r.get_string().unwrap(), b"sid");
        assert_eq!(r.get_u8().unwrap(), 50);
        assert_eq!(r.get_utf8().unwrap(), "u");
        assert_eq!(r.get_utf8().unwrap(), "ssh-connection");
        assert_eq!(r.get_utf8().unwrap(), "publickey");
        assert!(r.get_bool().unwrap());
        assert_eq!(r.get_utf8().unwrap(), "ssh-ed25519");
        assert_eq!(r.get_string().unwrap(), b"blob");
        assert!(r.is_empty());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("password123", "password123"));
        assert!(!constant_time_compare("password123", "password124"));
        assert!(!constant_time_compare("short", "much longer"));
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let key = Ed25519HostKey::generate().unwrap();
        let other = Ed25519HostKey::generate().unwrap();
        let auth = StaticAuthenticator::new()
            .with_password("alice", "pw")
            .with_public_key("alice", &key);
        assert!(auth.authenticate_password("ssh-connection", "alice", "pw").await);
        assert!(!auth.authenticate_password("ssh-connection", "alice", "nope").await);
        assert!(!auth.authenticate_password("ssh-connection", "mallory", "pw").await);
        assert!(auth.authenticate_public_key("ssh-connection", "alice", &key).await);
        assert!(!auth.authenticate_public_key("ssh-connection", "alice", &other).await);
    }

    #[tokio::test]
    async fn test_public_key_authentication() {
        let (client, server) = pair().await;
        let key: Arc<dyn HostKey> = Arc::new(test_keys::rsa());
        let authenticator = StaticAuthenticator::new().with_public_key("alice", key.as_ref());
        let server_task = tokio::spawn(async move {
            fast(UserAuthServer::new(Arc::new(authenticator)))
                .with_banner("authorized use only")
                .authenticate(&server)
                .await
        });

        let auth = UserAuthClient::new("alice").with_method(ClientAuthMethod::PublicKey(vec![key]));
        timeout(LIMIT, auth.authenticate(&client)).await.unwrap().unwrap();
        assert_eq!(server_task.await.unwrap().unwrap(), "alice");
        assert_eq!(auth.banners(), vec!["authorized use only".to_string()]);
    }

    #[tokio::test]
    async fn test_falls_back_to_password() {
        let (client, server) = pair().await;
        let unknown: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let authenticator = StaticAuthenticator::new().with_password("bob", "hunter2");
        let server_task = tokio::spawn(async move {
            fast(UserAuthServer::new(Arc::new(authenticator)))
                .authenticate(&server)
                .await
        });

        let auth = UserAuthClient::new("bob")
            .with_method(ClientAuthMethod::PublicKey(vec![unknown]))
            .with_method(ClientAuthMethod::Password(Arc::new(StaticPassword::new("hunter2"))));
        timeout(LIMIT, auth.authenticate(&client)).await.unwrap().unwrap();
        assert_eq!(server_task.await.unwrap().unwrap(), "bob");
    }

    #[tokio::test]
    async fn test_methods_dropped_when_not_listed() {
        let (client, server) = pair().await;
        let authenticator = StaticAuthenticator::new().with_password("bob", "hunter2");
        let server_task = tokio::spawn(async move {
            fast(UserAuthServer::new(Arc::new(authenticator)))
                .with_methods(&["publickey"])
                .authenticate(&server)
                .await
        });

        // After the first failure only publickey may continue, so the second
        // password method is never tried.
        let key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let auth = UserAuthClient::new("bob")
            .with_method(ClientAuthMethod::Password(Arc::new(StaticPassword::new("hunter2"))))
            .with_method(ClientAuthMethod::Password(Arc::new(StaticPassword::new("again"))))
            .with_method(ClientAuthMethod::PublicKey(vec![key]));
        let err = timeout(LIMIT, auth.authenticate(&client)).await.unwrap().unwrap_err();
        assert!(matches!(err, TidewireError::Authentication(_)));
        client.disconnect().await;
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_attempt_cap_disconnects() {
        let (client, server) = pair().await;
        let server_task = tokio::spawn(async move {
            fast(UserAuthServer::new(Arc::new(StaticAuthenticator::new())))
                .with_max_attempts(3)
                .authenticate(&server)
                .await
        });

        client.request_service(USERAUTH_SERVICE).await.unwrap();
        for _ in 0..3 {
            let request = AuthRequest::new(
                "eve",
                CONNECTION_SERVICE,
                AuthMethod::Password("guess".to_string()),
            );
            client.send(&request.to_bytes()).await.unwrap();
        }

        let err = timeout(LIMIT, server_task).await.unwrap().unwrap().unwrap_err();
        assert_eq!(
            err.disconnect_reason(),
            Some(DisconnectReason::NoMoreAuthMethodsAvailable.code())
        );
        let closed = timeout(LIMIT, client.closed()).await.unwrap();
        assert_eq!(closed.disconnect_reason(), Some(14));
    }

    #[tokio::test]
    async fn test_key_queries_do_not_use_attempts() {
        let (client, server) = pair().await;
        let trusted: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        let authenticator = StaticAuthenticator::new().with_public_key("carol", trusted.as_ref());
        let server_task = tokio::spawn(async move {
            fast(UserAuthServer::new(Arc::new(authenticator)))
                .with_max_attempts(1)
                .authenticate(&server)
                .await
        });

        let mut keys: Vec<Arc<dyn HostKey>> = (0..3)
            .map(|_| Arc::new(Ed25519HostKey::generate().unwrap()) as Arc<dyn HostKey>)
            .collect();
        keys.push(trusted);
        let auth = UserAuthClient::new("carol").with_method(ClientAuthMethod::PublicKey(keys));
        timeout(LIMIT, auth.authenticate(&client)).await.unwrap().unwrap();
        assert_eq!(server_task.await.unwrap().unwrap(), "carol");
    }

    #[tokio::test]
    async fn test_none_and_wrong_service_rejected() {
        let (client, server) = pair().await;
        let server_task = tokio::spawn(async move {
            fast(UserAuthServer::new(Arc::new(
                StaticAuthenticator::new().with_password("u", "p"),
            )))
            .authenticate(&server)
            .await
        });
        client.request_service(USERAUTH_SERVICE).await.unwrap();

        for request in [
            AuthRequest::new("u", CONNECTION_SERVICE, AuthMethod::None),
            AuthRequest::new("u", "ssh-bogus", AuthMethod::Password("p".to_string())),
        ] {
            let waiter = client.expect(&[MessageType::UserauthFailure as u8]).unwrap();
            client.send(&request.to_bytes()).await.unwrap();
            let failure = AuthFailure::from_bytes(&waiter.recv().await.unwrap()).unwrap();
            assert_eq!(failure.methods_can_continue(), ["publickey", "password"]);
        }

        let waiter = client.expect(&[MessageType::UserauthSuccess as u8]).unwrap();
        let request =
            AuthRequest::new("u", CONNECTION_SERVICE, AuthMethod::Password("p".to_string()));
        client.send(&request.to_bytes()).await.unwrap();
        waiter.recv().await.unwrap();
        assert_eq!(server_task.await.unwrap().unwrap(), "u");
    }

    #[tokio::test]
    async fn test_password_change_request() {
        let (client, server) = pair().await;
        // A hand-driven server that demands a password change.
        let server_task = tokio::spawn(async move {
            let waiter = server.expect(&[MessageType::UserauthRequest as u8]).unwrap();
            server.accept_service(&[USERAUTH_SERVICE]).await.unwrap();
            let first = AuthRequest::from_bytes(&waiter.recv().await.unwrap()).unwrap();
            assert_eq!(first.method(), &AuthMethod::Password("old".to_string()));

            let waiter = server.expect(&[MessageType::UserauthRequest as u8]).unwrap();
            let mut w = Writer::new();
            w.put_u8(USERAUTH_PASSWD_CHANGEREQ);
            w.put_str("Password expired");
            w.put_str("");
            server.send(w.as_slice()).await.unwrap();

            let second = AuthRequest::from_bytes(&waiter.recv().await.unwrap()).unwrap();
            server.send(&[MessageType::UserauthSuccess as u8]).await.unwrap();
            second
        });

        let provider = StaticPassword::new("old").with_replacement("new");
        let auth =
            UserAuthClient::new("dave").with_method(ClientAuthMethod::Password(Arc::new(provider)));
        timeout(LIMIT, auth.authenticate(&client)).await.unwrap().unwrap();

        let second = server_task.await.unwrap();
        assert_eq!(
            second.method(),
            &AuthMethod::PasswordChange {
                old: "old".to_string(),
                new: "new".to_string(),
            }
        );
    }
}
