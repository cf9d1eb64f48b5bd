//! Session state: the random URL path, the single-use token, and the
//! pending-transfer gauge.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;

/// Cookie carrying the session token back from the first client.
pub const SESSION_COOKIE: &str = "qrsend";

const TOKEN_BYTES: usize = 40;
const URL_PATH_LEN: usize = 4;

/// Fatal: without a token no request can ever be authorized.
#[derive(Debug, Error)]
#[error("system randomness unavailable: {0}")]
pub struct RandomnessError(#[from] rand::Error);

/// Outcome of the authorization gate for one inbound request.
pub enum Authorization {
    /// This request won the first-contact race: stream the file and hand the
    /// token back as a cookie.
    FirstContact {
        token: String,
        permit: TransferPermit,
    },
    /// Cookie matched the established token.
    Accept { permit: TransferPermit },
    /// Non-browser probe before first contact: 200 with an empty body so
    /// link-preview crawlers learn nothing.
    SilentIgnore,
    /// Missing cookie, stale cookie, or a lost first-contact race. Same
    /// surface as an unknown route.
    NotFound,
}

const UNSET: u8 = 0;
const INITIALIZING: u8 = 1;
const SET: u8 = 2;

/// Exactly-once token storage. The unset -> set transition goes through an
/// intermediate "initializing" state: the compare-and-set admits a single
/// writer, so racing first requests observe a loss instead of both seeing an
/// empty token.
struct TokenSlot {
    state: AtomicU8,
    value: OnceLock<String>,
}

enum InitAttempt {
    Won(String),
    Lost,
}

impl TokenSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(UNSET),
            value: OnceLock::new(),
        }
    }

    fn get(&self) -> Option<&str> {
        if self.state.load(Ordering::Acquire) == SET {
            self.value.get().map(String::as_str)
        } else {
            None
        }
    }

    fn try_initialize<F>(&self, generate: F) -> Result<InitAttempt, RandomnessError>
    where
        F: FnOnce() -> Result<String, RandomnessError>,
    {
        if self
            .state
            .compare_exchange(UNSET, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(InitAttempt::Lost);
        }
        match generate() {
            Ok(token) => {
                let _ = self.value.set(token.clone());
                self.state.store(SET, Ordering::Release);
                Ok(InitAttempt::Won(token))
            }
            Err(err) => {
                // The session is about to shut down, but keep the slot in a
                // consistent state for anything still in flight.
                self.state.store(UNSET, Ordering::Release);
                Err(err)
            }
        }
    }
}

/// Counts in-flight transfers plus the phantom unit representing the
/// anticipated first client. Completion is observed by waiting for zero on a
/// watch channel, not by polling.
pub struct TransferGauge {
    count: watch::Sender<usize>,
    contact: watch::Sender<bool>,
}

impl TransferGauge {
    pub fn new() -> Self {
        // Pre-incremented by the phantom unit so the server cannot shut down
        // before any request ever lands.
        let (count, _) = watch::channel(1);
        let (contact, _) = watch::channel(false);
        Self { count, contact }
    }

    /// Register one accepted transfer. Called before streaming begins.
    pub fn acquire(&self) -> TransferPermit {
        self.count.send_modify(|n| *n += 1);
        self.contact.send_if_modified(|seen| {
            if *seen {
                false
            } else {
                *seen = true;
                true
            }
        });
        TransferPermit {
            count: self.count.clone(),
        }
    }

    /// Release the phantom unit. The idle watchdog calls this exactly once;
    /// no real request ever does.
    pub fn release_phantom(&self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn in_flight(&self) -> usize {
        *self.count.borrow()
    }

    /// Whether any request has ever been accepted.
    pub fn contacted(&self) -> bool {
        *self.contact.borrow()
    }

    /// Resolves once the first request is accepted.
    pub async fn first_contact(&self) {
        let mut rx = self.contact.subscribe();
        // wait_for errors only when the sender is dropped; the gauge outlives
        // every watchdog.
        let _ = rx.wait_for(|seen| *seen).await;
    }

    /// Resolves when every unit, phantom included, has been released.
    pub async fn idle(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for TransferGauge {
    fn default() -> Self {
        Self::new()
    }
}

/// One accepted transfer. Dropping the permit releases its unit, so every
/// exit path counts: completed stream, client disconnect, write error.
pub struct TransferPermit {
    count: watch::Sender<usize>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

type TokenGenerator = fn() -> Result<String, RandomnessError>;

/// A single transfer session: one URL path, one token, one consumer.
pub struct Session {
    url_path: String,
    token: TokenSlot,
    gauge: TransferGauge,
    generate: TokenGenerator,
}

impl Session {
    pub fn new() -> Self {
        Self::with_generator(generate_token)
    }

    fn with_generator(generate: TokenGenerator) -> Self {
        Self {
            url_path: random_url_path(),
            token: TokenSlot::new(),
            gauge: TransferGauge::new(),
            generate,
        }
    }

    /// A session whose token generation always fails, for exercising the
    /// fatal authorization path.
    #[cfg(test)]
    pub(crate) fn with_failing_generator() -> Self {
        Self::with_generator(|| {
            Err(RandomnessError::from(rand::Error::new(
                std::io::Error::new(std::io::ErrorKind::Other, "entropy exhausted"),
            )))
        })
    }

    /// The random path the file is served under. Immutable for the session.
    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    pub fn gauge(&self) -> &TransferGauge {
        &self.gauge
    }

    /// The authorization gate, evaluated per inbound request.
    ///
    /// Before first contact only a browser-looking request may initialize
    /// the token, and at most one of them wins. Afterwards the request must
    /// present the exact token as a cookie; anything else gets the opaque
    /// 404 treatment.
    pub fn authorize(
        &self,
        user_agent: Option<&str>,
        cookie: Option<&str>,
    ) -> Result<Authorization, RandomnessError> {
        if let Some(token) = self.token.get() {
            return Ok(match cookie {
                Some(value) if value == token => Authorization::Accept {
                    permit: self.gauge.acquire(),
                },
                _ => Authorization::NotFound,
            });
        }

        if !user_agent.unwrap_or("").starts_with("Mozilla") {
            return Ok(Authorization::SilentIgnore);
        }

        match self.token.try_initialize(self.generate)? {
            InitAttempt::Won(token) => Ok(Authorization::FirstContact {
                token,
                permit: self.gauge.acquire(),
            }),
            InitAttempt::Lost => Ok(Authorization::NotFound),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// 4 base-36 characters derived from the clock. Collision avoidance for the
/// URL, not a secret.
fn random_url_path() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let encoded = to_base36(nanos);
    let start = encoded.len().saturating_sub(URL_PATH_LEN);
    encoded[start..].to_string()
}

fn to_base36(mut n: u128) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 alphabet is ascii")
}

/// 40 bytes from the OS CSPRNG, standard base64.
fn generate_token() -> Result<String, RandomnessError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(BASE64.encode(bytes))
}
