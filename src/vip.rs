use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

// ---------------------------------------------------------------------------
// VIP tokens — short-lived, single-use, room-scoped grants
// ---------------------------------------------------------------------------

/// Fixed token lifetime.  Expiry is checked at consumption time; there is no
/// background sweep.
pub const TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// A grant issued by the out-of-band code-redemption flow.
#[derive(Debug, Clone)]
pub struct VipToken {
    pub room_name: String,
    pub issued_at: Instant,
}

impl VipToken {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.issued_at) > TOKEN_TTL
    }
}

/// Generate a token in the form `vt_` followed by 32 random hex characters.
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let mut hex = String::with_capacity(32);
    for _ in 0..16 {
        let byte: u8 = rng.gen();
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("vt_{}", hex)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory store of outstanding tokens, keyed by the opaque token string.
///
/// Tokens are consumed exactly once: a successful `consume` removes the
/// entry, and an expired entry is removed on the consumption attempt that
/// discovers it.  A room-mismatch attempt leaves the token intact.
#[derive(Default)]
pub struct VipTokenStore {
    inner: Mutex<HashMap<String, VipToken>>,
}

impl VipTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token scoped to `room_name`.
    pub fn issue(&self, room_name: &str) -> String {
        let token = generate_token();
        let mut tokens = self.inner.lock().expect("token store mutex poisoned");
        tokens.insert(
            token.clone(),
            VipToken {
                room_name: room_name.to_string(),
                issued_at: Instant::now(),
            },
        );
        debug!(room = %room_name, "vip token issued");
        token
    }

    /// Consume a token for `room_name`.  Returns `true` exactly once, and
    /// only while the token is unexpired and scoped to the given room.
    pub fn consume(&self, token: &str, room_name: &str) -> bool {
        self.consume_at(token, room_name, Instant::now())
    }

    fn consume_at(&self, token: &str, room_name: &str, now: Instant) -> bool {
        let mut tokens = self.inner.lock().expect("token store mutex poisoned");

        let Some(entry) = tokens.get(token) else {
            return false;
        };

        if entry.expired(now) {
            tokens.remove(token);
            debug!(room = %room_name, "vip token expired at consumption");
            return false;
        }

        // Wrong room: the grant is not spent.
        if entry.room_name != room_name {
            return false;
        }

        tokens.remove(token);
        debug!(room = %room_name, "vip token consumed");
        true
    }

    /// Number of outstanding tokens (expired entries included until touched).
    pub fn len(&self) -> usize {
        self.inner.lock().expect("token store mutex poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
