// src/directory.rs
//
// The Room Directory: durable registry of claimed room names.
//
// A claim attaches a password / privacy configuration to a room name, making
// it persistently owned.  The directory also carries each room's VIP
// configuration (roster + redeemable codes) and the live metadata shown in
// room listings.
//
// Persistence contract: every mutating operation serializes the full
// registry through the configured `RegistryStore` while holding the
// directory mutex, so writes never interleave.  If the write fails the
// in-memory mutation is rolled back and the operation reports failure —
// memory and disk never diverge from the caller's perspective.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{DirectoryError, StoreError};
use crate::store::{RegistrySnapshot, RegistryStore};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Upper bound on a normalized room name.
pub const NAME_MAX_LEN: usize = 64;

/// VIP code alphabet: uppercase alphanumerics minus the visually ambiguous
/// glyphs (I, L, O, 0, 1).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Generated VIP code length.
const CODE_LEN: usize = 8;

/// Collision retries before giving up on code generation.  With a 31^8 code
/// space this is practically unreachable.
const CODE_MAX_ATTEMPTS: usize = 32;

// ─── Records ────────────────────────────────────────────────────────────────

/// Room visibility tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Private,
}

/// A redeemable VIP code.  `max_uses == None` means multi-use: redemptions
/// are counted but never exhaust the code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VipCode {
    pub max_uses: Option<u32>,
    pub uses_left: Option<u32>,
    #[serde(default)]
    pub used: u32,
}

impl VipCode {
    pub fn multi_use(&self) -> bool {
        self.max_uses.is_none()
    }
}

/// A claimed room, as persisted.
///
/// Mutated only through `RoomDirectory` operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub name: String,
    pub owner_password_hash: Option<String>,
    pub privacy: Privacy,
    /// Only meaningful when `privacy == Private`.
    #[serde(default)]
    pub vip_required: bool,
    #[serde(default)]
    pub vip_roster: Vec<String>,
    #[serde(default)]
    pub vip_codes: HashMap<String, VipCode>,
    /// Set via the payment collaborator boundary; marks the record as
    /// non-reclaimable.
    #[serde(default)]
    pub purchased: bool,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub viewer_count: u64,
    #[serde(default)]
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl RoomRecord {
    pub fn new(name: String, owner_password_hash: Option<String>, privacy: Privacy) -> Self {
        Self {
            name,
            owner_password_hash,
            privacy,
            vip_required: false,
            vip_roster: Vec::new(),
            vip_codes: HashMap::new(),
            purchased: false,
            live: false,
            viewer_count: 0,
            title: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Case-insensitive roster membership.
    pub fn roster_contains(&self, display_name: &str) -> bool {
        self.vip_roster
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(display_name))
    }
}

/// Result of `generate_vip_code`.
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    pub code: String,
    pub max_uses: Option<u32>,
    pub uses_left: Option<u32>,
}

/// Result of `redeem_code`.
#[derive(Debug, Clone)]
pub struct Redemption {
    pub room_name: String,
    pub uses_left: Option<u32>,
    pub used: u32,
}

// ─── Name normalization ─────────────────────────────────────────────────────

/// Normalize a raw room name: trim surrounding whitespace and lowercase.
///
/// Fails `INVALID_NAME` when the result is empty or exceeds the length
/// bound.
pub fn normalize_name(raw: &str) -> Result<String, DirectoryError> {
    let name = raw.trim().to_lowercase();
    if name.is_empty() || name.len() > NAME_MAX_LEN {
        return Err(DirectoryError::InvalidName);
    }
    Ok(name)
}

// ─── Password hashing ───────────────────────────────────────────────────────

fn hash_password(password: &str) -> Result<String, DirectoryError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| DirectoryError::Hash(e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

// ─── RoomDirectory ──────────────────────────────────────────────────────────

/// Registry of claimed rooms, backed by a [`RegistryStore`].
pub struct RoomDirectory {
    rooms: Mutex<RegistrySnapshot>,
    store: Arc<dyn RegistryStore>,
}

impl RoomDirectory {
    /// Load the registry from the store.
    pub async fn open(store: Arc<dyn RegistryStore>) -> Result<Self, StoreError> {
        let rooms = store.load().await?;
        if !rooms.is_empty() {
            info!("room registry loaded: {} claimed room(s)", rooms.len());
        }
        Ok(Self {
            rooms: Mutex::new(rooms),
            store,
        })
    }

    /// Snapshot of a single record.
    pub async fn get(&self, name: &str) -> Option<RoomRecord> {
        self.rooms.lock().await.get(name).cloned()
    }

    /// Number of claimed rooms.
    pub async fn len(&self) -> usize {
        self.rooms.lock().await.len()
    }

    // ── Claim / authenticate ────────────────────────────────────────────

    /// Claim a room name.  Fails `ALREADY_EXISTS` when a record exists,
    /// `INVALID_NAME` when the name fails normalization.
    pub async fn create_room(
        &self,
        raw_name: &str,
        password: Option<&str>,
        privacy: Privacy,
    ) -> Result<RoomRecord, DirectoryError> {
        let name = normalize_name(raw_name)?;

        // Hash outside the registry lock; argon2 is deliberately slow.
        let password_hash = match password.filter(|p| !p.is_empty()) {
            Some(p) => Some(hash_password(p)?),
            None => None,
        };

        let mut rooms = self.rooms.lock().await;
        if rooms.contains_key(&name) {
            return Err(DirectoryError::AlreadyExists);
        }

        let record = RoomRecord::new(name.clone(), password_hash, privacy);
        rooms.insert(name.clone(), record.clone());
        self.persist_or_rollback(&mut rooms, &name, None).await?;

        info!(room = %name, privacy = ?privacy, "room claimed");
        Ok(record)
    }

    /// Check a password against a claimed room.  A record with no password
    /// set authenticates any caller.
    pub async fn authenticate(&self, name: &str, password: &str) -> Result<(), DirectoryError> {
        let rooms = self.rooms.lock().await;
        let record = rooms.get(name).ok_or(DirectoryError::NotFound)?;

        match &record.owner_password_hash {
            None => Ok(()),
            Some(hash) if verify_password(password, hash) => Ok(()),
            Some(_) => Err(DirectoryError::InvalidPassword),
        }
    }

    // ── Privacy / VIP configuration ─────────────────────────────────────

    pub async fn update_privacy(&self, name: &str, privacy: Privacy) -> Result<(), DirectoryError> {
        self.mutate(name, |record| {
            record.privacy = privacy;
            // VIP gating requires privacy=private; enabling it on a public
            // room is normalized away.
            if privacy == Privacy::Public {
                record.vip_required = false;
            }
        })
        .await
    }

    /// Set the VIP-required flag.  Returns the effective value: silently
    /// normalized back to `false` when the room is not private.
    pub async fn update_vip_required(
        &self,
        name: &str,
        vip_required: bool,
    ) -> Result<bool, DirectoryError> {
        let mut effective = false;
        self.mutate(name, |record| {
            effective = vip_required && record.privacy == Privacy::Private;
            record.vip_required = effective;
        })
        .await?;
        Ok(effective)
    }

    /// Add a display name to the VIP roster.  Idempotent, case-insensitive.
    pub async fn add_vip_user(&self, name: &str, display_name: &str) -> Result<(), DirectoryError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(DirectoryError::InvalidName);
        }
        self.mutate(name, |record| {
            if !record.roster_contains(display_name) {
                record.vip_roster.push(display_name.to_string());
            }
        })
        .await
    }

    // ── VIP codes ───────────────────────────────────────────────────────

    /// Mint a fresh VIP code for a room.  `max_uses <= 0` or absent means
    /// multi-use.  The code is unique across every room in the registry so
    /// that redemption by code alone is unambiguous.
    pub async fn generate_vip_code(
        &self,
        name: &str,
        max_uses: Option<i64>,
    ) -> Result<GeneratedCode, DirectoryError> {
        let finite = max_uses.filter(|&n| n > 0).map(|n| n as u32);

        let mut rooms = self.rooms.lock().await;
        if !rooms.contains_key(name) {
            return Err(DirectoryError::NotFound);
        }

        let mut code = None;
        for _ in 0..CODE_MAX_ATTEMPTS {
            let candidate = random_code();
            let taken = rooms.values().any(|r| r.vip_codes.contains_key(&candidate));
            if !taken {
                code = Some(candidate);
                break;
            }
        }
        let code = code.ok_or(DirectoryError::CodeSpaceExhausted)?;

        let prior = rooms.get(name).cloned();
        let record = rooms.get_mut(name).ok_or(DirectoryError::NotFound)?;
        record.vip_codes.insert(
            code.clone(),
            VipCode {
                max_uses: finite,
                uses_left: finite,
                used: 0,
            },
        );
        self.persist_or_rollback(&mut rooms, name, prior).await?;

        info!(room = %name, max_uses = ?finite, "vip code generated");
        Ok(GeneratedCode {
            code,
            max_uses: finite,
            uses_left: finite,
        })
    }

    /// Remove a code.  Once revoked it redeems like any unknown code
    /// (`INVALID_OR_EXHAUSTED`); revoking a code that does not exist fails
    /// `NOT_FOUND`.
    pub async fn revoke_vip_code(&self, name: &str, code: &str) -> Result<(), DirectoryError> {
        let mut rooms = self.rooms.lock().await;
        let prior = rooms.get(name).cloned();
        let record = rooms.get_mut(name).ok_or(DirectoryError::NotFound)?;
        if record.vip_codes.remove(code).is_none() {
            return Err(DirectoryError::NotFound);
        }
        self.persist_or_rollback(&mut rooms, name, prior).await?;

        info!(room = %name, "vip code revoked");
        Ok(())
    }

    /// Redeem a code: locate the owning room, check exhaustion, decrement
    /// `uses_left` (finite codes only) and bump the usage counter — one
    /// atomic step under the directory lock.
    ///
    /// Unknown codes and codes with `uses_left == 0` both fail
    /// `INVALID_OR_EXHAUSTED`.
    pub async fn redeem_code(&self, code: &str) -> Result<Redemption, DirectoryError> {
        let mut rooms = self.rooms.lock().await;

        let room_name = rooms
            .values()
            .find(|r| r.vip_codes.contains_key(code))
            .map(|r| r.name.clone())
            .ok_or(DirectoryError::InvalidOrExhausted)?;

        let prior = rooms.get(&room_name).cloned();
        let record = rooms
            .get_mut(&room_name)
            .ok_or(DirectoryError::InvalidOrExhausted)?;
        let entry = record
            .vip_codes
            .get_mut(code)
            .ok_or(DirectoryError::InvalidOrExhausted)?;

        if !entry.multi_use() {
            match entry.uses_left {
                Some(left) if left > 0 => entry.uses_left = Some(left - 1),
                _ => return Err(DirectoryError::InvalidOrExhausted),
            }
        }
        entry.used += 1;

        let uses_left = entry.uses_left;
        let used = entry.used;
        self.persist_or_rollback(&mut rooms, &room_name, prior).await?;

        info!(room = %room_name, uses_left = ?uses_left, "vip code redeemed");
        Ok(Redemption {
            room_name,
            uses_left,
            used,
        })
    }

    // ── Live metadata / purchase boundary ───────────────────────────────

    /// Refresh the persisted live metadata.  A no-op for unclaimed rooms:
    /// sessions exist independently of claims.
    pub async fn update_live_state(
        &self,
        name: &str,
        live: bool,
        viewer_count: u64,
        title: &str,
    ) -> Result<(), DirectoryError> {
        let mut rooms = self.rooms.lock().await;
        if !rooms.contains_key(name) {
            return Ok(());
        }
        let prior = rooms.get(name).cloned();
        let record = rooms.get_mut(name).ok_or(DirectoryError::NotFound)?;
        record.live = live;
        record.viewer_count = viewer_count;
        record.title = title.to_string();
        self.persist_or_rollback(&mut rooms, name, prior).await
    }

    /// Consume the payment collaborator's "room purchased" signal: the
    /// record becomes non-reclaimable by others.
    pub async fn mark_purchased(&self, name: &str) -> Result<(), DirectoryError> {
        self.mutate(name, |record| record.purchased = true).await
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Apply `f` to an existing record and persist, rolling back on write
    /// failure.
    async fn mutate(
        &self,
        name: &str,
        f: impl FnOnce(&mut RoomRecord),
    ) -> Result<(), DirectoryError> {
        let mut rooms = self.rooms.lock().await;
        let prior = rooms.get(name).cloned();
        let record = rooms.get_mut(name).ok_or(DirectoryError::NotFound)?;
        f(record);
        self.persist_or_rollback(&mut rooms, name, prior).await
    }

    /// Persist the registry; on failure restore `name` to its prior state
    /// (or remove it if it did not exist) and surface the store error.
    async fn persist_or_rollback(
        &self,
        rooms: &mut RegistrySnapshot,
        name: &str,
        prior: Option<RoomRecord>,
    ) -> Result<(), DirectoryError> {
        match self.store.save(rooms).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(room = %name, "registry write failed, rolling back: {e}");
                match prior {
                    Some(record) => rooms.insert(name.to_string(), record),
                    None => rooms.remove(name),
                };
                Err(e.into())
            }
        }
    }
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{FailingStore, MemoryStore};
    use async_trait::async_trait;

    async fn memory_directory() -> RoomDirectory {
        RoomDirectory::open(Arc::new(MemoryStore::new())).await.unwrap()
    }

    /// Succeeds for the first `allow` saves, then refuses every write.
    struct FailAfter {
        allow: std::sync::Mutex<u32>,
    }

    #[async_trait]
    impl RegistryStore for FailAfter {
        async fn load(&self) -> Result<RegistrySnapshot, StoreError> {
            Ok(RegistrySnapshot::new())
        }

        async fn save(&self, _snapshot: &RegistrySnapshot) -> Result<(), StoreError> {
            let mut allow = self.allow.lock().unwrap();
            if *allow == 0 {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "write refused",
                )));
            }
            *allow -= 1;
            Ok(())
        }
    }

    // ── Claiming ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn claim_and_duplicate() {
        let dir = memory_directory().await;
        dir.create_room("Demo", Some("pw1"), Privacy::Private).await.unwrap();

        // Normalized key.
        assert!(dir.get("demo").await.is_some());

        let err = dir.create_room("  DEMO ", None, Privacy::Public).await.unwrap_err();
        assert!(matches!(err, DirectoryError::AlreadyExists));
    }

    #[tokio::test]
    async fn invalid_names_rejected() {
        let dir = memory_directory().await;
        for bad in ["", "   ", &"x".repeat(NAME_MAX_LEN + 1)] {
            let err = dir.create_room(bad, None, Privacy::Public).await.unwrap_err();
            assert!(matches!(err, DirectoryError::InvalidName), "name {bad:?}");
        }
    }

    #[tokio::test]
    async fn registry_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        {
            let dir = RoomDirectory::open(store.clone()).await.unwrap();
            dir.create_room("demo", None, Privacy::Public).await.unwrap();
        }
        let reopened = RoomDirectory::open(store).await.unwrap();
        assert!(reopened.get("demo").await.is_some());
    }

    // ── Authentication ──────────────────────────────────────────────────

    #[tokio::test]
    async fn authenticate_password_rules() {
        let dir = memory_directory().await;
        dir.create_room("open", None, Privacy::Public).await.unwrap();
        dir.create_room("locked", Some("hunter2"), Privacy::Public).await.unwrap();

        // No password set: any caller authenticates.
        dir.authenticate("open", "anything").await.unwrap();

        dir.authenticate("locked", "hunter2").await.unwrap();
        let err = dir.authenticate("locked", "wrong").await.unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidPassword));

        let err = dir.authenticate("ghost", "pw").await.unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound));
    }

    // ── Privacy / VIP flags ─────────────────────────────────────────────

    #[tokio::test]
    async fn vip_required_needs_private() {
        let dir = memory_directory().await;
        dir.create_room("demo", None, Privacy::Public).await.unwrap();

        // Normalized away on a public room.
        assert!(!dir.update_vip_required("demo", true).await.unwrap());

        dir.update_privacy("demo", Privacy::Private).await.unwrap();
        assert!(dir.update_vip_required("demo", true).await.unwrap());

        // Flipping back to public clears the flag.
        dir.update_privacy("demo", Privacy::Public).await.unwrap();
        assert!(!dir.get("demo").await.unwrap().vip_required);
    }

    #[tokio::test]
    async fn roster_is_case_insensitive_and_idempotent() {
        let dir = memory_directory().await;
        dir.create_room("demo", None, Privacy::Private).await.unwrap();

        dir.add_vip_user("demo", "Alice").await.unwrap();
        dir.add_vip_user("demo", "ALICE").await.unwrap();
        dir.add_vip_user("demo", " alice ").await.unwrap();

        let record = dir.get("demo").await.unwrap();
        assert_eq!(record.vip_roster, vec!["Alice".to_string()]);
        assert!(record.roster_contains("aLiCe"));
    }

    // ── Codes ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn generated_code_shape() {
        let dir = memory_directory().await;
        dir.create_room("demo", None, Privacy::Private).await.unwrap();

        let generated = dir.generate_vip_code("demo", Some(3)).await.unwrap();
        assert_eq!(generated.code.len(), CODE_LEN);
        assert!(generated
            .code
            .bytes()
            .all(|b| CODE_ALPHABET.contains(&b)));
        assert_eq!(generated.max_uses, Some(3));
        assert_eq!(generated.uses_left, Some(3));

        // Zero / negative / absent max_uses all mean multi-use.
        for max_uses in [None, Some(0), Some(-5)] {
            let g = dir.generate_vip_code("demo", max_uses).await.unwrap();
            assert_eq!(g.max_uses, None, "max_uses {max_uses:?}");
        }
    }

    #[tokio::test]
    async fn finite_code_exhausts() {
        let dir = memory_directory().await;
        dir.create_room("demo", None, Privacy::Private).await.unwrap();
        let code = dir.generate_vip_code("demo", Some(1)).await.unwrap().code;

        let redemption = dir.redeem_code(&code).await.unwrap();
        assert_eq!(redemption.room_name, "demo");
        assert_eq!(redemption.uses_left, Some(0));
        assert_eq!(redemption.used, 1);

        let err = dir.redeem_code(&code).await.unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidOrExhausted));

        // uses_left never went negative.
        let record = dir.get("demo").await.unwrap();
        assert_eq!(record.vip_codes[&code].uses_left, Some(0));
        assert_eq!(record.vip_codes[&code].used, 1);
    }

    #[tokio::test]
    async fn multi_use_code_only_counts() {
        let dir = memory_directory().await;
        dir.create_room("demo", None, Privacy::Private).await.unwrap();
        let code = dir.generate_vip_code("demo", None).await.unwrap().code;

        for expected_used in 1..=5 {
            let redemption = dir.redeem_code(&code).await.unwrap();
            assert_eq!(redemption.uses_left, None);
            assert_eq!(redemption.used, expected_used);
        }
    }

    #[tokio::test]
    async fn unknown_code_always_invalid() {
        let dir = memory_directory().await;
        let err = dir.redeem_code("NOPE1234").await.unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidOrExhausted));
    }

    #[tokio::test]
    async fn revoked_code_stops_redeeming() {
        let dir = memory_directory().await;
        dir.create_room("demo", None, Privacy::Private).await.unwrap();
        let code = dir.generate_vip_code("demo", None).await.unwrap().code;

        dir.revoke_vip_code("demo", &code).await.unwrap();
        let err = dir.redeem_code(&code).await.unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidOrExhausted));

        let err = dir.revoke_vip_code("demo", &code).await.unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound));
    }

    // ── Persistence rollback ────────────────────────────────────────────

    #[tokio::test]
    async fn failed_write_rolls_back_create() {
        let dir = RoomDirectory::open(Arc::new(FailingStore)).await.unwrap();

        let err = dir.create_room("demo", None, Privacy::Public).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Storage(_)));
        assert!(dir.get("demo").await.is_none());
    }

    #[tokio::test]
    async fn failed_write_rolls_back_redemption() {
        // Two saves allowed: create + generate.  The redemption write fails.
        let store = Arc::new(FailAfter {
            allow: std::sync::Mutex::new(2),
        });
        let dir = RoomDirectory::open(store).await.unwrap();
        dir.create_room("demo", None, Privacy::Private).await.unwrap();
        let code = dir.generate_vip_code("demo", Some(2)).await.unwrap().code;

        let err = dir.redeem_code(&code).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Storage(_)));

        // The decrement was rolled back.
        let record = dir.get("demo").await.unwrap();
        assert_eq!(record.vip_codes[&code].uses_left, Some(2));
        assert_eq!(record.vip_codes[&code].used, 0);
    }

    // ── Live metadata / purchase ────────────────────────────────────────

    #[tokio::test]
    async fn live_state_is_noop_for_unclaimed() {
        let dir = memory_directory().await;
        dir.update_live_state("ghost", true, 3, "title").await.unwrap();
        assert!(dir.get("ghost").await.is_none());

        dir.create_room("demo", None, Privacy::Public).await.unwrap();
        dir.update_live_state("demo", true, 7, "Movie Night").await.unwrap();
        let record = dir.get("demo").await.unwrap();
        assert!(record.live);
        assert_eq!(record.viewer_count, 7);
        assert_eq!(record.title, "Movie Night");
    }

    #[tokio::test]
    async fn purchase_marks_record() {
        let dir = memory_directory().await;
        dir.create_room("demo", None, Privacy::Public).await.unwrap();
        dir.mark_purchased("demo").await.unwrap();
        assert!(dir.get("demo").await.unwrap().purchased);
    }
}
