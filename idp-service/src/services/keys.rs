//! Key registry: per-scope `(active, retiring)` Ed25519 signing keys.
//!
//! Key sets are immutable snapshots behind `Arc`; rotation swaps in a new
//! snapshot so a signer holding the previous one finishes with it unharmed.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::crypto::{CryptoError, SecretBox};
use crate::models::{KeyScope, StoredKey, StoredKeySet};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("kid {0} already names a different key")]
    KidConflict(String),

    #[error("No signing key for scope {0}")]
    NoActiveKey(KeyScope),

    #[error("Key material is malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// One usable keypair.
pub struct KeyPair {
    pub kid: String,
    /// base64url of the raw 32-byte public key.
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    fn from_signing_key(
        kid: String,
        signing: &SigningKey,
        created_at: DateTime<Utc>,
    ) -> Result<Self, KeyError> {
        let der = signing
            .to_pkcs8_der()
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        let encoding = EncodingKey::from_ed_der(der.as_bytes());
        let public_key = URL_SAFE_NO_PAD.encode(signing.verifying_key().as_bytes());
        let decoding = DecodingKey::from_ed_components(&public_key)
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        Ok(Self {
            kid,
            public_key,
            created_at,
            encoding,
            decoding,
        })
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// Opens a stored key. The public half is re-derived and must match.
    fn open(stored: &StoredKey, secret_box: &SecretBox) -> Result<Self, KeyError> {
        let seed = secret_box.open(&stored.private_key_enc)?;
        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Malformed(format!("seed for {} is not 32 bytes", stored.kid)))?;
        let signing = SigningKey::from_bytes(&seed);
        let pair = Self::from_signing_key(stored.kid.clone(), &signing, stored.created_at)?;
        if pair.public_key != stored.public_key {
            return Err(KeyError::Malformed(format!(
                "public key of {} does not match its seed",
                stored.kid
            )));
        }
        Ok(pair)
    }
}

/// Generates a fresh keypair and its sealed at-rest form.
pub fn generate_stored_key(
    secret_box: &SecretBox,
    now: DateTime<Utc>,
) -> Result<StoredKey, KeyError> {
    let signing = SigningKey::generate(&mut OsRng);
    Ok(StoredKey {
        kid: Uuid::new_v4().simple().to_string(),
        public_key: URL_SAFE_NO_PAD.encode(signing.verifying_key().as_bytes()),
        private_key_enc: secret_box.seal(signing.as_bytes())?,
        created_at: now,
    })
}

/// Snapshot of one scope's keys.
#[derive(Debug)]
pub struct KeySet {
    pub scope: KeyScope,
    pub active: Arc<KeyPair>,
    pub retiring: Option<(Arc<KeyPair>, DateTime<Utc>)>,
}

impl KeySet {
    /// Keys that verify at `now`: the active one, plus the retiring one while
    /// its grace window lasts.
    pub fn verifying(&self, now: DateTime<Utc>) -> Vec<Arc<KeyPair>> {
        let mut keys = vec![self.active.clone()];
        if let Some((key, until)) = &self.retiring {
            if now <= *until {
                keys.push(key.clone());
            }
        }
        keys
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Jwk {
    pub kty: &'static str,
    pub crv: &'static str,
    pub x: String,
    pub kid: String,
    pub alg: &'static str,
    #[serde(rename = "use")]
    pub key_use: &'static str,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

struct CachedJwks {
    doc: Arc<JwkSet>,
    /// The document drops a key at this instant.
    valid_until: Option<DateTime<Utc>>,
}

pub struct KeyRegistry {
    secret_box: Arc<SecretBox>,
    sets: DashMap<KeyScope, Arc<KeySet>>,
    kids: DashMap<String, (KeyScope, String)>,
    jwks: DashMap<KeyScope, CachedJwks>,
}

impl KeyRegistry {
    pub fn new(secret_box: Arc<SecretBox>) -> Self {
        Self {
            secret_box,
            sets: DashMap::new(),
            kids: DashMap::new(),
            jwks: DashMap::new(),
        }
    }

    pub fn has_scope(&self, scope: &KeyScope) -> bool {
        self.sets.contains_key(scope)
    }

    /// Current snapshot for `scope`.
    pub fn key_set(&self, scope: &KeyScope) -> Option<Arc<KeySet>> {
        self.sets.get(scope).map(|s| s.clone())
    }

    pub fn active(&self, scope: &KeyScope) -> Result<Arc<KeyPair>, KeyError> {
        self.sets
            .get(scope)
            .map(|s| s.active.clone())
            .ok_or(KeyError::NoActiveKey(*scope))
    }

    /// Looks `kid` up among the keys that verify at `now`.
    pub fn verification_key(
        &self,
        kid: &str,
        now: DateTime<Utc>,
    ) -> Option<(KeyScope, Arc<KeyPair>)> {
        let scope = self.kids.get(kid).map(|entry| entry.0)?;
        let set = self.key_set(&scope)?;
        set.verifying(now)
            .into_iter()
            .find(|k| k.kid == kid)
            .map(|k| (scope, k))
    }

    /// Builds the key set a rotation would install: a fresh active key, the
    /// current active demoted to retiring until `now + grace`. The previous
    /// retiring key is dropped. Nothing is installed.
    pub fn prepare_rotation(
        &self,
        scope: KeyScope,
        current: Option<&StoredKeySet>,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<StoredKeySet, KeyError> {
        let active = generate_stored_key(&self.secret_box, now)?;
        Ok(match current {
            Some(current) => StoredKeySet {
                scope,
                active,
                retiring: Some(current.active.clone()),
                retire_until: Some(now + grace),
            },
            None => StoredKeySet {
                scope,
                active,
                retiring: None,
                retire_until: None,
            },
        })
    }

    /// Installs exactly the given material. Fails without side effects when a
    /// kid is already bound to a different public key.
    pub fn install(&self, stored: &StoredKeySet) -> Result<(), KeyError> {
        let mut entries = vec![&stored.active];
        if let Some(retiring) = &stored.retiring {
            entries.push(retiring);
        }
        for key in &entries {
            if let Some(existing) = self.kids.get(&key.kid) {
                let (scope, public) = existing.value();
                if *scope != stored.scope || *public != key.public_key {
                    return Err(KeyError::KidConflict(key.kid.clone()));
                }
            }
        }

        let active = Arc::new(KeyPair::open(&stored.active, &self.secret_box)?);
        let retiring = match (&stored.retiring, stored.retire_until) {
            (Some(key), Some(until)) => {
                Some((Arc::new(KeyPair::open(key, &self.secret_box)?), until))
            }
            _ => None,
        };

        for key in entries {
            self.kids
                .insert(key.kid.clone(), (stored.scope, key.public_key.clone()));
        }
        let set = Arc::new(KeySet {
            scope: stored.scope,
            active,
            retiring,
        });
        self.sets.insert(stored.scope, set);
        tracing::info!(scope = %stored.scope, kid = %stored.active.kid, "signing keys installed");
        Ok(())
    }

    /// Forgets a scope, e.g. after its tenant was deleted. Its kids stay
    /// reserved.
    pub fn remove_scope(&self, scope: &KeyScope) {
        self.sets.remove(scope);
        self.jwks.remove(scope);
    }

    pub fn jwks(&self, scope: &KeyScope, now: DateTime<Utc>) -> Arc<JwkSet> {
        if let Some(cached) = self.jwks.get(scope) {
            if cached.valid_until.map_or(true, |until| now <= until) {
                return cached.doc.clone();
            }
        }

        let (keys, valid_until) = match self.key_set(scope) {
            Some(set) => (
                set.verifying(now)
                    .iter()
                    .map(|k| Jwk {
                        kty: "OKP",
                        crv: "Ed25519",
                        x: k.public_key.clone(),
                        kid: k.kid.clone(),
                        alg: "EdDSA",
                        key_use: "sig",
                    })
                    .collect(),
                set.retiring
                    .as_ref()
                    .map(|(_, until)| *until)
                    .filter(|until| now <= *until),
            ),
            None => (Vec::new(), None),
        };
        let doc = Arc::new(JwkSet { keys });
        self.jwks.insert(
            *scope,
            CachedJwks {
                doc: doc.clone(),
                valid_until,
            },
        );
        doc
    }

    pub fn invalidate_jwks(&self, scope: &KeyScope) {
        self.jwks.remove(scope);
    }
}
