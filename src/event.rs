//! Nostr event model, canonical hashing, and Schnorr signing.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from string fields.
    pub fn new(fields: &[&str]) -> Self {
        Tag(fields.iter().map(|s| s.to_string()).collect())
    }

    /// Tag name (first field), empty when the tag has no fields.
    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    /// Tag value (second field), if present.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Core Nostr event exchanged with relays and persisted as raw blobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `9735`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Value of the first tag with the given name.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == name)
            .and_then(Tag::value)
    }

    /// Value of the last tag with the given name.
    pub fn last_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .rev()
            .find(|t| t.name() == name)
            .and_then(Tag::value)
    }

    /// Values of every tag with the given name.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.name() == name)
            .filter_map(Tag::value)
            .collect()
    }
}

/// Current Unix timestamp in seconds.
pub fn now() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Build a signed event under the given secret key, stamped with the
/// current time.
pub fn sign(sk_hex: &str, kind: u32, tags: Vec<Tag>, content: String) -> Result<Event> {
    let secp = Secp256k1::new();
    let sk = hex::decode(sk_hex)?;
    let kp = Keypair::from_seckey_slice(&secp, &sk)?;
    let pubkey = hex::encode(kp.x_only_public_key().0.serialize());

    let mut ev = Event {
        id: String::new(),
        pubkey,
        kind,
        created_at: now(),
        tags,
        content,
        sig: String::new(),
    };
    let hash = event_hash(&ev)?;
    ev.id = hex::encode(hash);
    let msg = Message::from_digest_slice(&hash)?;
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    ev.sig = hex::encode(sig.as_ref());
    Ok(ev)
}

/// Verify an event's ID and Schnorr signature.
pub fn verify(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
