//! Key material, bech32 address codecs, and NIP-04 payload encryption.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use bech32::{Bech32, Hrp};
use secp256k1::{Keypair, PublicKey, Secp256k1, SecretKey};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Generate a fresh secret key, hex encoded.
pub fn generate_secret_key() -> String {
    // Rejection-sample until the bytes form a valid scalar.
    loop {
        let bytes: [u8; 32] = rand::random();
        if let Ok(sk) = SecretKey::from_slice(&bytes) {
            return hex::encode(sk.secret_bytes());
        }
    }
}

/// Derive the x-only public key (hex) for a hex secret key.
pub fn derive_pubkey(sk_hex: &str) -> Result<String> {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &hex::decode(sk_hex)?)?;
    Ok(hex::encode(kp.x_only_public_key().0.serialize()))
}

fn encode_bech32(hrp: &str, hex_data: &str) -> Result<String> {
    let data = hex::decode(hex_data)?;
    let hrp = Hrp::parse(hrp)?;
    Ok(bech32::encode::<Bech32>(hrp, &data)?)
}

fn decode_bech32(expected_hrp: &str, encoded: &str) -> Result<String> {
    let (hrp, data) = bech32::decode(encoded)?;
    if hrp.as_str() != expected_hrp {
        return Err(anyhow!("invalid {} prefix: {}", expected_hrp, hrp.as_str()));
    }
    if data.len() != 32 {
        return Err(anyhow!("invalid {} value", expected_hrp));
    }
    Ok(hex::encode(data))
}

/// Encode a hex public key as an `npub` address.
pub fn encode_npub(pubkey_hex: &str) -> Result<String> {
    encode_bech32("npub", pubkey_hex)
}

/// Decode an `npub` address into a hex public key.
pub fn decode_npub(npub: &str) -> Result<String> {
    decode_bech32("npub", npub)
}

/// Encode a hex secret key as an `nsec` address.
pub fn encode_nsec(sk_hex: &str) -> Result<String> {
    encode_bech32("nsec", sk_hex)
}

/// Decode an `nsec` address into a hex secret key.
pub fn decode_nsec(nsec: &str) -> Result<String> {
    decode_bech32("nsec", nsec)
}

/// Encode a hex event id as a `note` reference.
pub fn encode_note(id_hex: &str) -> Result<String> {
    encode_bech32("note", id_hex)
}

/// NIP-04 shared secret: the x coordinate of the ECDH point between the
/// sender secret and the receiver public key.
fn shared_secret(sk_hex: &str, pubkey_hex: &str) -> Result<[u8; 32]> {
    let sk = SecretKey::from_slice(&hex::decode(sk_hex)?)?;
    let mut compressed = vec![0x02];
    compressed.extend(hex::decode(pubkey_hex)?);
    let pk = PublicKey::from_slice(&compressed)
        .map_err(|_| anyhow!("invalid receiver public key: {}", pubkey_hex))?;
    let point = secp256k1::ecdh::shared_secret_point(&pk, &sk);
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    Ok(key)
}

/// Encrypt a direct-message body for a receiver (AES-256-CBC, `?iv=` form).
pub fn nip04_encrypt(sk_hex: &str, receiver_pub: &str, msg: &str) -> Result<String> {
    let key = shared_secret(sk_hex, receiver_pub)?;
    let iv: [u8; 16] = rand::random();
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(msg.as_bytes());
    Ok(format!("{}?iv={}", B64.encode(ciphertext), B64.encode(iv)))
}

/// Decrypt a direct-message body from a sender.
pub fn nip04_decrypt(sk_hex: &str, sender_pub: &str, payload: &str) -> Result<String> {
    let (ct_b64, iv_b64) = payload
        .split_once("?iv=")
        .ok_or_else(|| anyhow!("missing iv"))?;
    let ciphertext = B64.decode(ct_b64)?;
    let iv: [u8; 16] = B64
        .decode(iv_b64)?
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("invalid iv"))?;
    let key = shared_secret(sk_hex, sender_pub)?;
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| anyhow!("decrypt failed"))?;
    Ok(String::from_utf8(plaintext)?)
}
