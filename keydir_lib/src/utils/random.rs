use rand::Rng;

/// A fresh 32-char lowercase hex verification nonce (16 random bytes).
pub fn verification_nonce() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 16]>())
}
