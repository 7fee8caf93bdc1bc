//! MPTCP 握手用到的密钥派生与 HMAC（RFC 6824 §3.1/§3.2）
//!
//! - token：SHA-1(key) 的高 32 位
//! - IDSN：SHA-1(key) 的低 64 位
//! - MP_JOIN：HMAC-SHA1(KeyA||KeyB, RA||RB)，SYN/ACK 上截断为 64 位

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

type HmacSha1 = Hmac<Sha1>;

/// 由 64 位密钥派生 (token, IDSN)
pub fn token_and_idsn(key: u64) -> (u32, u64) {
    let d = Sha1::digest(key.to_be_bytes());
    let token = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
    let idsn = u64::from_be_bytes([d[12], d[13], d[14], d[15], d[16], d[17], d[18], d[19]]);
    (token, idsn)
}

/// 本端视角的 MP_JOIN HMAC：密钥为 本端Key||对端Key，消息为 本端随机数||对端随机数
pub fn join_hmac(local_key: u64, remote_key: u64, local_nonce: u32, remote_nonce: u32) -> [u8; 20] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&local_key.to_be_bytes());
    key[8..].copy_from_slice(&remote_key.to_be_bytes());
    let mut mac = HmacSha1::new_from_slice(&key).expect("HMAC can take key of any size");
    mac.update(&local_nonce.to_be_bytes());
    mac.update(&remote_nonce.to_be_bytes());
    mac.finalize().into_bytes().into()
}

/// SYN/ACK 上携带的截断 HMAC（最左 64 位）
pub fn truncate_hmac(full: &[u8; 20]) -> u64 {
    u64::from_be_bytes([
        full[0], full[1], full[2], full[3], full[4], full[5], full[6], full[7],
    ])
}
