use crate::proto::mptcp::{join_hmac, token_and_idsn, truncate_hmac};

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[test]
fn token_and_idsn_come_from_sha1_of_key() {
    let (token, idsn) = token_and_idsn(0x0102_0304_0506_0708);
    assert_eq!(token, 0xdd57_83bc);
    assert_eq!(idsn, 0x3a95_ed6e_4ebb_4ad5);
}

#[test]
fn join_hmac_matches_known_vectors() {
    let key_a = 0x0102_0304_0506_0708;
    let key_b = 0x1112_1314_1516_1718;
    let a = join_hmac(key_a, key_b, 0xaabb_ccdd, 0x1122_3344);
    assert_eq!(hex(&a), "3078ffd36d649a00bf561db78fc17682317b5450");
    let b = join_hmac(key_b, key_a, 0x1122_3344, 0xaabb_ccdd);
    assert_eq!(hex(&b), "1628a8ed9003b9acc21a9a1252959022f466f602");
    assert_eq!(truncate_hmac(&a), 0x3078_ffd3_6d64_9a00);
}

#[test]
fn join_hmac_depends_on_direction() {
    let a = join_hmac(1, 2, 3, 4);
    assert_ne!(a, join_hmac(2, 1, 4, 3));
    assert_eq!(a, join_hmac(1, 2, 3, 4));
}
