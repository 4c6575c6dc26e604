//! 머신 식별자.
//!
//! 공개 URL로부터 짧고 안정적인 노드 식별자를 만듭니다.

use sha2::{Digest, Sha256};

/// 공개 URL이 설정되지 않은 경우의 식별자.
pub const UNKNOWN_MACHINE: &str = "unknown-machine";

const ID_LEN: usize = 6;

/// 입력의 SHA-256 해시를 big-endian 정수로 보고 하위 6자리 26진수를 `A`-`Z`로 표현합니다.
///
/// 가장 높은 자리가 먼저 옵니다.
pub fn hash_to_6_upper(input: &str) -> String {
    let mut digits: Vec<u8> = Sha256::digest(input.as_bytes()).to_vec();
    let mut out = Vec::with_capacity(ID_LEN);

    for _ in 0..ID_LEN {
        let rem = div_rem_in_place(&mut digits, 26);
        out.push(b'A' + rem);
    }

    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// big-endian 바이트 정수를 제자리에서 나누고 나머지를 반환합니다.
fn div_rem_in_place(number: &mut [u8], divisor: u16) -> u8 {
    let mut rem: u16 = 0;
    for byte in number.iter_mut() {
        let acc = (rem << 8) | u16::from(*byte);
        *byte = (acc / divisor) as u8;
        rem = acc % divisor;
    }
    rem as u8
}

/// 공개 URL에서 머신 ID를 결정합니다.
pub fn machine_id(public_url: &str) -> String {
    let url = public_url.trim();
    if url.is_empty() {
        UNKNOWN_MACHINE.to_string()
    } else {
        hash_to_6_upper(url)
    }
}
