//! ASN.1 DER encoding of raw ECDSA (r, s) signatures (§4.3).

/// Encodes a raw 32-byte-r / 32-byte-s P-256 signature as a DER
/// `SEQUENCE { INTEGER r, INTEGER s }`. Each integer gets a leading 0x00
/// byte prepended when its high bit is set, so it is never read as negative.
pub fn encode_der_signature(r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
    let mut body = Vec::with_capacity(72);
    encode_integer(&mut body, r);
    encode_integer(&mut body, s);

    let mut out = Vec::with_capacity(2 + body.len());
    out.push(0x30);
    push_length(&mut out, body.len());
    out.extend_from_slice(&body);
    out
}

fn encode_integer(out: &mut Vec<u8>, value: &[u8; 32]) {
    out.push(0x02);
    if value[0] & 0x80 != 0 {
        push_length(out, 33);
        out.push(0x00);
        out.extend_from_slice(value);
    } else {
        push_length(out, 32);
        out.extend_from_slice(value);
    }
}

fn push_length(out: &mut Vec<u8>, len: usize) {
    // Lengths that occur here (32, 33 for integers; <= 70 for the sequence)
    // all fit in a single short-form DER length byte.
    debug_assert!(len < 0x80);
    out.push(len as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_without_padding_when_msb_clear() {
        let r = [0x01u8; 32];
        let s = [0x02u8; 32];
        let der = encode_der_signature(&r, &s);
        assert_eq!(der[0], 0x30);
        assert_eq!(der[1], 0x44); // 2 + 32 + 2 + 32
        assert_eq!(der[2], 0x02);
        assert_eq!(der[3], 32);
        assert_eq!(&der[4..36], &r[..]);
        assert_eq!(der[36], 0x02);
        assert_eq!(der[37], 32);
        assert_eq!(&der[38..70], &s[..]);
        assert_eq!(der.len(), 72);
    }

    #[test]
    fn pads_with_zero_when_msb_set() {
        let r = [0xFFu8; 32];
        let s = [0x7Fu8; 32];
        let der = encode_der_signature(&r, &s);
        assert_eq!(der[0], 0x30);
        // r needs padding (33 + tag/len = 35), s does not (32 + tag/len = 34)
        assert_eq!(der[1], 0x45);
        assert_eq!(der[2], 0x02);
        assert_eq!(der[3], 33);
        assert_eq!(der[4], 0x00);
        assert_eq!(&der[5..37], &r[..]);
        let s_offset = 37;
        assert_eq!(der[s_offset], 0x02);
        assert_eq!(der[s_offset + 1], 32);
        assert_eq!(&der[s_offset + 2..s_offset + 34], &s[..]);
    }

    #[test]
    fn sequence_length_matches_body() {
        let r = [0x80u8; 32];
        let s = [0x01u8; 32];
        let der = encode_der_signature(&r, &s);
        assert_eq!(der.len(), 2 + der[1] as usize);
    }
}
