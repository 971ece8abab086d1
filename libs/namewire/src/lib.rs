#![no_std]

//! Raw DNS message helpers for the two UDP name responders.
//!
//! Inbound datagrams are treated as byte views: the question section is
//! located by walking length-prefixed labels and is echoed back verbatim in
//! responses, with a single A record appended. Nothing here allocates and
//! nothing is materialized beyond the decoded query name needed for the
//! mDNS hostname comparison.

use heapless::String;

pub const HEADER_LEN: usize = 12;
pub const QTYPE_A: u16 = 1;
pub const QTYPE_ANY: u16 = 255;
pub const QCLASS_IN: u16 = 1;

/// TTL carried by every answer record.
pub const ANSWER_TTL_SECS: u32 = 30;

/// Longest DNS name we decode (RFC 1035 limit).
pub const MAX_NAME_LEN: usize = 253;

pub type Name = String<MAX_NAME_LEN>;

/// Location and type of the first question in a packet. The question bytes
/// (name + type + class) are `packet[HEADER_LEN..end]`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Question {
    pub end: usize,
    pub qtype: u16,
    pub qclass: u16,
}

pub fn transaction_id(packet: &[u8]) -> Option<u16> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

/// True when the QR flag marks the packet as a query (not a response).
pub fn is_query(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN && packet[2] & 0x80 == 0
}

/// Walk the first question's length-prefixed labels up to the zero
/// terminator and return the byte range plus qtype/qclass. Compressed
/// question names (pointer labels) and truncated packets yield `None`.
pub fn walk_question(packet: &[u8]) -> Option<Question> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut idx = HEADER_LEN;
    loop {
        let len = *packet.get(idx)? as usize;
        if len == 0 {
            idx += 1;
            break;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        idx += 1 + len;
        if idx >= packet.len() {
            return None;
        }
    }

    if idx + 4 > packet.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[idx], packet[idx + 1]]);
    let qclass = u16::from_be_bytes([packet[idx + 2], packet[idx + 3]]);
    Some(Question {
        end: idx + 4,
        qtype,
        qclass,
    })
}

/// Decode the name at `offset` into `out` (lowercased, dot-separated),
/// following at most one compression pointer chain. Returns the offset just
/// past the name as it appears at `offset`.
pub fn decode_name(packet: &[u8], mut offset: usize, out: &mut Name) -> Option<usize> {
    let mut jumped = false;
    let mut jump_offset = 0usize;

    loop {
        let len = *packet.get(offset)?;
        if len & 0xC0 == 0xC0 {
            let next = *packet.get(offset + 1)?;
            let ptr = (((len & 0x3F) as usize) << 8) | next as usize;
            if ptr >= offset {
                return None;
            }
            if !jumped {
                jump_offset = offset + 2;
                jumped = true;
            }
            offset = ptr;
        } else if len == 0 {
            offset += 1;
            break;
        } else {
            offset += 1;
            let end = offset + len as usize;
            if end > packet.len() {
                return None;
            }
            if !out.is_empty() && out.push('.').is_err() {
                return None;
            }
            for &b in &packet[offset..end] {
                if out.push((b as char).to_ascii_lowercase()).is_err() {
                    return None;
                }
            }
            offset = end;
        }
    }

    Some(if jumped { jump_offset } else { offset })
}

/// Case-insensitive name comparison, tolerating a trailing root dot on the
/// candidate.
pub fn name_matches(candidate: &str, target: &str) -> bool {
    if candidate.eq_ignore_ascii_case(target) {
        return true;
    }
    if let Some(stripped) = candidate.strip_suffix('.') {
        return stripped.eq_ignore_ascii_case(target);
    }
    false
}

/// Build the captive responder's answer: standard query response
/// (flags 0x8180), the query's QDCOUNT and question echoed verbatim, one A
/// record pointing at `ip`.
pub fn build_captive_response(
    query: &[u8],
    question: &Question,
    ip: [u8; 4],
    out: &mut [u8],
) -> Option<usize> {
    if query.len() < HEADER_LEN || question.end > query.len() {
        return None;
    }
    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    build_a_response(
        out,
        transaction_id(query)?,
        0x8180,
        qdcount,
        &query[HEADER_LEN..question.end],
        ip,
    )
}

/// Build the mDNS responder's answer: authoritative response (flags
/// 0x8400), the question echoed verbatim, one A record pointing at `ip`.
pub fn build_mdns_response(
    query: &[u8],
    question: &Question,
    ip: [u8; 4],
    out: &mut [u8],
) -> Option<usize> {
    if question.end > query.len() {
        return None;
    }
    build_a_response(
        out,
        transaction_id(query)?,
        0x8400,
        1,
        &query[HEADER_LEN..question.end],
        ip,
    )
}

fn build_a_response(
    out: &mut [u8],
    tid: u16,
    flags: u16,
    qdcount: u16,
    question: &[u8],
    ip: [u8; 4],
) -> Option<usize> {
    let total = HEADER_LEN + question.len() + 16;
    if out.len() < total {
        return None;
    }

    out[0..2].copy_from_slice(&tid.to_be_bytes());
    out[2..4].copy_from_slice(&flags.to_be_bytes());
    out[4..6].copy_from_slice(&qdcount.to_be_bytes());
    out[6..8].copy_from_slice(&1u16.to_be_bytes()); // ANCOUNT
    out[8..10].copy_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out[10..12].copy_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    let mut offset = HEADER_LEN;
    out[offset..offset + question.len()].copy_from_slice(question);
    offset += question.len();

    // Answer name: pointer to the question name at offset 12.
    out[offset] = 0xC0;
    out[offset + 1] = 0x0C;
    out[offset + 2..offset + 4].copy_from_slice(&QTYPE_A.to_be_bytes());
    out[offset + 4..offset + 6].copy_from_slice(&QCLASS_IN.to_be_bytes());
    out[offset + 6..offset + 10].copy_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    out[offset + 10..offset + 12].copy_from_slice(&4u16.to_be_bytes());
    out[offset + 12..offset + 16].copy_from_slice(&ip);

    Some(offset + 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `example.local` A/IN query with transaction id 0xBEEF.
    fn query(name_labels: &[&str], qtype: u16) -> ([u8; 96], usize) {
        let mut buf = [0u8; 96];
        buf[0] = 0xBE;
        buf[1] = 0xEF;
        buf[4] = 0;
        buf[5] = 1; // QDCOUNT
        let mut idx = HEADER_LEN;
        for label in name_labels {
            buf[idx] = label.len() as u8;
            idx += 1;
            buf[idx..idx + label.len()].copy_from_slice(label.as_bytes());
            idx += label.len();
        }
        buf[idx] = 0;
        idx += 1;
        buf[idx..idx + 2].copy_from_slice(&qtype.to_be_bytes());
        buf[idx + 2..idx + 4].copy_from_slice(&QCLASS_IN.to_be_bytes());
        (buf, idx + 4)
    }

    #[test]
    fn walks_a_question() {
        let (buf, len) = query(&["modgate", "local"], QTYPE_A);
        let q = walk_question(&buf[..len]).unwrap();
        assert_eq!(q.end, len);
        assert_eq!(q.qtype, QTYPE_A);
        assert_eq!(q.qclass, QCLASS_IN);
    }

    #[test]
    fn rejects_short_and_truncated_packets() {
        assert!(walk_question(&[0u8; 11]).is_none());
        let (buf, len) = query(&["modgate", "local"], QTYPE_A);
        // Cut inside the qtype/qclass tail.
        assert!(walk_question(&buf[..len - 3]).is_none());
    }

    #[test]
    fn rejects_compressed_question_names() {
        let mut buf = [0u8; 32];
        buf[5] = 1;
        buf[HEADER_LEN] = 0xC0;
        buf[HEADER_LEN + 1] = 0x0C;
        assert!(walk_question(&buf).is_none());
    }

    #[test]
    fn captive_response_echoes_tid_and_question() {
        let (buf, len) = query(&["www", "example", "com"], QTYPE_A);
        let q = walk_question(&buf[..len]).unwrap();
        let mut out = [0u8; 128];
        let n = build_captive_response(&buf[..len], &q, [192, 168, 4, 1], &mut out).unwrap();

        assert_eq!(&out[0..2], &[0xBE, 0xEF]);
        assert_eq!(&out[2..4], &[0x81, 0x80]);
        assert_eq!(&out[4..6], &[0, 1]); // QDCOUNT echoed
        assert_eq!(&out[6..8], &[0, 1]); // exactly one answer
        assert_eq!(&out[8..12], &[0, 0, 0, 0]);
        assert_eq!(&out[HEADER_LEN..q.end], &buf[HEADER_LEN..q.end]);

        let answer = &out[q.end..n];
        assert_eq!(&answer[0..2], &[0xC0, 0x0C]);
        assert_eq!(&answer[2..4], &[0, 1]); // type A
        assert_eq!(&answer[4..6], &[0, 1]); // class IN
        assert_eq!(&answer[6..10], &ANSWER_TTL_SECS.to_be_bytes());
        assert_eq!(&answer[10..12], &[0, 4]);
        assert_eq!(&answer[12..16], &[192, 168, 4, 1]);
    }

    #[test]
    fn mdns_response_is_authoritative() {
        let (buf, len) = query(&["modgate", "local"], QTYPE_A);
        let q = walk_question(&buf[..len]).unwrap();
        let mut out = [0u8; 128];
        let n = build_mdns_response(&buf[..len], &q, [10, 0, 0, 9], &mut out).unwrap();
        assert_eq!(&out[2..4], &[0x84, 0x00]);
        assert_eq!(&out[4..6], &[0, 1]);
        assert_eq!(&out[n - 4..n], &[10, 0, 0, 9]);
    }

    #[test]
    fn response_build_fails_on_small_buffer() {
        let (buf, len) = query(&["modgate", "local"], QTYPE_A);
        let q = walk_question(&buf[..len]).unwrap();
        let mut out = [0u8; 16];
        assert!(build_captive_response(&buf[..len], &q, [1, 2, 3, 4], &mut out).is_none());
    }

    #[test]
    fn decodes_names_and_follows_pointers() {
        let (buf, len) = query(&["ModGate", "LOCAL"], QTYPE_A);
        let mut name = Name::new();
        let next = decode_name(&buf[..len], HEADER_LEN, &mut name).unwrap();
        assert_eq!(name.as_str(), "modgate.local");
        assert_eq!(next, len - 4);

        // A pointer back to the question name decodes to the same string.
        let mut packet = [0u8; 64];
        packet[..len].copy_from_slice(&buf[..len]);
        packet[len] = 0xC0;
        packet[len + 1] = 0x0C;
        let mut via_ptr = Name::new();
        let next = decode_name(&packet[..len + 2], len, &mut via_ptr).unwrap();
        assert_eq!(via_ptr.as_str(), "modgate.local");
        assert_eq!(next, len + 2);
    }

    #[test]
    fn decode_rejects_forward_pointers() {
        let mut packet = [0u8; 32];
        packet[HEADER_LEN] = 0xC0;
        packet[HEADER_LEN + 1] = HEADER_LEN as u8; // points at itself
        let mut name = Name::new();
        assert!(decode_name(&packet, HEADER_LEN, &mut name).is_none());
    }

    #[test]
    fn name_matching_is_case_insensitive_and_tolerates_root_dot() {
        assert!(name_matches("modgate.local", "modgate.local"));
        assert!(name_matches("MODGATE.Local", "modgate.local"));
        assert!(name_matches("modgate.local.", "modgate.local"));
        assert!(!name_matches("other.local", "modgate.local"));
        assert!(!name_matches("modgate.local.x", "modgate.local"));
    }

    #[test]
    fn query_flag_detection() {
        let (buf, len) = query(&["a"], QTYPE_A);
        assert!(is_query(&buf[..len]));
        let mut resp = buf;
        resp[2] = 0x84;
        assert!(!is_query(&resp[..len]));
    }
}
