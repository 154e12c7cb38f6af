//! Captive-portal DNS: every A query is answered with the access point's own
//! address so OS connectivity probes land on the setup page.

pub const DNS_PORT: u16 = 53;
pub const MAX_DNS_PACKET: usize = 512;

const HEADER_LEN: usize = 12;
const ANSWER_LEN: usize = 16;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const ANSWER_TTL_SECS: u32 = 60;

/// Writes the reply for `query` into `out` and returns its length. `None`
/// means the packet is not a standard query and gets no reply. Queries for
/// other record types get an empty NOERROR reply.
pub fn captive_answer(query: &[u8], ip: [u8; 4], out: &mut [u8]) -> Option<usize> {
    let question_end = parse_question(query)?;
    let qtype = u16::from_be_bytes([query[question_end - 4], query[question_end - 3]]);
    let qclass = u16::from_be_bytes([query[question_end - 2], query[question_end - 1]]);
    let answered = (qtype == TYPE_A || qtype == TYPE_ANY) && qclass == CLASS_IN;

    let len = question_end + if answered { ANSWER_LEN } else { 0 };
    if out.len() < len {
        return None;
    }

    out[..question_end].copy_from_slice(&query[..question_end]);
    // QR + AA, keep the client's RD bit; RA set, RCODE 0.
    out[2] = 0x84 | (query[2] & 0x01);
    out[3] = 0x80;
    out[4..6].copy_from_slice(&1u16.to_be_bytes());
    out[6..8].copy_from_slice(&u16::from(answered).to_be_bytes());
    out[8..12].fill(0);

    if answered {
        let answer = &mut out[question_end..len];
        // Name is a pointer to the question at offset 12.
        answer[0..2].copy_from_slice(&[0xC0, 0x0C]);
        answer[2..4].copy_from_slice(&TYPE_A.to_be_bytes());
        answer[4..6].copy_from_slice(&CLASS_IN.to_be_bytes());
        answer[6..10].copy_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
        answer[10..12].copy_from_slice(&4u16.to_be_bytes());
        answer[12..16].copy_from_slice(&ip);
    }
    Some(len)
}

/// Offset just past the first question's QTYPE/QCLASS.
fn parse_question(packet: &[u8]) -> Option<usize> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    // QR must be 0 and opcode QUERY.
    if packet[2] & 0xF8 != 0 {
        return None;
    }
    if u16::from_be_bytes([packet[4], packet[5]]) == 0 {
        return None;
    }

    let mut offset = HEADER_LEN;
    loop {
        let len = usize::from(*packet.get(offset)?);
        if len == 0 {
            offset += 1;
            break;
        }
        // Compression pointers never appear in a query's first question.
        if len & 0xC0 != 0 {
            return None;
        }
        offset += 1 + len;
    }

    let end = offset + 4;
    (end <= packet.len()).then_some(end)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const AP_IP: [u8; 4] = [192, 168, 71, 1];

    fn query(name: &str, qtype: u16) -> Vec<u8> {
        let mut packet = vec![0xAB, 0xCD, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        for label in name.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&qtype.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet
    }

    #[test]
    fn answers_a_query_with_access_point_address() {
        let request = query("connectivitycheck.gstatic.com", TYPE_A);
        let mut out = [0u8; MAX_DNS_PACKET];

        let len = captive_answer(&request, AP_IP, &mut out).unwrap();
        let reply = &out[..len];

        assert_eq!(len, request.len() + ANSWER_LEN);
        assert_eq!(&reply[0..2], &[0xAB, 0xCD]);
        assert_eq!(reply[2], 0x85);
        assert_eq!(&reply[4..8], &[0, 1, 0, 1]);
        assert_eq!(&reply[12..request.len()], &request[12..]);
        assert_eq!(&reply[len - 4..], &AP_IP);
    }

    #[test]
    fn other_record_types_get_empty_answer() {
        let request = query("captive.apple.com", 28);
        let mut out = [0u8; MAX_DNS_PACKET];

        let len = captive_answer(&request, AP_IP, &mut out).unwrap();
        assert_eq!(len, request.len());
        assert_eq!(&out[6..8], &[0, 0]);
    }

    #[test]
    fn ignores_responses_and_truncated_packets() {
        let mut out = [0u8; MAX_DNS_PACKET];
        let mut response = query("example.com", TYPE_A);
        response[2] |= 0x80;

        assert_eq!(captive_answer(&response, AP_IP, &mut out), None);
        assert_eq!(captive_answer(&[0u8; 5], AP_IP, &mut out), None);

        let request = query("example.com", TYPE_A);
        assert_eq!(captive_answer(&request[..request.len() - 2], AP_IP, &mut out), None);
    }
}
