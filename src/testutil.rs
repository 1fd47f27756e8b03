//! Packet builders shared by the unit tests.
#![cfg(test)]

use crate::iana::{Rtype, CLASS_IN};

/// Appends a domain name in wire format.
pub(crate) fn push_name(buf: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Builds a plain query packet with the RD bit set and one question.
pub(crate) fn mk_query(name: &str, rtype: Rtype, id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.push(0x01); // RD
    buf.push(0x00);
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&[0u8; 6]); // AN, NS, AR
    push_name(&mut buf, name);
    buf.extend_from_slice(&rtype.to_int().to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    buf
}

/// An answer record for [`mk_answer`].
pub(crate) struct AnswerRec {
    pub rtype: Rtype,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl AnswerRec {
    /// An A record.
    pub fn a(addr: [u8; 4], ttl: u32) -> Self {
        AnswerRec {
            rtype: Rtype::A,
            ttl,
            rdata: addr.to_vec(),
        }
    }
}

/// Builds an answer to a query built by [`mk_query`].
///
/// The question section is copied from the query; each answer record
/// points back at the question name via a compression pointer.
pub(crate) fn mk_answer(query: &[u8], answers: &[AnswerRec]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(query.len() + 16 * answers.len());
    buf.extend_from_slice(&query[..2]);
    buf.push(query[2] | 0x80); // QR
    buf.push(0x80); // RA
    buf.extend_from_slice(&query[4..6]); // QDCOUNT
    buf.extend_from_slice(&(answers.len() as u16).to_be_bytes());
    buf.extend_from_slice(&[0u8; 4]); // NS, AR
    buf.extend_from_slice(&query[12..]);
    for rec in answers {
        buf.extend_from_slice(&[0xC0, 0x0C]);
        buf.extend_from_slice(&rec.rtype.to_int().to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&rec.ttl.to_be_bytes());
        buf.extend_from_slice(&(rec.rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&rec.rdata);
    }
    buf
}

/// Builds a negative answer carrying a single authority SOA record.
pub(crate) fn mk_soa_answer(
    query: &[u8],
    soa_ttl: u32,
    minimum: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(query.len() + 48);
    buf.extend_from_slice(&query[..2]);
    buf.push(query[2] | 0x80); // QR
    buf.push(0x80); // RA
    buf.extend_from_slice(&query[4..6]); // QDCOUNT
    buf.extend_from_slice(&[0, 0, 0, 1, 0, 0]); // AN = 0, NS = 1, AR = 0
    buf.extend_from_slice(&query[12..]);

    buf.extend_from_slice(&[0xC0, 0x0C]);
    buf.extend_from_slice(&Rtype::SOA.to_int().to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    buf.extend_from_slice(&soa_ttl.to_be_bytes());

    let mut rdata = Vec::new();
    push_name(&mut rdata, "ns.example.com.");
    push_name(&mut rdata, "admin.example.com.");
    for field in [1u32, 7200, 900, 1_209_600, minimum] {
        rdata.extend_from_slice(&field.to_be_bytes());
    }
    buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    buf.extend_from_slice(&rdata);
    buf
}
