//! Inspection of raw DNS packets.
//!
//! The answer cache deliberately avoids a full record parser on its hot
//! path: queries are validated, hashed and compared directly on their wire
//! octets, and answers are only parsed far enough to extract the smallest
//! TTL. This module contains all of that byte walking.
//!
//! A query is *cacheable* if it is the plain kind of question this resolver
//! forwards: a single-purpose query packet with uncompressed question
//! names, one of the supported record types, class IN, and at most one
//! additional record (to allow for an EDNS OPT record). The validator is
//! deliberately conservative: anything whose semantics the hasher cannot
//! canonicalize is rejected and simply bypasses the cache.
//!
//! The query fingerprint covers the RD bit, the AD/CD header byte, all
//! question records and all additional records. The message ID and the TC
//! bit are excluded: the ID changes on every retransmission and the TC bit
//! may be flipped by the transport between lookup and store.

use crate::header::{Header, HeaderCounts};
use crate::iana::{Rtype, CLASS_IN};

/// The length of the fixed DNS message header.
pub(crate) const HEADER_LEN: usize = 12;

/// 32-bit FNV-1a parameters.
const FNV_PRIME: u32 = 16_777_619;
const FNV_BASIS: u32 = 2_166_136_261;

//------------ Parser --------------------------------------------------------

/// A cursor over the octets of a DNS packet.
#[derive(Clone, Copy, Debug)]
struct Parser<'a> {
    /// The octets of the entire packet.
    octets: &'a [u8],

    /// The current read position.
    pos: usize,
}

/// An error while walking a packet. Carries no detail; every public
/// operation maps it to "not cacheable" or "do not cache".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ParseError;

impl<'a> Parser<'a> {
    /// Creates a parser positioned behind the message header.
    fn past_header(octets: &'a [u8]) -> Result<Self, ParseError> {
        if octets.len() < HEADER_LEN {
            return Err(ParseError);
        }
        Ok(Parser {
            octets,
            pos: HEADER_LEN,
        })
    }

    /// Advances the read position by `count` octets.
    fn advance(&mut self, count: usize) -> Result<(), ParseError> {
        if count > self.octets.len() - self.pos {
            return Err(ParseError);
        }
        self.pos += count;
        Ok(())
    }

    /// Takes a big-endian 16 bit integer.
    fn parse_u16(&mut self) -> Result<u16, ParseError> {
        if self.octets.len() - self.pos < 2 {
            return Err(ParseError);
        }
        let res = u16::from_be_bytes([
            self.octets[self.pos],
            self.octets[self.pos + 1],
        ]);
        self.pos += 2;
        Ok(res)
    }

    /// Takes a big-endian 32 bit integer.
    fn parse_u32(&mut self) -> Result<u32, ParseError> {
        if self.octets.len() - self.pos < 4 {
            return Err(ParseError);
        }
        let res = u32::from_be_bytes(
            self.octets[self.pos..self.pos + 4].try_into().unwrap(),
        );
        self.pos += 4;
        Ok(res)
    }

    /// Skips over an uncompressed domain name.
    ///
    /// Compression pointers are not accepted: query packets produced by
    /// stub API users never contain them, and rejecting them keeps the
    /// hashed byte sequence canonical.
    fn skip_uncompressed_name(&mut self) -> Result<(), ParseError> {
        loop {
            if self.pos >= self.octets.len() {
                return Err(ParseError);
            }
            let len = self.octets[self.pos] as usize;
            self.pos += 1;
            if len == 0 {
                return Ok(());
            }
            if len >= 64 {
                return Err(ParseError);
            }
            self.advance(len)?;
        }
    }

    /// Skips over a possibly compressed domain name.
    ///
    /// A compression pointer terminates the name.
    fn skip_name(&mut self) -> Result<(), ParseError> {
        loop {
            if self.pos >= self.octets.len() {
                return Err(ParseError);
            }
            let len = self.octets[self.pos] as usize;
            if len & 0xC0 == 0xC0 {
                return self.advance(2);
            }
            self.pos += 1;
            if len == 0 {
                return Ok(());
            }
            if len >= 64 {
                return Err(ParseError);
            }
            self.advance(len)?;
        }
    }
}

//------------ Query validation and fingerprinting ---------------------------

/// Checks a query packet and returns the end of its canonical region.
///
/// The canonical region is the contiguous octet range from the end of the
/// header to the end of the last additional record; together with the RD
/// bit and the second flag byte it is everything the fingerprint covers.
fn check_query(query: &[u8]) -> Result<usize, ParseError> {
    if query.len() < HEADER_LEN {
        return Err(ParseError);
    }

    // QR, opcode, and AA must be zero; TC and RD are not constraints.
    if query[2] & 0xFC != 0 {
        return Err(ParseError);
    }
    // RA, Z, and RCODE must be zero; AD and CD are not constraints since
    // the answer may legitimately depend on them.
    if query[3] & 0xCF != 0 {
        return Err(ParseError);
    }

    let counts = HeaderCounts::for_message_slice(query);
    if counts.ancount() != 0 || counts.nscount() != 0 || counts.arcount() > 1
    {
        return Err(ParseError);
    }
    if counts.qdcount() == 0 {
        return Err(ParseError);
    }

    let mut parser = Parser::past_header(query)?;
    for _ in 0..counts.qdcount() {
        parser.skip_uncompressed_name()?;
        let rtype = Rtype::from_int(parser.parse_u16()?);
        if !matches!(
            rtype,
            Rtype::A | Rtype::PTR | Rtype::MX | Rtype::AAAA | Rtype::ANY
        ) {
            return Err(ParseError);
        }
        if parser.parse_u16()? != CLASS_IN {
            return Err(ParseError);
        }
    }
    for _ in 0..counts.arcount() {
        parser.skip_uncompressed_name()?;
        parser.advance(8)?; // TYPE, CLASS, TTL
        let rdlength = parser.parse_u16()? as usize;
        parser.advance(rdlength)?;
    }
    Ok(parser.pos)
}

/// Returns whether a query packet is one the cache can handle.
pub fn is_cacheable_query(query: &[u8]) -> bool {
    check_query(query).is_ok()
}

/// Computes the fingerprint hash of a query packet.
///
/// Returns `None` if the packet is not cacheable. The hash is 32-bit
/// FNV-1a folded over the RD bit, the second flag byte (which carries AD
/// and CD) and the canonical region covering all question and additional
/// records. The message ID and the TC bit do not participate.
pub fn fingerprint(query: &[u8]) -> Option<u32> {
    let end = check_query(query).ok()?;
    let mut hash = FNV_BASIS;
    hash = fnv1a(hash, query[2] & 1);
    hash = fnv1a(hash, query[3]);
    for &octet in &query[HEADER_LEN..end] {
        hash = fnv1a(hash, octet);
    }
    Some(hash)
}

/// Folds one octet into an FNV-1a hash.
fn fnv1a(hash: u32, octet: u8) -> u32 {
    (hash ^ u32::from(octet)).wrapping_mul(FNV_PRIME)
}

/// Returns whether two query packets ask the exact same question.
///
/// True iff both packets pass validation and their canonical projections
/// match: same RD bit, same second flag byte, same section counts, and
/// octet-identical question and additional records. Queries encoding the
/// same name differently are distinct on purpose.
pub fn queries_equal(a: &[u8], b: &[u8]) -> bool {
    let (end_a, end_b) = match (check_query(a), check_query(b)) {
        (Ok(end_a), Ok(end_b)) => (end_a, end_b),
        _ => return false,
    };
    if a[2] & 1 != b[2] & 1 || a[3] != b[3] {
        return false;
    }
    let counts_a = HeaderCounts::for_message_slice(a);
    let counts_b = HeaderCounts::for_message_slice(b);
    if counts_a.qdcount() != counts_b.qdcount()
        || counts_a.arcount() != counts_b.arcount()
    {
        return false;
    }
    a[HEADER_LEN..end_a] == b[HEADER_LEN..end_b]
}

//------------ Answer TTL extraction -----------------------------------------

/// Returns the number of seconds an answer may be cached for.
///
/// For a positive answer this is the smallest TTL among the answer
/// records. For a negative answer (no answer records) it is the negative
/// TTL defined by RFC 2308: the minimum of the SOA record's own TTL and
/// its MINIMUM field, taken over all SOA records in the authority section.
///
/// Returns 0 on any parse failure, in which case the answer must not be
/// cached.
pub fn answer_min_ttl(answer: &[u8]) -> u32 {
    min_ttl(answer).unwrap_or(0)
}

/// Fallible body of [`answer_min_ttl`].
fn min_ttl(answer: &[u8]) -> Result<u32, ParseError> {
    let mut parser = Parser::past_header(answer)?;
    let counts = HeaderCounts::for_message_slice(answer);

    for _ in 0..counts.qdcount() {
        parser.skip_name()?;
        parser.advance(4)?; // TYPE, CLASS
    }

    let ancount = counts.ancount();
    if ancount == 0 {
        return negative_ttl(answer, parser, counts.nscount());
    }

    let mut result = 0;
    for n in 0..ancount {
        parser.skip_name()?;
        parser.advance(4)?; // TYPE, CLASS
        let ttl = parser.parse_u32()?;
        let rdlength = parser.parse_u16()? as usize;
        parser.advance(rdlength)?;
        if n == 0 || ttl < result {
            result = ttl;
        }
    }
    Ok(result)
}

/// Finds the TTL for a negative answer from the authority section.
///
/// Returns 0 if no usable SOA record is present.
fn negative_ttl(
    answer: &[u8],
    mut parser: Parser<'_>,
    nscount: u16,
) -> Result<u32, ParseError> {
    let mut result = 0;
    let mut found = false;
    for _ in 0..nscount {
        parser.skip_name()?;
        let rtype = Rtype::from_int(parser.parse_u16()?);
        parser.advance(2)?; // CLASS
        let record_ttl = parser.parse_u32()?;
        let rdlength = parser.parse_u16()? as usize;
        let rdata_end =
            parser.pos.checked_add(rdlength).ok_or(ParseError)?;
        if rdata_end > answer.len() {
            return Err(ParseError);
        }
        if rtype == Rtype::SOA {
            // MNAME and RNAME, then exactly the five 32 bit fields of
            // which MINIMUM is the last.
            let mut rdata = parser;
            if rdata.skip_soa_name(rdata_end).is_ok()
                && rdata.skip_soa_name(rdata_end).is_ok()
                && rdata_end - rdata.pos == 5 * 4
            {
                rdata.advance(4 * 4)?;
                let minimum = rdata.parse_u32()?;
                let record_result = record_ttl.min(minimum);
                if !found || record_result < result {
                    result = record_result;
                }
                found = true;
            }
        }
        parser.pos = rdata_end;
    }
    Ok(result)
}

impl Parser<'_> {
    /// Skips a name inside SOA rdata, bounded by the rdata end.
    fn skip_soa_name(&mut self, rdata_end: usize) -> Result<(), ParseError> {
        let mut limited = Parser {
            octets: &self.octets[..rdata_end],
            pos: self.pos,
        };
        limited.skip_name()?;
        self.pos = limited.pos;
        Ok(())
    }
}

//------------ Query/response matching ---------------------------------------

/// The longest domain name, in wire format octets.
const MAX_NAME_LEN: usize = 255;

/// Expands a possibly compressed name into lowercase wire format.
///
/// Returns the canonical name octets and the position directly behind the
/// name's in-place representation.
fn expand_name(
    msg: &[u8],
    mut pos: usize,
) -> Result<(Vec<u8>, usize), ParseError> {
    let mut name = Vec::new();
    let mut next = None;
    loop {
        if pos >= msg.len() {
            return Err(ParseError);
        }
        let len = msg[pos] as usize;
        if len & 0xC0 == 0xC0 {
            if pos + 1 >= msg.len() {
                return Err(ParseError);
            }
            let target = (len & 0x3F) << 8 | msg[pos + 1] as usize;
            if next.is_none() {
                next = Some(pos + 2);
            }
            // Pointers must go strictly backwards, which also bounds the
            // number of jumps.
            if target >= pos {
                return Err(ParseError);
            }
            pos = target;
            continue;
        }
        if len >= 64 {
            return Err(ParseError);
        }
        if pos + 1 + len > msg.len()
            || name.len() + 1 + len > MAX_NAME_LEN
        {
            return Err(ParseError);
        }
        name.push(len as u8);
        name.extend(
            msg[pos + 1..pos + 1 + len]
                .iter()
                .map(|c| c.to_ascii_lowercase()),
        );
        pos += 1 + len;
        if len == 0 {
            return Ok((name, next.unwrap_or(pos)));
        }
    }
}

/// Looks for the given question in the question section of a packet.
fn name_in_query(
    name: &[u8],
    rtype: u16,
    class: u16,
    msg: &[u8],
) -> Result<bool, ParseError> {
    if msg.len() < HEADER_LEN {
        return Err(ParseError);
    }
    let qdcount = HeaderCounts::for_message_slice(msg).qdcount();
    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        let (qname, next) = expand_name(msg, pos)?;
        if next + 4 > msg.len() {
            return Err(ParseError);
        }
        let qtype = u16::from_be_bytes([msg[next], msg[next + 1]]);
        let qclass = u16::from_be_bytes([msg[next + 2], msg[next + 3]]);
        pos = next + 4;
        if qtype == rtype && qclass == class && qname == name {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Returns whether a reply's question section matches the query's.
///
/// There must be a 1:1 mapping of (name, type, class) between the two
/// question sections. Names are compared case-insensitively after
/// decompression. Used by the send engine to reject answers that belong
/// to some other query, e.g. stale responses arriving on a reused socket.
pub(crate) fn queries_match(query: &[u8], reply: &[u8]) -> bool {
    match queries_match_impl(query, reply) {
        Ok(matched) => matched,
        Err(_) => false,
    }
}

/// Fallible body of [`queries_match`].
fn queries_match_impl(
    query: &[u8],
    reply: &[u8],
) -> Result<bool, ParseError> {
    if query.len() < HEADER_LEN || reply.len() < HEADER_LEN {
        return Err(ParseError);
    }

    // Replies to dynamic update packets carry only a header section.
    const OPCODE_UPDATE: u8 = 5;
    if Header::for_message_slice(query).opcode() == OPCODE_UPDATE
        && Header::for_message_slice(reply).opcode() == OPCODE_UPDATE
    {
        return Ok(true);
    }

    let qdcount = HeaderCounts::for_message_slice(query).qdcount();
    if qdcount != HeaderCounts::for_message_slice(reply).qdcount() {
        return Ok(false);
    }

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        let (name, next) = expand_name(query, pos)?;
        if next + 4 > query.len() {
            return Err(ParseError);
        }
        let rtype = u16::from_be_bytes([query[next], query[next + 1]]);
        let class = u16::from_be_bytes([query[next + 2], query[next + 3]]);
        pos = next + 4;
        if !name_in_query(&name, rtype, class, reply)? {
            return Ok(false);
        }
    }
    Ok(true)
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{mk_answer, mk_query, mk_soa_answer, AnswerRec};

    #[test]
    fn rejects_short_and_response_packets() {
        assert!(!is_cacheable_query(&[]));
        assert!(!is_cacheable_query(&[0; 11]));

        let mut query = mk_query("hello.example.com.", Rtype::A, 0x1234);
        assert!(is_cacheable_query(&query));
        query[2] |= 0x80; // QR
        assert!(!is_cacheable_query(&query));
    }

    #[test]
    fn rejects_unsupported_questions() {
        // TXT is not in the supported type set.
        let query = mk_query("hello.example.com.", Rtype::from_int(16), 1);
        assert!(!is_cacheable_query(&query));

        // CLASS CH.
        let mut query = mk_query("hello.example.com.", Rtype::A, 1);
        let class_at = query.len() - 1;
        query[class_at] = 3;
        assert!(!is_cacheable_query(&query));

        // Compressed QNAME.
        let mut query = mk_query("hello.example.com.", Rtype::A, 1);
        query[12] = 0xC0;
        assert!(!is_cacheable_query(&query));
    }

    #[test]
    fn rejects_non_query_counts() {
        let mut query = mk_query("hello.example.com.", Rtype::A, 1);
        query[7] = 1; // ANCOUNT
        assert!(!is_cacheable_query(&query));

        let mut query = mk_query("hello.example.com.", Rtype::A, 1);
        query[11] = 2; // ARCOUNT
        assert!(!is_cacheable_query(&query));

        let mut query = mk_query("hello.example.com.", Rtype::A, 1);
        query[5] = 0; // QDCOUNT
        assert!(!is_cacheable_query(&query));
    }

    #[test]
    fn fingerprint_ignores_id_and_tc() {
        let query = mk_query("hello.example.com.", Rtype::A, 0x1111);
        let hash = fingerprint(&query).unwrap();

        let mut other = query.clone();
        other[0] = 0xAB;
        other[1] = 0xCD;
        assert_eq!(fingerprint(&other).unwrap(), hash);
        assert!(queries_equal(&query, &other));

        let mut other = query.clone();
        other[2] |= 0x02; // TC
        assert_eq!(fingerprint(&other).unwrap(), hash);
        assert!(queries_equal(&query, &other));
    }

    #[test]
    fn fingerprint_covers_flags_and_records() {
        let query = mk_query("hello.example.com.", Rtype::A, 1);
        let hash = fingerprint(&query).unwrap();

        // RD.
        let mut other = query.clone();
        other[2] ^= 0x01;
        assert_ne!(fingerprint(&other).unwrap(), hash);
        assert!(!queries_equal(&query, &other));

        // AD and CD live in the second flag byte.
        for bit in [0x20, 0x10] {
            let mut other = query.clone();
            other[3] ^= bit;
            assert_ne!(fingerprint(&other).unwrap(), hash);
            assert!(!queries_equal(&query, &other));
        }

        // Another question.
        let other = mk_query("hello.example.org.", Rtype::A, 1);
        assert_ne!(fingerprint(&other).unwrap(), hash);
        assert!(!queries_equal(&query, &other));

        // Same name, different type.
        let other = mk_query("hello.example.com.", Rtype::AAAA, 1);
        assert_ne!(fingerprint(&other).unwrap(), hash);
        assert!(!queries_equal(&query, &other));
    }

    #[test]
    fn name_case_is_significant_for_equality() {
        // The cache treats differently encoded names as distinct keys.
        let lower = mk_query("hello.example.com.", Rtype::A, 1);
        let upper = mk_query("HELLO.example.com.", Rtype::A, 1);
        assert!(!queries_equal(&lower, &upper));
    }

    #[test]
    fn min_ttl_of_positive_answer() {
        let query = mk_query("hello.example.com.", Rtype::A, 1);
        let answer = mk_answer(
            &query,
            &[
                AnswerRec::a([1, 2, 3, 4], 300),
                AnswerRec::a([1, 2, 3, 5], 60),
                AnswerRec::a([1, 2, 3, 6], 600),
            ],
        );
        assert_eq!(answer_min_ttl(&answer), 60);
    }

    #[test]
    fn min_ttl_of_negative_answer_uses_soa() {
        let query = mk_query("hello.example.com.", Rtype::A, 1);

        // SOA TTL 600, MINIMUM 300: RFC 2308 takes the smaller.
        let answer = mk_soa_answer(&query, 600, 300);
        assert_eq!(answer_min_ttl(&answer), 300);

        let answer = mk_soa_answer(&query, 120, 86400);
        assert_eq!(answer_min_ttl(&answer), 120);
    }

    #[test]
    fn min_ttl_of_unparseable_answer_is_zero() {
        assert_eq!(answer_min_ttl(&[0; 4]), 0);

        let query = mk_query("hello.example.com.", Rtype::A, 1);
        let mut answer =
            mk_answer(&query, &[AnswerRec::a([1, 2, 3, 4], 300)]);
        answer.truncate(answer.len() - 3);
        assert_eq!(answer_min_ttl(&answer), 0);

        // No answers and no SOA either.
        let answer = mk_answer(&query, &[]);
        assert_eq!(answer_min_ttl(&answer), 0);
    }

    #[test]
    fn matching_accepts_case_folded_and_compressed_replies() {
        let query = mk_query("hello.example.com.", Rtype::A, 7);
        let reply = mk_answer(&query, &[AnswerRec::a([1, 2, 3, 4], 60)]);
        assert!(queries_match(&query, &reply));

        // The same reply with the question name in upper case.
        let upper = mk_query("HELLO.EXAMPLE.COM.", Rtype::A, 7);
        let reply = mk_answer(&upper, &[AnswerRec::a([1, 2, 3, 4], 60)]);
        assert!(queries_match(&query, &reply));

        // A reply for a different name does not match.
        let other = mk_query("bye.example.com.", Rtype::A, 7);
        let reply = mk_answer(&other, &[AnswerRec::a([1, 2, 3, 4], 60)]);
        assert!(!queries_match(&query, &reply));

        // Neither does one for a different type.
        let other = mk_query("hello.example.com.", Rtype::AAAA, 7);
        let reply = mk_answer(&other, &[]);
        assert!(!queries_match(&query, &reply));
    }
}
