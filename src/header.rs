//! The header of a DNS message.
//!
//! Each DNS message starts with a twelve octet header containing general
//! information about the message as well as the number of records in each
//! of the four sections that follow. Its content and format are defined in
//! section 4.1.1 of [RFC 1035].
//!
//! The resolver core never builds messages from scratch; it reads and
//! occasionally patches headers of packets it carries around as raw octets.
//! The header is therefore split into two thin views over those octets:
//! [`Header`] for the ID and flag fields at the start and [`HeaderCounts`]
//! for the section counts.
//!
//! [RFC 1035]: https://tools.ietf.org/html/rfc1035

use crate::iana::Rcode;
use core::mem;

//------------ Header --------------------------------------------------------

/// The first part of the header of a DNS message.
///
/// This type represents the information contained in the first four octets
/// of the header: the message ID, opcode, rcode, and the various flags, all
/// kept in wire representation. The data is layed out like this:
///
/// ```text
///                                 1  1  1  1  1  1
///   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |                      ID                       |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// |QR|   Opcode  |AA|TC|RD|RA|Z |AD|CD|   RCODE   |
/// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// Values are normally used as references into the octets of an actual
/// message, created via [`for_message_slice`][Self::for_message_slice] and
/// [`for_message_slice_mut`][Self::for_message_slice_mut].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct Header {
    /// The actual header in its wire format representation.
    ///
    /// This means that the ID field is in big endian.
    inner: [u8; 4],
}

/// # Creation and Conversion
///
impl Header {
    /// Creates a header reference from an octets slice of a message.
    ///
    /// # Panics
    ///
    /// This function panics if the slice is less than four octets long.
    pub fn for_message_slice(s: &[u8]) -> &Header {
        assert!(s.len() >= mem::size_of::<Header>());
        // SAFETY: the length is asserted above and Header is a transparent
        // wrapper around [u8; 4].
        unsafe { &*(s.as_ptr() as *const Header) }
    }

    /// Creates a mutable header reference from an octets slice of a message.
    ///
    /// # Panics
    ///
    /// This function panics if the slice is less than four octets long.
    pub fn for_message_slice_mut(s: &mut [u8]) -> &mut Header {
        assert!(s.len() >= mem::size_of::<Header>());
        // SAFETY: see `for_message_slice`.
        unsafe { &mut *(s.as_mut_ptr() as *mut Header) }
    }
}

/// # Field Access
///
impl Header {
    /// Returns the value of the ID field.
    ///
    /// The ID field is an identifier chosen by whoever created a query
    /// and is copied into a response by a server. It allows matching
    /// incoming responses to their queries.
    pub fn id(self) -> u16 {
        u16::from_be_bytes([self.inner[0], self.inner[1]])
    }

    /// Sets the value of the ID field.
    pub fn set_id(&mut self, value: u16) {
        self.inner[..2].copy_from_slice(&value.to_be_bytes())
    }

    /// Sets the value of the ID field to a randomly chosen number.
    pub fn set_random_id(&mut self) {
        self.set_id(::rand::random())
    }

    /// Returns whether the QR bit is set.
    ///
    /// The bit is `false` in queries and `true` in responses.
    pub fn qr(self) -> bool {
        self.get_bit(2, 7)
    }

    /// Returns the raw value of the Opcode field.
    pub fn opcode(self) -> u8 {
        (self.inner[2] >> 3) & 0x0F
    }

    /// Returns whether the AA (authoritative answer) bit is set.
    pub fn aa(self) -> bool {
        self.get_bit(2, 2)
    }

    /// Returns whether the TC (truncation) bit is set.
    pub fn tc(self) -> bool {
        self.get_bit(2, 1)
    }

    /// Sets the value of the TC bit.
    pub fn set_tc(&mut self, set: bool) {
        self.set_bit(2, 1, set)
    }

    /// Returns whether the RD (recursion desired) bit is set.
    pub fn rd(self) -> bool {
        self.get_bit(2, 0)
    }

    /// Sets the value of the RD bit.
    pub fn set_rd(&mut self, set: bool) {
        self.set_bit(2, 0, set)
    }

    /// Returns whether the RA (recursion available) bit is set.
    pub fn ra(self) -> bool {
        self.get_bit(3, 7)
    }

    /// Returns whether the reserved Z bit is set.
    ///
    /// This bit must be `false` in all queries and responses.
    pub fn z(self) -> bool {
        self.get_bit(3, 6)
    }

    /// Returns whether the AD (authentic data) bit is set.
    pub fn ad(self) -> bool {
        self.get_bit(3, 5)
    }

    /// Returns whether the CD (checking disabled) bit is set.
    pub fn cd(self) -> bool {
        self.get_bit(3, 4)
    }

    /// Returns the value of the RCODE field.
    pub fn rcode(self) -> Rcode {
        Rcode::from_int(self.inner[3] & 0x0F)
    }

    /// Returns the value of the bit at the given position.
    ///
    /// The argument `offset` gives the byte offset of the underlying octets
    /// and `bit` gives the number of the bit with the most significant bit
    /// being 7.
    fn get_bit(self, offset: usize, bit: usize) -> bool {
        self.inner[offset] & (1 << bit) != 0
    }

    /// Sets or resets the given bit.
    fn set_bit(&mut self, offset: usize, bit: usize, set: bool) {
        if set {
            self.inner[offset] |= 1 << bit
        } else {
            self.inner[offset] &= !(1 << bit)
        }
    }
}

//------------ HeaderCounts --------------------------------------------------

/// The section count part of the header of a DNS message.
///
/// This part consists of four 16 bit counters for the number of entries in
/// the four sections of a DNS message, kept in wire representation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct HeaderCounts {
    /// The actual counts in their wire format representation.
    inner: [u8; 8],
}

/// # Creation and Conversion
///
impl HeaderCounts {
    /// Creates a counts reference from an octets slice of a message.
    ///
    /// The slice `message` must be the whole message, i.e., start with the
    /// bytes of the [`Header`].
    ///
    /// # Panics
    ///
    /// This function panics if the octets slice is shorter than the entire
    /// header section.
    pub fn for_message_slice(message: &[u8]) -> &Self {
        assert!(
            message.len()
                >= mem::size_of::<Header>() + mem::size_of::<HeaderCounts>()
        );
        // SAFETY: the length is asserted above and HeaderCounts is a
        // transparent wrapper around [u8; 8].
        unsafe {
            &*((message[mem::size_of::<Header>()..].as_ptr())
                as *const HeaderCounts)
        }
    }
}

/// # Field Access
///
impl HeaderCounts {
    /// Returns the value of the QDCOUNT field.
    ///
    /// This field contains the number of questions in the first section of
    /// the message, normally the question section.
    pub fn qdcount(self) -> u16 {
        self.get_u16(0)
    }

    /// Returns the value of the ANCOUNT field.
    ///
    /// This field contains the number of resource records in the second
    /// section of the message, normally the answer section.
    pub fn ancount(self) -> u16 {
        self.get_u16(2)
    }

    /// Returns the value of the NSCOUNT field.
    ///
    /// This field contains the number of resource records in the third
    /// section of the message, normally the authority section.
    pub fn nscount(self) -> u16 {
        self.get_u16(4)
    }

    /// Returns the value of the ARCOUNT field.
    ///
    /// This field contains the number of resource records in the fourth
    /// section of the message, normally the additional section.
    pub fn arcount(self) -> u16 {
        self.get_u16(6)
    }

    /// Returns the value of the 16 bit integer starting at a given offset.
    fn get_u16(self, offset: usize) -> u16 {
        u16::from_be_bytes([self.inner[offset], self.inner[offset + 1]])
    }
}

//============ Testing =======================================================
