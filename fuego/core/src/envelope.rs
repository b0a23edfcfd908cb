// Copyright (c) 2024 Botho Foundation

//! Transaction envelope codec.
//!
//! An envelope is laid out as
//!
//! ```text
//! [shortvec sig_count][sig_count x 64-byte signature slots][message]
//! ```
//!
//! and the message as
//!
//! ```text
//! [0x80 | version]?            only for versioned messages
//! [3-byte header]
//! [shortvec key_count][key_count x 32-byte keys]
//! [32-byte recent anchor]
//! [shortvec ix_count][instructions]
//! [shortvec lookup_count][address table lookups]   versioned only
//! ```
//!
//! The anchor sits at a variable offset. Everything that needs that offset
//! goes through [`locate_anchor`], and [`substitute_anchor`] is the only
//! place builder-supplied message bytes are ever rewritten.

use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

use crate::{
    keys::{Anchor, Identity, Signature, ANCHOR_LEN, IDENTITY_LEN, SIGNATURE_LEN},
    shortvec::{self, ShortVecError},
};

/// High bit of the first message byte marks a versioned message.
pub const MESSAGE_VERSION_PREFIX: u8 = 0x80;

/// Length of the fixed message header.
pub const MESSAGE_HEADER_LEN: usize = 3;

/// Smallest envelope that can be valid: one signature slot, a header, one
/// account key, the anchor and an empty instruction list.
pub const MIN_ENVELOPE_LEN: usize =
    1 + SIGNATURE_LEN + MESSAGE_HEADER_LEN + 1 + IDENTITY_LEN + ANCHOR_LEN + 1;

/// Account indexes are a single byte, so a message can address at most 256
/// keys including those loaded through lookup tables.
const MAX_ADDRESSABLE_KEYS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("buffer too short: {actual} bytes, need at least {needed}")]
    TooShort { needed: usize, actual: usize },

    #[error("malformed length prefix: {0}")]
    ShortVec(#[from] ShortVecError),

    #[error("truncated {section} at offset {offset}")]
    Truncated {
        section: &'static str,
        offset: usize,
    },

    #[error("envelope carries {slots} signature slots but the message requires {required}")]
    SignatureCount { slots: usize, required: usize },

    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("invalid message header: {0}")]
    InvalidHeader(&'static str),

    #[error("instruction {instruction} references account index {index} but only {available} keys are addressable")]
    AccountIndex {
        instruction: usize,
        index: u8,
        available: usize,
    },

    #[error("{section} has {len} entries, more than the wire format allows")]
    TooLong { section: &'static str, len: usize },

    #[error("invalid base64 envelope")]
    Base64,

    #[error("{0} is not a required signer of this message")]
    NotRequiredSigner(Identity),
}

/// The three counts that precede the account keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Number of leading account keys that must sign.
    pub num_required_signatures: u8,
    /// How many of the signing keys are read-only.
    pub num_readonly_signed: u8,
    /// How many of the trailing non-signing keys are read-only.
    pub num_readonly_unsigned: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledInstruction {
    pub program_id_index: u8,
    pub accounts: Vec<u8>,
    pub data: Vec<u8>,
}

/// Reference to an on-ledger address table (versioned messages only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTableLookup {
    pub account_key: Identity,
    pub writable_indexes: Vec<u8>,
    pub readonly_indexes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMessage {
    pub header: MessageHeader,
    pub account_keys: Vec<Identity>,
    pub recent_anchor: Anchor,
    pub instructions: Vec<CompiledInstruction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedMessage {
    /// Low seven bits of the prefix byte. Only `0` is understood.
    pub version: u8,
    pub header: MessageHeader,
    pub account_keys: Vec<Identity>,
    pub recent_anchor: Anchor,
    pub instructions: Vec<CompiledInstruction>,
    pub address_table_lookups: Vec<AddressTableLookup>,
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Legacy(LegacyMessage),
    Versioned(VersionedMessage),
}

impl MessageBody {
    /// Parse a complete message. Trailing bytes are an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let (message, consumed) = parse_message(bytes)?;
        if consumed != bytes.len() {
            return Err(EnvelopeError::TrailingBytes(bytes.len() - consumed));
        }
        Ok(message)
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            MessageBody::Legacy(m) => &m.header,
            MessageBody::Versioned(m) => &m.header,
        }
    }

    pub fn account_keys(&self) -> &[Identity] {
        match self {
            MessageBody::Legacy(m) => &m.account_keys,
            MessageBody::Versioned(m) => &m.account_keys,
        }
    }

    pub fn recent_anchor(&self) -> &Anchor {
        match self {
            MessageBody::Legacy(m) => &m.recent_anchor,
            MessageBody::Versioned(m) => &m.recent_anchor,
        }
    }

    pub fn instructions(&self) -> &[CompiledInstruction] {
        match self {
            MessageBody::Legacy(m) => &m.instructions,
            MessageBody::Versioned(m) => &m.instructions,
        }
    }

    pub fn address_table_lookups(&self) -> &[AddressTableLookup] {
        match self {
            MessageBody::Legacy(_) => &[],
            MessageBody::Versioned(m) => &m.address_table_lookups,
        }
    }

    /// Message version, `None` for legacy messages.
    pub fn version(&self) -> Option<u8> {
        match self {
            MessageBody::Legacy(_) => None,
            MessageBody::Versioned(m) => Some(m.version),
        }
    }

    pub fn is_versioned(&self) -> bool {
        matches!(self, MessageBody::Versioned(_))
    }

    /// Keys whose signatures the message requires, in slot order.
    pub fn required_signers(&self) -> &[Identity] {
        let required = self.header().num_required_signatures as usize;
        let keys = self.account_keys();
        &keys[..required.min(keys.len())]
    }

    /// Slot index for `identity`, if it is a required signer.
    pub fn signer_index(&self, identity: &Identity) -> Option<usize> {
        self.required_signers().iter().position(|k| k == identity)
    }

    /// Copy of this message carrying `anchor`, produced through the same
    /// byte-level substitution applied to builder envelopes.
    pub fn with_anchor(&self, anchor: &Anchor) -> Result<Self, EnvelopeError> {
        Self::from_bytes(&substitute_anchor(&self.serialize(), anchor)?)
    }

    /// Structural checks applied to every decoded or constructed message.
    pub fn sanitize(&self) -> Result<(), EnvelopeError> {
        if let MessageBody::Versioned(m) = self {
            if m.version != 0 {
                return Err(EnvelopeError::UnsupportedVersion(m.version));
            }
        }

        let header = self.header();
        let key_count = self.account_keys().len();

        if header.num_required_signatures == 0 {
            return Err(EnvelopeError::InvalidHeader("no required signers"));
        }
        if header.num_readonly_signed >= header.num_required_signatures {
            return Err(EnvelopeError::InvalidHeader(
                "every signer is read-only, no fee payer",
            ));
        }
        if header.num_required_signatures as usize + header.num_readonly_unsigned as usize
            > key_count
        {
            return Err(EnvelopeError::InvalidHeader(
                "header counts exceed the number of account keys",
            ));
        }

        let looked_up: usize = self
            .address_table_lookups()
            .iter()
            .map(|l| l.writable_indexes.len() + l.readonly_indexes.len())
            .sum();
        let available = key_count + looked_up;
        if available > MAX_ADDRESSABLE_KEYS {
            return Err(EnvelopeError::TooLong {
                section: "account keys",
                len: available,
            });
        }

        for (i, ix) in self.instructions().iter().enumerate() {
            let out_of_range = std::iter::once(&ix.program_id_index)
                .chain(ix.accounts.iter())
                .find(|&&index| index as usize >= available);
            if let Some(&index) = out_of_range {
                return Err(EnvelopeError::AccountIndex {
                    instruction: i,
                    index,
                    available,
                });
            }
            check_len("instruction data", ix.data.len())?;
            check_len("instruction accounts", ix.accounts.len())?;
        }
        check_len("instructions", self.instructions().len())?;

        for lookup in self.address_table_lookups() {
            check_len("writable indexes", lookup.writable_indexes.len())?;
            check_len("readonly indexes", lookup.readonly_indexes.len())?;
        }
        check_len("address table lookups", self.address_table_lookups().len())?;

        Ok(())
    }

    /// Wire bytes of a sanitized message.
    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(version) = self.version() {
            out.push(MESSAGE_VERSION_PREFIX | version);
        }

        let header = self.header();
        out.push(header.num_required_signatures);
        out.push(header.num_readonly_signed);
        out.push(header.num_readonly_unsigned);

        write_len(self.account_keys().len(), &mut out);
        for key in self.account_keys() {
            out.extend_from_slice(key.as_bytes());
        }

        out.extend_from_slice(self.recent_anchor().as_bytes());

        write_len(self.instructions().len(), &mut out);
        for ix in self.instructions() {
            out.push(ix.program_id_index);
            write_bytes(&ix.accounts, &mut out);
            write_bytes(&ix.data, &mut out);
        }

        if self.is_versioned() {
            write_len(self.address_table_lookups().len(), &mut out);
            for lookup in self.address_table_lookups() {
                out.extend_from_slice(lookup.account_key.as_bytes());
                write_bytes(&lookup.writable_indexes, &mut out);
                write_bytes(&lookup.readonly_indexes, &mut out);
            }
        }

        out
    }
}

fn check_len(section: &'static str, len: usize) -> Result<(), EnvelopeError> {
    if len > u16::MAX as usize {
        return Err(EnvelopeError::TooLong { section, len });
    }
    Ok(())
}

// Lengths reaching here have passed `sanitize`.
fn write_len(len: usize, out: &mut Vec<u8>) {
    shortvec::encode_len(len as u16, out);
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    write_len(bytes.len(), out);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, n: usize, section: &'static str) -> Result<&'a [u8], EnvelopeError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(EnvelopeError::Truncated {
                section,
                offset: self.offset,
            })?;
        let out = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    fn u8(&mut self, section: &'static str) -> Result<u8, EnvelopeError> {
        Ok(self.take(1, section)?[0])
    }

    fn array<const N: usize>(&mut self, section: &'static str) -> Result<[u8; N], EnvelopeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, section)?);
        Ok(out)
    }

    fn len(&mut self) -> Result<usize, EnvelopeError> {
        let (value, consumed) = shortvec::decode_len(self.bytes, self.offset)?;
        self.offset += consumed;
        Ok(value as usize)
    }

    fn bytes(&mut self, section: &'static str) -> Result<Vec<u8>, EnvelopeError> {
        let n = self.len()?;
        Ok(self.take(n, section)?.to_vec())
    }
}

fn parse_version(first: u8) -> Result<Option<u8>, EnvelopeError> {
    if first & MESSAGE_VERSION_PREFIX == 0 {
        return Ok(None);
    }
    match first & !MESSAGE_VERSION_PREFIX {
        0 => Ok(Some(0)),
        other => Err(EnvelopeError::UnsupportedVersion(other)),
    }
}

/// Parse one message from the front of `bytes`, returning it with the number
/// of bytes consumed.
fn parse_message(bytes: &[u8]) -> Result<(MessageBody, usize), EnvelopeError> {
    let mut r = Reader::new(bytes);

    let first = *bytes.first().ok_or(EnvelopeError::Truncated {
        section: "message header",
        offset: 0,
    })?;
    let version = parse_version(first)?;
    if version.is_some() {
        r.offset = 1;
    }

    let header = MessageHeader {
        num_required_signatures: r.u8("message header")?,
        num_readonly_signed: r.u8("message header")?,
        num_readonly_unsigned: r.u8("message header")?,
    };

    let key_count = r.len()?;
    let account_keys = (0..key_count)
        .map(|_| r.array::<IDENTITY_LEN>("account keys").map(Identity::new))
        .collect::<Result<Vec<_>, _>>()?;

    let recent_anchor = Anchor::new(r.array::<ANCHOR_LEN>("recent anchor")?);

    let ix_count = r.len()?;
    let instructions = (0..ix_count)
        .map(|_| -> Result<CompiledInstruction, EnvelopeError> {
            Ok(CompiledInstruction {
                program_id_index: r.u8("instruction")?,
                accounts: r.bytes("instruction accounts")?,
                data: r.bytes("instruction data")?,
            })
        })
        .collect::<Result<Vec<_>, EnvelopeError>>()?;

    let message = match version {
        None => MessageBody::Legacy(LegacyMessage {
            header,
            account_keys,
            recent_anchor,
            instructions,
        }),
        Some(version) => {
            let lookup_count = r.len()?;
            let address_table_lookups = (0..lookup_count)
                .map(|_| -> Result<AddressTableLookup, EnvelopeError> {
                    Ok(AddressTableLookup {
                        account_key: Identity::new(r.array::<IDENTITY_LEN>("address table lookup")?),
                        writable_indexes: r.bytes("writable indexes")?,
                        readonly_indexes: r.bytes("readonly indexes")?,
                    })
                })
                .collect::<Result<Vec<_>, EnvelopeError>>()?;
            MessageBody::Versioned(VersionedMessage {
                version,
                header,
                account_keys,
                recent_anchor,
                instructions,
                address_table_lookups,
            })
        }
    };

    message.sanitize()?;
    Ok((message, r.offset))
}

/// Offset of the recent anchor within serialized message bytes.
///
/// Walks the optional version prefix, the header and the account key list.
/// The full 32-byte anchor must be present at the returned offset.
pub fn locate_anchor(message_bytes: &[u8]) -> Result<usize, EnvelopeError> {
    let first = *message_bytes.first().ok_or(EnvelopeError::Truncated {
        section: "message header",
        offset: 0,
    })?;
    let mut offset = match parse_version(first)? {
        Some(_) => 1,
        None => 0,
    };

    offset += MESSAGE_HEADER_LEN;
    if message_bytes.len() < offset {
        return Err(EnvelopeError::Truncated {
            section: "message header",
            offset: message_bytes.len(),
        });
    }

    let (key_count, consumed) = shortvec::decode_len(message_bytes, offset)?;
    offset += consumed + key_count as usize * IDENTITY_LEN;

    if message_bytes.len() < offset + ANCHOR_LEN {
        return Err(EnvelopeError::Truncated {
            section: "recent anchor",
            offset: offset.min(message_bytes.len()),
        });
    }
    Ok(offset)
}

/// Copy of `message_bytes` with the 32 anchor bytes replaced. No other byte
/// changes.
pub fn substitute_anchor(message_bytes: &[u8], anchor: &Anchor) -> Result<Vec<u8>, EnvelopeError> {
    let offset = locate_anchor(message_bytes)?;
    let mut out = message_bytes.to_vec();
    out[offset..offset + ANCHOR_LEN].copy_from_slice(anchor.as_bytes());
    Ok(out)
}

fn write_envelope(slots: &[Signature], message_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        shortvec::MAX_ENCODING_LENGTH + slots.len() * SIGNATURE_LEN + message_bytes.len(),
    );
    // Slot count equals num_required_signatures, a u8.
    shortvec::encode_len(slots.len() as u16, &mut out);
    for slot in slots {
        out.extend_from_slice(slot.as_bytes());
    }
    out.extend_from_slice(message_bytes);
    out
}

/// An envelope as received from the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEnvelope {
    signature_slots: Vec<Signature>,
    message: MessageBody,
}

impl UnsignedEnvelope {
    /// Wrap a message with one empty slot per required signer.
    pub fn new(message: MessageBody) -> Result<Self, EnvelopeError> {
        message.sanitize()?;
        let slots = message.header().num_required_signatures as usize;
        Ok(Self {
            signature_slots: vec![Signature::EMPTY; slots],
            message,
        })
    }

    pub fn signature_slots(&self) -> &[Signature] {
        &self.signature_slots
    }

    pub fn message(&self) -> &MessageBody {
        &self.message
    }

    pub fn message_bytes(&self) -> Vec<u8> {
        self.message.serialize()
    }

    /// Replace the anchor, producing the only value that can be signed.
    ///
    /// Signature slots are cleared since any existing signature covered the
    /// old anchor.
    pub fn substitute_anchor(&self, anchor: &Anchor) -> Result<AnchoredEnvelope, EnvelopeError> {
        let message_bytes = substitute_anchor(&self.message.serialize(), anchor)?;
        let message = MessageBody::from_bytes(&message_bytes)?;
        Ok(AnchoredEnvelope {
            signature_slots: vec![Signature::EMPTY; self.signature_slots.len()],
            message,
            message_bytes,
        })
    }
}

/// Decode an envelope.
pub fn decode(bytes: &[u8]) -> Result<UnsignedEnvelope, EnvelopeError> {
    if bytes.len() < MIN_ENVELOPE_LEN {
        return Err(EnvelopeError::TooShort {
            needed: MIN_ENVELOPE_LEN,
            actual: bytes.len(),
        });
    }

    let (sig_count, prefix_len) = shortvec::decode_len(bytes, 0)?;
    let mut r = Reader::new(bytes);
    r.offset = prefix_len;
    let signature_slots = (0..sig_count)
        .map(|_| r.array::<SIGNATURE_LEN>("signatures").map(Signature::new))
        .collect::<Result<Vec<_>, _>>()?;

    let message_start = r.offset;
    let (message, consumed) = parse_message(&bytes[message_start..])?;
    let end = message_start + consumed;
    if end != bytes.len() {
        return Err(EnvelopeError::TrailingBytes(bytes.len() - end));
    }

    let required = message.header().num_required_signatures as usize;
    if signature_slots.len() != required {
        return Err(EnvelopeError::SignatureCount {
            slots: signature_slots.len(),
            required,
        });
    }

    Ok(UnsignedEnvelope {
        signature_slots,
        message,
    })
}

/// Decode a base64 envelope, the form builders return.
pub fn decode_base64(text: &str) -> Result<UnsignedEnvelope, EnvelopeError> {
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|_| EnvelopeError::Base64)?;
    decode(&bytes)
}

/// Encode an envelope. Byte-identical to the input of [`decode`].
pub fn encode(envelope: &UnsignedEnvelope) -> Vec<u8> {
    write_envelope(&envelope.signature_slots, &envelope.message.serialize())
}

/// An envelope whose anchor has been replaced and which is ready to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchoredEnvelope {
    signature_slots: Vec<Signature>,
    message: MessageBody,
    message_bytes: Vec<u8>,
}

impl AnchoredEnvelope {
    /// The exact bytes a signature must cover.
    pub fn message_bytes(&self) -> &[u8] {
        &self.message_bytes
    }

    pub fn message(&self) -> &MessageBody {
        &self.message
    }

    pub fn anchor(&self) -> &Anchor {
        self.message.recent_anchor()
    }

    /// Place `signature` in the slot belonging to `signer`.
    pub fn attach_signature(
        self,
        signer: &Identity,
        signature: Signature,
    ) -> Result<SignedEnvelope, EnvelopeError> {
        let index = self
            .message
            .signer_index(signer)
            .ok_or(EnvelopeError::NotRequiredSigner(*signer))?;
        let mut signature_slots = self.signature_slots;
        signature_slots[index] = signature;
        Ok(SignedEnvelope {
            signature_slots,
            message: self.message,
            message_bytes: self.message_bytes,
        })
    }
}

/// An envelope carrying at least the local signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    signature_slots: Vec<Signature>,
    message: MessageBody,
    message_bytes: Vec<u8>,
}

impl SignedEnvelope {
    pub fn message(&self) -> &MessageBody {
        &self.message
    }

    pub fn message_bytes(&self) -> &[u8] {
        &self.message_bytes
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signature_slots
    }

    /// Signature of the fee payer, which is also the transaction id.
    pub fn transaction_id(&self) -> &Signature {
        &self.signature_slots[0]
    }

    pub fn is_versioned(&self) -> bool {
        self.message.is_versioned()
    }

    /// Whether every required signer has signed. A payment envelope with an
    /// external fee payer stays partial until that party co-signs.
    pub fn is_fully_signed(&self) -> bool {
        self.signature_slots.iter().all(|s| !s.is_empty())
    }

    /// Required signers whose slot is still empty.
    pub fn missing_signers(&self) -> Vec<Identity> {
        self.message
            .required_signers()
            .iter()
            .zip(&self.signature_slots)
            .filter(|(_, sig)| sig.is_empty())
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        write_envelope(&self.signature_slots, &self.message_bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }
}
