//! Connection machinery shared by client and server: datagram parsing,
//! record protection, reorder/defragment queues, flight retransmission and
//! the poll surface the embedder drives.

use std::cell::Cell;
use std::collections::VecDeque;
use std::mem;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::buffer::{Buf, BufferPool};
use crate::config::Config;
use crate::crypto::{self, Aad, AeadCipher, Iv, Nonce, AEAD_OVERHEAD};
use crate::error::{Error, RecordFault};
use crate::message::{
    Alert, ContentType, DtlsRecord, Handshake, Header, MessageType, ProtocolVersion, Sequence,
};
use crate::rng::SeededRng;
use crate::suite::CipherSuite;
use crate::timer::ExponentialBackoff;
use crate::window::ReplayWindow;
use crate::Output;

/// Cap on queued datagrams considered when looking for a complete handshake,
/// so a misbehaving peer cannot make us walk an endless queue.
const MAX_DEFRAGMENT_PACKETS: usize = 50;

/// Handshake fragments accepted from a single record.
const MAX_HANDSHAKES_PER_RECORD: usize = 8;

/// Largest plaintext fragment a record may carry.
pub(crate) const MAX_FRAGMENT_LEN: usize = 16384;

/// Ciphertext slack on top of `MAX_FRAGMENT_LEN` before a declared record
/// length is considered garbage.
const MAX_CIPHERTEXT_EXPANSION: usize = 2048;

/// Record sequence numbers are 48 bits on the wire.
const MAX_SEQUENCE_NUMBER: u64 = 1 << 48;

/// Returned as the next timeout when no timer is armed.
const DISTANT_FUTURE: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// A retransmission or deadline timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timeout {
    /// No timer wanted.
    Disabled,
    /// Timer wanted, but no time reference seen yet. Armed on the next
    /// `poll_output` or `handle_timeout`.
    Unarmed,
    Armed(Instant),
}

impl Timeout {
    fn at(&self) -> Option<Instant> {
        match self {
            Timeout::Armed(at) => Some(*at),
            _ => None,
        }
    }
}

/// One handshake fragment found inside a queued record. The range indexes
/// the body bytes in the record's buffer.
struct HandshakeFragment {
    header: Header,
    range: Range<usize>,
    handled: Cell<bool>,
}

/// A record accepted into the receive queue, decrypted where applicable.
struct Record {
    buffer: Buf,
    record: DtlsRecord,
    handshakes: SmallVec<[HandshakeFragment; 2]>,
    handled: Cell<bool>,
}

impl Record {
    fn is_handled(&self) -> bool {
        if self.handshakes.is_empty() {
            self.handled.get()
        } else {
            self.handshakes.iter().all(|h| h.handled.get())
        }
    }

    fn fragment(&self) -> &[u8] {
        &self.buffer[self.record.fragment_range.clone()]
    }
}

/// All records from one incoming datagram.
struct Incoming {
    records: Vec<Record>,
}

/// A record plaintext retained for flight retransmission.
struct FlightEntry {
    content_type: ContentType,
    epoch: u16,
    fragment: Buf,
}

pub(crate) struct Engine {
    /// Pool of buffers.
    buffers_free: BufferPool,

    rng: SeededRng,

    /// Counters for sending records, epoch 0 and the encrypted epoch.
    sequence_epoch_0: Sequence,
    sequence_epoch_n: Sequence,

    /// Incoming datagrams, ordered for in-sequence handshake consumption.
    queue_rx: VecDeque<Incoming>,

    /// Outgoing datagrams.
    queue_tx: VecDeque<Buf>,

    /// Raw records one epoch ahead of our read state, kept until our read
    /// keys take effect.
    pending_encrypted: Vec<Buf>,

    suite: Option<CipherSuite>,

    write_cipher: Option<AeadCipher>,
    write_iv: Iv,

    read_cipher: Option<AeadCipher>,
    read_iv: Iv,

    /// Epoch incoming records are expected to carry.
    read_epoch: u16,

    /// Anti-replay window for the current read epoch.
    replay: ReplayWindow,

    /// When the read epoch was last promoted; bounds the grace period for
    /// records still arriving under the previous epoch.
    promoted_at: Option<Instant>,

    /// Most recent time reference seen from the embedder.
    last_now: Option<Instant>,

    /// Sequence number for the next handshake message we send.
    next_handshake_seq_no: u16,

    /// Sequence number expected on the next handshake message we consume.
    peer_handshake_seq_no: u16,

    /// Running concatenation of all handshake messages, canonical
    /// (unfragmented) form, for Finished and CertificateVerify.
    transcript: Buf,

    /// Plaintext of the current flight for retransmission.
    flight_saved_records: Vec<FlightEntry>,

    flight_backoff: ExponentialBackoff,
    flight_timeout: Timeout,
    connect_timeout: Timeout,

    /// Bumped by `flight_begin`; a timer armed for an older generation
    /// re-arms instead of resending.
    flight_generation: u64,
    armed_generation: u64,

    /// True once the handshake completed and application data may flow out
    /// of `poll_output`.
    release_app_data: bool,

    /// A `Connected` event waiting to be polled.
    connected_pending: bool,

    config: Arc<Config>,
}

impl Engine {
    pub fn new(config: Arc<Config>) -> Self {
        let mut rng = SeededRng::new(config.rng_seed());
        let flight_backoff =
            ExponentialBackoff::new(config.flight_start_rto(), config.flight_retries(), &mut rng);

        Engine {
            buffers_free: BufferPool::default(),
            rng,
            sequence_epoch_0: Sequence::default(),
            sequence_epoch_n: Sequence {
                epoch: 1,
                sequence_number: 0,
            },
            queue_rx: VecDeque::new(),
            queue_tx: VecDeque::new(),
            pending_encrypted: Vec::new(),
            suite: None,
            write_cipher: None,
            write_iv: Iv([0; 4]),
            read_cipher: None,
            read_iv: Iv([0; 4]),
            read_epoch: 0,
            replay: ReplayWindow::new(),
            promoted_at: None,
            last_now: None,
            next_handshake_seq_no: 0,
            peer_handshake_seq_no: 0,
            transcript: Buf::new(),
            flight_saved_records: Vec::new(),
            flight_backoff,
            flight_timeout: Timeout::Disabled,
            connect_timeout: Timeout::Unarmed,
            flight_generation: 0,
            armed_generation: 0,
            release_app_data: false,
            connected_pending: false,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rng(&mut self) -> &mut SeededRng {
        &mut self.rng
    }

    pub fn set_cipher_suite(&mut self, suite: CipherSuite) {
        self.suite = Some(suite);
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.suite
    }

    /// The handshake messages exchanged so far, canonical form.
    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    /// Hash of the transcript under the negotiated suite's hash.
    pub fn transcript_hash(&self) -> Result<Vec<u8>, Error> {
        let Some(suite) = self.suite else {
            return Err(Error::CryptoError("no cipher suite negotiated".into()));
        };
        Ok(crypto::transcript_hash(&self.transcript, suite.hash_algorithm()))
    }

    // ------------------------------------------------------------------
    // Incoming

    /// Parse one datagram into records and queue them.
    ///
    /// Faulty records (truncation, bad MAC, replays, unknown epochs) are
    /// logged and dropped without touching connection state. Errors returned
    /// here are fatal for the connection.
    pub fn parse_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        let mut records = Vec::new();
        let mut offset = 0;

        while offset < packet.len() {
            let remaining = &packet[offset..];

            if remaining.len() < DtlsRecord::HEADER_LEN {
                debug!("Dropping rest of datagram: {}", RecordFault::Truncated);
                break;
            }

            let length_bytes = &remaining[DtlsRecord::LENGTH_OFFSET];
            let declared = u16::from_be_bytes([length_bytes[0], length_bytes[1]]) as usize;

            if declared > MAX_FRAGMENT_LEN + MAX_CIPHERTEXT_EXPANSION {
                debug!("Dropping rest of datagram: {}", RecordFault::Oversize);
                break;
            }

            let record_len = DtlsRecord::HEADER_LEN + declared;
            if remaining.len() < record_len {
                debug!("Dropping rest of datagram: {}", RecordFault::Truncated);
                break;
            }

            if let Some(record) = self.read_record(&remaining[..record_len]) {
                records.push(record);
            }

            offset += record_len;
        }

        if records.is_empty() {
            return Ok(());
        }

        self.insert_incoming(Incoming { records })
    }

    /// Copy one record into its own buffer and resolve its epoch: decrypt
    /// it, accept it as plaintext, hold it for a future epoch or drop it.
    fn read_record(&mut self, slice: &[u8]) -> Option<Record> {
        let mut buffer = self.buffers_free.pop();
        buffer.extend_from_slice(slice);

        let record = match DtlsRecord::parse(&buffer, 0) {
            Ok((_, record)) => record,
            Err(_) => {
                debug!("Dropping record with unparseable header");
                self.buffers_free.push(buffer);
                return None;
            }
        };

        let epoch = record.sequence.epoch;

        if epoch == self.read_epoch {
            if epoch == 0 {
                return self.accept_plaintext(buffer, record);
            }
            return self.decrypt_record(buffer, record);
        }

        // Previous epoch: the peer retransmitting its last plaintext
        // flight, accepted within a grace period of the key change.
        if self.read_epoch > 0 && epoch == self.read_epoch - 1 {
            if self.previous_epoch_grace_open() {
                return self.accept_plaintext(buffer, record);
            }
            debug!("Dropping record: {}", RecordFault::UnknownEpoch);
            self.buffers_free.push(buffer);
            return None;
        }

        // One epoch ahead: the peer's cipher change outran ours. Keep the
        // raw bytes and re-parse them when our read keys take effect.
        if epoch == self.read_epoch + 1 {
            if self.pending_encrypted.len() >= self.config.max_queue_rx() {
                debug!("Dropping future-epoch record, buffer full");
                self.buffers_free.push(buffer);
            } else {
                self.pending_encrypted.push(buffer);
            }
            return None;
        }

        debug!("Dropping record: {}", RecordFault::UnknownEpoch);
        self.buffers_free.push(buffer);
        None
    }

    fn previous_epoch_grace_open(&self) -> bool {
        match (self.promoted_at, self.last_now) {
            (Some(promoted), Some(now)) => {
                now.duration_since(promoted) <= self.config.epoch_grace()
            }
            // No time reference yet, nothing to measure the grace against.
            _ => true,
        }
    }

    fn accept_plaintext(&mut self, buffer: Buf, record: DtlsRecord) -> Option<Record> {
        match record.content_type {
            ContentType::ApplicationData => {
                // Application data is never valid unencrypted.
                debug!("Dropping plaintext application data record");
                self.buffers_free.push(buffer);
                None
            }
            ContentType::Unknown(value) => {
                debug!("Dropping record with unknown content type {}", value);
                self.buffers_free.push(buffer);
                None
            }
            _ => {
                let handshakes = scan_handshakes(&buffer, &record);
                Some(Record {
                    buffer,
                    record,
                    handshakes,
                    handled: Cell::new(false),
                })
            }
        }
    }

    fn decrypt_record(&mut self, mut buffer: Buf, record: DtlsRecord) -> Option<Record> {
        let seqno = record.sequence.sequence_number;

        // Replay judgement is pure: the window only advances below, after
        // the tag verified, so forged sequence numbers cannot poison it.
        if let Err(fault) = self.replay.check(seqno) {
            debug!("Dropping record: {}", fault);
            self.buffers_free.push(buffer);
            return None;
        }

        if (record.length as usize) < AEAD_OVERHEAD {
            debug!("Dropping record: {}", RecordFault::Truncated);
            self.buffers_free.push(buffer);
            return None;
        }

        let Some(cipher) = &self.read_cipher else {
            debug!("Dropping record: {}", RecordFault::UnknownEpoch);
            self.buffers_free.push(buffer);
            return None;
        };

        let plaintext_len = record.length - AEAD_OVERHEAD as u16;
        let aad = Aad::new(record.sequence, record.content_type, plaintext_len);

        let nonce_start = DtlsRecord::HEADER_LEN;
        let payload_start = nonce_start + DtlsRecord::EXPLICIT_NONCE_LEN;
        let nonce = Nonce::new(self.read_iv, &buffer[nonce_start..payload_start]);

        match cipher.open_in_place(nonce, &aad, &mut buffer[payload_start..]) {
            Ok(n) => {
                self.replay.update(seqno);

                // Rewrite the buffer as a plaintext record: drop the tag,
                // patch the length and re-parse past the nonce prefix.
                buffer.truncate(payload_start + n);
                let patched = (n as u16).to_be_bytes();
                buffer[DtlsRecord::LENGTH_OFFSET].copy_from_slice(&patched);

                let reparsed = match DtlsRecord::parse(&buffer, DtlsRecord::EXPLICIT_NONCE_LEN) {
                    Ok((_, reparsed)) => reparsed,
                    Err(_) => {
                        debug!("Dropping record with unparseable header");
                        self.buffers_free.push(buffer);
                        return None;
                    }
                };

                let handshakes = scan_handshakes(&buffer, &reparsed);
                Some(Record {
                    buffer,
                    record: reparsed,
                    handshakes,
                    handled: Cell::new(false),
                })
            }
            Err(_) => {
                debug!("Dropping record: {}", RecordFault::BadRecordMac);
                self.buffers_free.push(buffer);
                None
            }
        }
    }

    /// Queue a datagram's records in consumption order:
    ///
    /// 1. Handshake datagrams sort by (message_seq, fragment_offset).
    /// 2. Everything else sorts by record sequence.
    fn insert_incoming(&mut self, incoming: Incoming) -> Result<(), Error> {
        if self.queue_rx.len() >= self.config.max_queue_rx() {
            return Err(Error::ReceiveQueueFull);
        }

        // unwrap: is ok because parse_packet never queues an empty datagram.
        let first = incoming.records.first().unwrap();

        if let Some(fragment) = first.handshakes.first() {
            let header = fragment.header;

            if header.message_seq < self.peer_handshake_seq_no {
                // A dupe of a message already consumed. For the flight
                // heads it means the peer never saw our answer.
                debug!(
                    "Dupe handshake with message_seq: {} and offset: {}",
                    header.message_seq, header.fragment_offset
                );
                self.return_incoming(incoming);
                if header.dupe_triggers_resend() {
                    self.flight_resend()?;
                }
                return Ok(());
            }

            if self.release_app_data {
                return Err(Error::RenegotiationAttempt);
            }

            let key = (header.message_seq, header.fragment_offset);
            match self.queue_rx.binary_search_by(|queued| {
                let other = queued
                    .records
                    .first()
                    .and_then(|r| r.handshakes.first())
                    .map(|f| (f.header.message_seq, f.header.fragment_offset))
                    .unwrap_or((u16::MAX, u32::MAX));
                other.cmp(&key)
            }) {
                Ok(_) => {
                    debug!(
                        "Dupe handshake with message_seq: {} and offset: {}",
                        header.message_seq, header.fragment_offset
                    );
                    self.return_incoming(incoming);
                    if header.dupe_triggers_resend() {
                        self.flight_resend()?;
                    }
                }
                Err(index) => {
                    self.queue_rx.insert(index, incoming);
                }
            }
        } else {
            let key = sequence_key(first.record.sequence);
            match self.queue_rx.binary_search_by_key(&key, |queued| {
                // unwrap: is ok because parse_packet never queues an empty datagram.
                sequence_key(queued.records.first().unwrap().record.sequence)
            }) {
                Ok(_) => {
                    debug!("Dupe record with sequence: {:?}", first.record.sequence);
                    self.return_incoming(incoming);
                }
                Err(index) => {
                    self.queue_rx.insert(index, incoming);
                }
            }
        }

        Ok(())
    }

    fn return_incoming(&mut self, incoming: Incoming) {
        for record in incoming.records {
            self.buffers_free.push(record.buffer);
        }
    }

    /// Whether the next handshake message is fully present: right sequence
    /// number, right type, all fragments contiguous up to its length.
    pub fn has_complete_handshake(&self, wanted: MessageType) -> bool {
        self.complete_handshake_type() == Some(wanted)
    }

    /// The type of the next in-sequence handshake message, once every
    /// fragment of it has arrived. Drives the state machine dispatch: a
    /// complete message of a type the current state does not expect is a
    /// protocol violation.
    pub fn complete_handshake_type(&self) -> Option<MessageType> {
        let mut fragments = self
            .queue_rx
            .iter()
            .take(MAX_DEFRAGMENT_PACKETS)
            .flat_map(|incoming| incoming.records.iter())
            .flat_map(|record| record.handshakes.iter())
            .skip_while(|fragment| fragment.handled.get());

        let first = fragments.next()?;

        if first.header.message_seq != self.peer_handshake_seq_no
            || first.header.fragment_offset != 0
        {
            return None;
        }

        let msg_type = first.header.msg_type;
        let total = first.header.length as u64;
        let mut covered = first.header.fragment_length as u64;

        while covered < total {
            let fragment = fragments.next()?;
            let header = &fragment.header;

            if header.message_seq != first.header.message_seq || header.msg_type != msg_type {
                return None;
            }
            if header.fragment_offset as u64 > covered {
                // Gap.
                return None;
            }
            covered = covered.max((header.fragment_offset + header.fragment_length) as u64);
        }

        Some(msg_type)
    }

    /// Consume and reassemble the next handshake message.
    ///
    /// The reassembled canonical bytes go into the transcript here, before
    /// the returned message borrows `buffer`. The caller checks
    /// availability with [`has_complete_handshake`][Self::has_complete_handshake]
    /// first.
    pub fn next_handshake<'b>(&mut self, buffer: &'b mut Buf) -> Result<Handshake<'b>, Error> {
        let expected = self.peer_handshake_seq_no;
        let suite = self.suite;

        let fragments = self
            .queue_rx
            .iter()
            .take(MAX_DEFRAGMENT_PACKETS)
            .flat_map(|incoming| incoming.records.iter())
            .flat_map(|record| {
                record
                    .handshakes
                    .iter()
                    .map(move |fragment| (record, fragment))
            })
            .skip_while(|(_, fragment)| fragment.handled.get())
            .take_while(move |(_, fragment)| fragment.header.message_seq == expected)
            .map(|(record, fragment)| {
                fragment.handled.set(true);
                (fragment.header, &record.buffer[fragment.range.clone()])
            });

        let handshake =
            Handshake::defragment(fragments, buffer, suite, Some(&mut self.transcript))?;

        self.peer_handshake_seq_no = expected + 1;

        Ok(handshake)
    }

    /// Take the next unhandled record of the given content type.
    pub fn next_record(&mut self, content_type: ContentType) -> Option<&[u8]> {
        for incoming in &self.queue_rx {
            for record in &incoming.records {
                if record.record.content_type != content_type || record.is_handled() {
                    continue;
                }
                record.handled.set(true);
                return Some(&record.buffer[record.record.fragment_range.clone()]);
            }
        }
        None
    }

    /// Take the next queued alert, dropping unparseable ones.
    pub fn next_alert(&mut self) -> Option<Alert> {
        let fragment = self.next_record(ContentType::Alert)?;
        match Alert::parse(fragment) {
            Ok((_, alert)) => Some(alert),
            Err(_) => {
                debug!("Dropping unparseable alert record");
                None
            }
        }
    }

    /// Take the next queued ChangeCipherSpec. A present but malformed one
    /// is a protocol violation.
    pub fn next_ccs(&mut self) -> Result<bool, Error> {
        let Some(fragment) = self.next_record(ContentType::ChangeCipherSpec) else {
            return Ok(false);
        };
        if fragment != [1] {
            return Err(Error::ParseError("invalid ChangeCipherSpec body".into()));
        }
        Ok(true)
    }

    /// Discard queued ChangeCipherSpec records, typically retransmitted
    /// ones after the epoch already changed.
    pub fn drop_pending_ccs(&mut self) {
        while self.next_record(ContentType::ChangeCipherSpec).is_some() {}
    }

    fn purge_handled(&mut self) {
        while let Some(incoming) = self.queue_rx.front() {
            if !incoming.records.iter().all(|r| r.is_handled()) {
                break;
            }
            // unwrap: is ok because front() just returned Some.
            let incoming = self.queue_rx.pop_front().unwrap();
            self.return_incoming(incoming);
        }
    }

    // ------------------------------------------------------------------
    // Outgoing

    /// Create one record, encrypting when `epoch` is non-zero.
    ///
    /// The callback fills the plaintext fragment. With `save_fragment` the
    /// plaintext is retained and retransmitted on flight timeout. Records
    /// pack into the last queued datagram when they fit within the MTU.
    pub fn create_record<F>(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        save_fragment: bool,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Buf),
    {
        let mut fragment = self.buffers_free.pop();
        f(&mut fragment);

        if save_fragment {
            let mut copy = self.buffers_free.pop();
            copy.extend_from_slice(&fragment);
            self.flight_saved_records.push(FlightEntry {
                content_type,
                epoch,
                fragment: copy,
            });
        }

        let result = self.append_record(content_type, epoch, &mut fragment);
        self.buffers_free.push(fragment);
        result
    }

    fn append_record(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        fragment: &mut Buf,
    ) -> Result<(), Error> {
        let sequence = if epoch == 0 {
            self.sequence_epoch_0
        } else {
            self.sequence_epoch_n
        };

        if sequence.sequence_number >= MAX_SEQUENCE_NUMBER {
            return Err(Error::SequenceExhausted);
        }

        if epoch > 0 {
            let Some(cipher) = &self.write_cipher else {
                return Err(Error::CryptoError("write keys are not installed".into()));
            };

            let plaintext_len = fragment.len() as u16;
            let aad = Aad::new(sequence, content_type, plaintext_len);

            // The explicit nonce is epoch + sequence number, the same 8
            // bytes that lead the additional data.
            let len = fragment.len();
            fragment.resize(len + DtlsRecord::EXPLICIT_NONCE_LEN, 0);
            fragment.copy_within(0..len, DtlsRecord::EXPLICIT_NONCE_LEN);
            fragment[..DtlsRecord::EXPLICIT_NONCE_LEN]
                .copy_from_slice(&aad.0[..DtlsRecord::EXPLICIT_NONCE_LEN]);

            let nonce = Nonce::new(self.write_iv, &aad.0[..DtlsRecord::EXPLICIT_NONCE_LEN]);
            cipher.seal_in_place(nonce, &aad, fragment, DtlsRecord::EXPLICIT_NONCE_LEN)?;
        }

        let record = DtlsRecord {
            content_type,
            version: ProtocolVersion::DTLS1_2,
            sequence,
            length: fragment.len() as u16,
            fragment_range: 0..fragment.len(),
        };

        let needed = DtlsRecord::HEADER_LEN + fragment.len();
        let fits_last = self
            .queue_tx
            .back()
            .map(|datagram| datagram.len() + needed <= self.config.mtu())
            .unwrap_or(false);

        if fits_last {
            // unwrap: is ok because fits_last checked the back exists.
            let datagram = self.queue_tx.back_mut().unwrap();
            record.serialize(fragment, datagram);
        } else {
            if self.queue_tx.len() >= self.config.max_queue_tx() {
                return Err(Error::TransmitQueueFull);
            }
            let mut datagram = self.buffers_free.pop();
            record.serialize(fragment, &mut datagram);
            self.queue_tx.push_back(datagram);
        }

        if epoch == 0 {
            self.sequence_epoch_0.sequence_number += 1;
        } else {
            self.sequence_epoch_n.sequence_number += 1;
        }

        Ok(())
    }

    /// Create one handshake message, fragmenting it over as many records
    /// as the MTU demands.
    ///
    /// The callback fills the message body. The canonical unfragmented
    /// form enters the transcript; every fragment record is retained for
    /// retransmission.
    pub fn create_handshake<F>(&mut self, msg_type: MessageType, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Buf, &mut Engine) -> Result<(), Error>,
    {
        let mut body = self.buffers_free.pop();
        if let Err(e) = f(&mut body, self) {
            self.buffers_free.push(body);
            return Err(e);
        }

        let message_seq = self.next_handshake_seq_no;
        self.next_handshake_seq_no += 1;

        let length = body.len() as u32;
        let epoch = msg_type.epoch();

        let canonical = Header {
            msg_type,
            length,
            message_seq,
            fragment_offset: 0,
            fragment_length: length,
        };
        let mut header_bytes = Vec::with_capacity(Header::LEN);
        canonical.serialize(&mut header_bytes);
        self.transcript.extend_from_slice(&header_bytes);
        self.transcript.extend_from_slice(&body);

        let overhead = DtlsRecord::HEADER_LEN
            + Header::LEN
            + if epoch > 0 { AEAD_OVERHEAD } else { 0 };
        let space = self.config.mtu().saturating_sub(overhead).max(1);

        let mut offset = 0;
        loop {
            let chunk = (body.len() - offset).min(space);
            let fragment_header = Header {
                msg_type,
                length,
                message_seq,
                fragment_offset: offset as u32,
                fragment_length: chunk as u32,
            };

            let result = self.create_record(ContentType::Handshake, epoch, true, |out| {
                let mut serialized = Vec::with_capacity(Header::LEN);
                fragment_header.serialize(&mut serialized);
                out.extend_from_slice(&serialized);
                out.extend_from_slice(&body[offset..offset + chunk]);
            });
            if let Err(e) = result {
                self.buffers_free.push(body);
                return Err(e);
            }

            offset += chunk;
            if offset >= body.len() {
                break;
            }
        }

        self.buffers_free.push(body);
        Ok(())
    }

    /// Queue an alert, encrypted once our cipher change went out.
    pub fn send_alert(&mut self, alert: Alert) -> Result<(), Error> {
        let epoch = if self.write_cipher.is_some() { 1 } else { 0 };
        self.create_record(ContentType::Alert, epoch, false, |out| {
            let mut serialized = Vec::with_capacity(2);
            alert.serialize(&mut serialized);
            out.extend_from_slice(&serialized);
        })
    }

    // ------------------------------------------------------------------
    // Flights and timers

    /// Start a new flight: forget the previous one and reset the
    /// retransmission schedule. The timer arms on the next poll.
    pub fn flight_begin(&mut self) {
        self.flight_generation += 1;
        for entry in self.flight_saved_records.drain(..) {
            self.buffers_free.push(entry.fragment);
        }
        self.flight_backoff.reset(&mut self.rng);
        self.flight_timeout = Timeout::Unarmed;
    }

    /// Queue the current flight again with fresh record sequence numbers.
    pub fn flight_resend(&mut self) -> Result<(), Error> {
        if self.flight_saved_records.is_empty() {
            return Ok(());
        }

        debug!("Resending {} flight records", self.flight_saved_records.len());

        let saved = mem::take(&mut self.flight_saved_records);
        let mut result = Ok(());
        for entry in &saved {
            result = self.create_record(entry.content_type, entry.epoch, false, |fragment| {
                fragment.extend_from_slice(&entry.fragment);
            });
            if result.is_err() {
                break;
            }
        }
        self.flight_saved_records = saved;
        result
    }

    /// The handshake is done, nothing left to retransmit on a timer.
    pub fn flight_stop_resend_timers(&mut self) {
        self.flight_timeout = Timeout::Disabled;
        self.connect_timeout = Timeout::Disabled;
    }

    fn arm_timers(&mut self, now: Instant) {
        if self.flight_timeout == Timeout::Unarmed {
            self.flight_timeout = Timeout::Armed(now + self.flight_backoff.rto());
            self.armed_generation = self.flight_generation;
        }
        if self.connect_timeout == Timeout::Unarmed {
            self.connect_timeout = Timeout::Armed(now + self.config.handshake_timeout());
        }
    }

    /// Drive the timers. Resends the current flight when its timer fired;
    /// errors when the retry budget or the handshake deadline is spent.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        self.last_now = Some(now);
        self.arm_timers(now);

        if let Timeout::Armed(at) = self.connect_timeout {
            if now >= at {
                return Err(Error::Timeout("handshake deadline"));
            }
        }

        let Timeout::Armed(at) = self.flight_timeout else {
            return Ok(());
        };
        if now < at {
            return Ok(());
        }

        if self.armed_generation != self.flight_generation {
            // Armed for a flight that has since completed.
            self.flight_timeout = Timeout::Armed(now + self.flight_backoff.rto());
            self.armed_generation = self.flight_generation;
            return Ok(());
        }

        if !self.flight_backoff.can_retry() {
            return Err(Error::Timeout("flight retries exhausted"));
        }

        self.flight_resend()?;
        self.flight_backoff.attempt(&mut self.rng);
        self.flight_timeout = Timeout::Armed(now + self.flight_backoff.rto());

        Ok(())
    }

    // ------------------------------------------------------------------
    // Keys and epochs

    pub fn enable_write_encryption(
        &mut self,
        suite: CipherSuite,
        key: &[u8],
        iv: Iv,
    ) -> Result<(), Error> {
        self.write_cipher = Some(AeadCipher::new(suite, key)?);
        self.write_iv = iv;
        self.sequence_epoch_n = Sequence {
            epoch: 1,
            sequence_number: 0,
        };
        Ok(())
    }

    pub fn enable_read_encryption(
        &mut self,
        suite: CipherSuite,
        key: &[u8],
        iv: Iv,
    ) -> Result<(), Error> {
        self.read_cipher = Some(AeadCipher::new(suite, key)?);
        self.read_iv = iv;
        Ok(())
    }

    /// The peer's ChangeCipherSpec arrived: expect the next epoch from here
    /// on, with a fresh replay window, and give records that arrived ahead
    /// of it another pass through the parser.
    pub fn promote_read_epoch(&mut self) -> Result<(), Error> {
        self.read_epoch += 1;
        self.replay = ReplayWindow::new();
        self.promoted_at = self.last_now;

        let pending = mem::take(&mut self.pending_encrypted);
        for buffer in pending {
            self.parse_packet(&buffer)?;
            self.buffers_free.push(buffer);
        }

        Ok(())
    }

    /// Forget the initial hello exchange: a verified ClientHello restarts
    /// the transcript from scratch.
    pub fn reset_client_for_hello_verify_request(&mut self) {
        self.transcript.clear();
    }

    pub fn reset_server_for_hello_verify_request(&mut self) {
        self.transcript.clear();
        while let Some(incoming) = self.queue_rx.pop_front() {
            self.return_incoming(incoming);
        }
    }

    // ------------------------------------------------------------------
    // Events and polling

    pub fn push_connected(&mut self) {
        self.connected_pending = true;
    }

    pub fn release_application_data(&mut self) {
        self.release_app_data = true;
    }

    /// Next thing the embedder should act on, in priority order: the
    /// connection event, received application data, a datagram to send,
    /// and otherwise the time to call [`handle_timeout`][Self::handle_timeout].
    pub fn poll_output<'a>(&mut self, buf: &'a mut [u8], now: Instant) -> Output<'a> {
        self.last_now = Some(now);
        self.arm_timers(now);
        self.purge_handled();

        if self.connected_pending {
            self.connected_pending = false;
            return Output::Connected;
        }

        if self.release_app_data {
            if let Some(n) = self.poll_app_data(&mut *buf) {
                return Output::ApplicationData(&buf[..n]);
            }
        }

        if let Some(n) = self.poll_packet_tx(&mut *buf) {
            return Output::Packet(&buf[..n]);
        }

        Output::Timeout(self.next_timeout(now))
    }

    fn poll_app_data(&mut self, buf: &mut [u8]) -> Option<usize> {
        for incoming in &self.queue_rx {
            for record in &incoming.records {
                if record.record.content_type != ContentType::ApplicationData
                    || record.is_handled()
                {
                    continue;
                }

                let fragment = record.fragment();
                assert!(
                    buf.len() >= fragment.len(),
                    "Output buffer smaller than application data"
                );

                buf[..fragment.len()].copy_from_slice(fragment);
                record.handled.set(true);
                return Some(fragment.len());
            }
        }
        None
    }

    fn poll_packet_tx(&mut self, buf: &mut [u8]) -> Option<usize> {
        let datagram = self.queue_tx.pop_front()?;
        assert!(
            buf.len() >= datagram.len(),
            "Output buffer smaller than datagram"
        );

        buf[..datagram.len()].copy_from_slice(&datagram);
        let len = datagram.len();
        self.buffers_free.push(datagram);
        Some(len)
    }

    fn next_timeout(&self, now: Instant) -> Instant {
        match (self.flight_timeout.at(), self.connect_timeout.at()) {
            (Some(flight), Some(connect)) => flight.min(connect),
            (Some(flight), None) => flight,
            (None, Some(connect)) => connect,
            (None, None) => now + DISTANT_FUTURE,
        }
    }
}

fn sequence_key(sequence: Sequence) -> (u16, u64) {
    (sequence.epoch, sequence.sequence_number)
}

/// Find the handshake fragments inside a plaintext record. Stops at the
/// first thing that does not scan as a fragment; reassembly decides later
/// whether what was found is usable.
fn scan_handshakes(buffer: &Buf, record: &DtlsRecord) -> SmallVec<[HandshakeFragment; 2]> {
    let mut fragments = SmallVec::new();

    if record.content_type != ContentType::Handshake {
        return fragments;
    }

    let base = record.fragment_range.start;
    let payload = &buffer[record.fragment_range.clone()];
    let mut offset = 0;

    while offset < payload.len() && fragments.len() < MAX_HANDSHAKES_PER_RECORD {
        let input = &payload[offset..];
        let Ok((rest, header)) = Header::parse(input) else {
            break;
        };

        let body_len = header.fragment_length as usize;
        if rest.len() < body_len {
            break;
        }

        let body_start = base + offset + Header::LEN;
        fragments.push(HandshakeFragment {
            header,
            range: body_start..body_start + body_len,
            handled: Cell::new(false),
        });

        offset += Header::LEN + body_len;
    }

    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<Config> {
        Arc::new(Config::builder().rng_seed(42).build())
    }

    fn paired_encrypted_engines() -> (Engine, Engine) {
        let suite = CipherSuite::PSK_AES128_GCM_SHA256;
        let key = [7u8; 16];
        let iv = Iv([1, 2, 3, 4]);

        let mut a = Engine::new(test_config());
        let mut b = Engine::new(test_config());
        a.set_cipher_suite(suite);
        b.set_cipher_suite(suite);

        b.enable_write_encryption(suite, &key, iv).unwrap();
        a.enable_read_encryption(suite, &key, iv).unwrap();
        a.promote_read_epoch().unwrap();

        (a, b)
    }

    #[test]
    fn packs_small_records_into_one_datagram() {
        let mut engine = Engine::new(test_config());

        engine
            .create_record(ContentType::Handshake, 0, false, |f| {
                f.extend_from_slice(&[1, 2, 3])
            })
            .unwrap();
        engine
            .create_record(ContentType::Handshake, 0, false, |f| {
                f.extend_from_slice(&[4, 5])
            })
            .unwrap();

        assert_eq!(engine.queue_tx.len(), 1);
        let datagram = engine.queue_tx.front().unwrap();
        assert_eq!(datagram.len(), 13 + 3 + 13 + 2);
    }

    #[test]
    fn transmit_queue_bound() {
        let config = Arc::new(Config::builder().rng_seed(1).max_queue_tx(1).mtu(30).build());
        let mut engine = Engine::new(config);

        engine
            .create_record(ContentType::Handshake, 0, false, |f| {
                f.extend_from_slice(&[0; 10])
            })
            .unwrap();
        let err = engine
            .create_record(ContentType::Handshake, 0, false, |f| {
                f.extend_from_slice(&[0; 10])
            })
            .unwrap_err();

        assert_eq!(err, Error::TransmitQueueFull);
    }

    #[test]
    fn sequence_exhaustion_is_an_error() {
        let mut engine = Engine::new(test_config());
        engine.sequence_epoch_0.sequence_number = MAX_SEQUENCE_NUMBER - 1;

        engine
            .create_record(ContentType::Handshake, 0, false, |f| f.push(0))
            .unwrap();
        let err = engine
            .create_record(ContentType::Handshake, 0, false, |f| f.push(0))
            .unwrap_err();

        assert_eq!(err, Error::SequenceExhausted);
    }

    #[test]
    fn fragments_handshake_beyond_mtu() {
        let mut engine = Engine::new(test_config());
        let body = vec![0xAB; 3000];
        let body_copy = body.clone();

        engine
            .create_handshake(MessageType::Certificate, move |out, _| {
                out.extend_from_slice(&body_copy);
                Ok(())
            })
            .unwrap();

        let mut covered = 0usize;
        let mut count = 0;
        while let Some(datagram) = engine.queue_tx.pop_front() {
            let mut input = &datagram[..];
            while !input.is_empty() {
                let (rest, record) = DtlsRecord::parse(input, 0).unwrap();
                let (_, header) = Header::parse(record.fragment(input)).unwrap();

                assert_eq!(header.msg_type, MessageType::Certificate);
                assert_eq!(header.message_seq, 0);
                assert_eq!(header.length as usize, body.len());
                assert_eq!(header.fragment_offset as usize, covered);

                covered += header.fragment_length as usize;
                count += 1;
                input = rest;
            }
        }

        assert_eq!(covered, body.len());
        assert!(count >= 3);

        // The transcript holds the canonical unfragmented form.
        assert_eq!(engine.transcript.len(), Header::LEN + body.len());
        assert_eq!(engine.transcript[0], MessageType::Certificate.as_u8());
        assert_eq!(&engine.transcript[6..9], &[0, 0, 0]);
    }

    #[test]
    fn reassembles_fragmented_handshake() {
        let config = Arc::new(Config::builder().rng_seed(9).mtu(60).build());
        let mut sender = Engine::new(config);

        // A valid one-certificate chain, 120 bytes of body.
        let mut body = vec![0x00, 0x00, 0x75, 0x00, 0x00, 0x72];
        body.extend_from_slice(&[0xCD; 114]);
        let body_copy = body.clone();

        sender
            .create_handshake(MessageType::Certificate, move |out, _| {
                out.extend_from_slice(&body_copy);
                Ok(())
            })
            .unwrap();
        assert!(sender.queue_tx.len() > 1);

        let mut receiver = Engine::new(test_config());
        while let Some(datagram) = sender.queue_tx.pop_front() {
            receiver.parse_packet(&datagram).unwrap();
        }

        assert!(receiver.has_complete_handshake(MessageType::Certificate));

        let mut buffer = Buf::new();
        let handshake = receiver.next_handshake(&mut buffer).unwrap();
        assert_eq!(handshake.header.msg_type, MessageType::Certificate);
        assert_eq!(handshake.header.length as usize, body.len());
        assert_eq!(receiver.peer_handshake_seq_no, 1);

        // Both sides agree on the canonical transcript bytes.
        assert_eq!(&receiver.transcript[..], &sender.transcript[..]);
    }

    #[test]
    fn duplicate_hello_triggers_flight_resend() {
        let mut sender = Engine::new(test_config());
        sender
            .create_handshake(MessageType::ClientHello, |out, _| {
                out.extend_from_slice(&[0xAA; 40]);
                Ok(())
            })
            .unwrap();
        let hello = sender.queue_tx.pop_front().unwrap();

        let mut server = Engine::new(test_config());
        server.parse_packet(&hello).unwrap();
        assert_eq!(server.queue_rx.len(), 1);

        server.flight_begin();
        server
            .create_record(ContentType::Handshake, 0, true, |f| {
                f.extend_from_slice(&[1, 2])
            })
            .unwrap();
        server.queue_tx.clear();

        // The same datagram again: dropped as a dupe, answer flight resent.
        server.parse_packet(&hello).unwrap();
        assert_eq!(server.queue_rx.len(), 1);
        assert_eq!(server.queue_tx.len(), 1);
    }

    #[test]
    fn late_duplicate_of_consumed_hello_resends_flight() {
        let mut sender = Engine::new(test_config());
        sender
            .create_handshake(MessageType::ClientHello, |out, _| {
                out.extend_from_slice(&[0xAA; 40]);
                Ok(())
            })
            .unwrap();
        let hello = sender.queue_tx.pop_front().unwrap();

        let mut server = Engine::new(test_config());
        server.peer_handshake_seq_no = 1;
        server.flight_begin();
        server
            .create_record(ContentType::Handshake, 0, true, |f| {
                f.extend_from_slice(&[1, 2])
            })
            .unwrap();
        server.queue_tx.clear();

        server.parse_packet(&hello).unwrap();
        assert!(server.queue_rx.is_empty());
        assert_eq!(server.queue_tx.len(), 1);
    }

    #[test]
    fn handshake_after_establishment_is_renegotiation() {
        let mut sender = Engine::new(test_config());
        sender
            .create_handshake(MessageType::ClientHello, |out, _| {
                out.extend_from_slice(&[0xAA; 40]);
                Ok(())
            })
            .unwrap();
        let hello = sender.queue_tx.pop_front().unwrap();

        let mut server = Engine::new(test_config());
        server.release_application_data();

        let err = server.parse_packet(&hello).unwrap_err();
        assert_eq!(err, Error::RenegotiationAttempt);
    }

    #[test]
    fn replayed_datagram_is_dropped() {
        let (mut a, mut b) = paired_encrypted_engines();

        b.create_record(ContentType::ApplicationData, 1, false, |f| {
            f.extend_from_slice(b"ping")
        })
        .unwrap();
        let datagram = b.queue_tx.pop_front().unwrap();

        a.parse_packet(&datagram).unwrap();
        assert_eq!(a.queue_rx.len(), 1);

        // Same bytes again: the replay window drops it before decryption.
        a.parse_packet(&datagram).unwrap();
        assert_eq!(a.queue_rx.len(), 1);
    }

    #[test]
    fn releases_application_data_only_after_handshake() {
        let (mut a, mut b) = paired_encrypted_engines();

        b.create_record(ContentType::ApplicationData, 1, false, |f| {
            f.extend_from_slice(b"ping")
        })
        .unwrap();
        let datagram = b.queue_tx.pop_front().unwrap();
        a.parse_packet(&datagram).unwrap();

        let now = Instant::now();
        let mut buf = [0u8; 2048];

        assert!(matches!(a.poll_output(&mut buf, now), Output::Timeout(_)));

        a.release_application_data();
        match a.poll_output(&mut buf, now) {
            Output::ApplicationData(data) => assert_eq!(data, b"ping"),
            other => panic!("expected application data, got {:?}", other),
        }
    }

    #[test]
    fn tampered_record_is_dropped() {
        let (mut a, mut b) = paired_encrypted_engines();

        b.create_record(ContentType::ApplicationData, 1, false, |f| {
            f.extend_from_slice(b"ping")
        })
        .unwrap();
        let mut datagram = b.queue_tx.pop_front().unwrap();
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;

        a.parse_packet(&datagram).unwrap();
        assert!(a.queue_rx.is_empty());
    }

    #[test]
    fn future_epoch_records_wait_for_promotion() {
        let suite = CipherSuite::PSK_AES128_GCM_SHA256;
        let key = [7u8; 16];
        let iv = Iv([1, 2, 3, 4]);

        let mut a = Engine::new(test_config());
        let mut b = Engine::new(test_config());
        a.set_cipher_suite(suite);
        b.set_cipher_suite(suite);
        b.enable_write_encryption(suite, &key, iv).unwrap();
        a.enable_read_encryption(suite, &key, iv).unwrap();
        // No promotion yet: incoming epoch 1 records are one ahead.

        b.create_record(ContentType::ApplicationData, 1, false, |f| {
            f.extend_from_slice(b"early")
        })
        .unwrap();
        let datagram = b.queue_tx.pop_front().unwrap();

        a.parse_packet(&datagram).unwrap();
        assert!(a.queue_rx.is_empty());
        assert_eq!(a.pending_encrypted.len(), 1);

        a.promote_read_epoch().unwrap();
        assert!(a.pending_encrypted.is_empty());
        assert_eq!(a.queue_rx.len(), 1);
    }

    #[test]
    fn flight_timeout_resends_saved_records() {
        let mut engine = Engine::new(test_config());
        let now = Instant::now();

        engine.flight_begin();
        engine
            .create_record(ContentType::Handshake, 0, true, |f| {
                f.extend_from_slice(&[1, 2, 3])
            })
            .unwrap();
        let first = engine.queue_tx.pop_front().unwrap();

        engine.handle_timeout(now).unwrap();
        let Timeout::Armed(at) = engine.flight_timeout else {
            panic!("timer not armed");
        };

        engine.handle_timeout(at).unwrap();
        let resent = engine.queue_tx.pop_front().unwrap();

        // Same plaintext, fresh record sequence number.
        assert_eq!(resent.len(), first.len());
        assert_eq!(&resent[13..], &first[13..]);
        assert_ne!(&resent[..13], &first[..13]);
    }

    #[test]
    fn stale_flight_timer_rearms_without_resending() {
        let mut engine = Engine::new(test_config());
        let now = Instant::now();

        engine.flight_begin();
        engine
            .create_record(ContentType::Handshake, 0, true, |f| f.push(1))
            .unwrap();
        engine.queue_tx.clear();

        // Armed for this flight, then the state machine moves on before
        // the timer fires.
        engine.handle_timeout(now).unwrap();
        engine.flight_generation += 1;

        let Timeout::Armed(at) = engine.flight_timeout else {
            panic!("timer not armed");
        };
        engine.handle_timeout(at).unwrap();

        assert!(engine.queue_tx.is_empty());
        assert!(matches!(engine.flight_timeout, Timeout::Armed(t) if t > at));
        assert_eq!(engine.armed_generation, engine.flight_generation);
    }

    #[test]
    fn flight_retries_exhaust_into_timeout() {
        let config = Arc::new(Config::builder().rng_seed(1).flight_retries(2).build());
        let mut engine = Engine::new(config);
        let mut now = Instant::now();

        engine.flight_begin();
        engine
            .create_record(ContentType::Handshake, 0, true, |f| f.push(7))
            .unwrap();

        engine.handle_timeout(now).unwrap();
        for _ in 0..2 {
            let Timeout::Armed(at) = engine.flight_timeout else {
                panic!("timer not armed");
            };
            now = at;
            engine.handle_timeout(now).unwrap();
        }

        let Timeout::Armed(at) = engine.flight_timeout else {
            panic!("timer not armed");
        };
        let err = engine.handle_timeout(at).unwrap_err();
        assert!(err.is_timeout());
    }
}
