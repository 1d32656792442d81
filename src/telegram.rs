//! Parses and builds complete eBUS telegrams (MS/MM/BC) from raw wire
//! sequences, and classifies their master/slave validity.

use crate::consts::{is_address_valid, is_master_address, ACK, BROADCAST, MAX_NN, NAK};
use crate::sequence::Sequence;

/// Validity classification of one side (master or slave) of a telegram.
///
/// Every input sequence yields exactly one of these — the classifiers below
/// never produce more than one, and the default state of an unbuilt
/// [`Telegram`] is [`Empty`](TelegramState::Empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramState {
    /// Fully valid: length in range and CRC (if present) matches.
    Ok,
    /// Not yet built / zero-length input.
    Empty,
    /// Fewer bytes than the minimum frame requires.
    Short,
    /// More bytes than the maximum frame allows.
    Long,
    /// `NN` exceeds [`MAX_NN`].
    BadNn,
    /// The trailing CRC byte does not match the computed CRC.
    BadCrc,
    /// `QQ` is not a valid master address.
    BadQq,
    /// `ZZ` is [`crate::consts::SYN`] or [`crate::consts::EXP`].
    BadZz,
    /// An ACK/NAK byte was present but was neither [`ACK`] nor [`NAK`].
    BadAck,
    /// The buffer ended before an expected ACK/NAK byte arrived.
    AckMissing,
    /// No other state applies; the sequence cannot be interpreted at all.
    Invalid,
}

/// Telegram class, derived from the target (`ZZ`) byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramType {
    /// `ZZ == 0xFE`: no acknowledge phase at all.
    Broadcast,
    /// `ZZ` is a master address: a single ACK/NAK byte closes the cycle.
    MasterMaster,
    /// `ZZ` is a slave address: a full slave response phase follows.
    MasterSlave,
}

impl TelegramType {
    fn of(zz: u8) -> TelegramType {
        if zz == BROADCAST {
            TelegramType::Broadcast
        } else if is_master_address(zz) {
            TelegramType::MasterMaster
        } else {
            TelegramType::MasterSlave
        }
    }
}

/// A parsed or constructed eBUS telegram.
#[derive(Debug, Clone)]
pub struct Telegram {
    kind: TelegramType,

    master_qq: u8,
    master_zz: u8,
    master: Sequence,
    master_nn: usize,
    master_crc: u8,
    master_state: TelegramState,

    slave_ack: u8,
    slave: Sequence,
    slave_nn: usize,
    slave_crc: u8,
    slave_state: TelegramState,

    master_ack: u8,
}

impl Default for Telegram {
    fn default() -> Self {
        Self::empty()
    }
}

impl Telegram {
    /// A telegram with both sides [`TelegramState::Empty`] and no bytes.
    pub fn empty() -> Self {
        Telegram {
            kind: TelegramType::Broadcast,
            master_qq: 0,
            master_zz: 0,
            master: Sequence::new(),
            master_nn: 0,
            master_crc: 0,
            master_state: TelegramState::Empty,
            slave_ack: 0,
            slave: Sequence::new(),
            slave_nn: 0,
            slave_crc: 0,
            slave_state: TelegramState::Empty,
            master_ack: 0,
        }
    }

    /// Builds a master telegram directly from user input: `source` becomes
    /// `QQ`, and `payload` must already be `ZZ SB PB NN D1..DN` (no CRC, no
    /// trailing ACK) with `NN == payload[3]` matching the data bytes that
    /// follow it.
    pub fn build_master(source: u8, payload: &[u8]) -> Telegram {
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(source);
        bytes.extend_from_slice(payload);
        let mut t = Telegram::empty();
        t.create_master(&Sequence::from_bytes(&bytes));
        t
    }

    /// Builds a slave response telegram from `payload`, which must already
    /// be `NN D1..DN` (no CRC).
    pub fn build_slave(payload: &[u8]) -> Telegram {
        let mut t = Telegram::empty();
        t.create_slave(&Sequence::from_bytes(payload));
        t
    }

    /// Parses a complete observed wire transmission, including any
    /// NAK/retry cycles, classifying both sides.
    pub fn parse(seq: &Sequence) -> Telegram {
        let mut seq = seq.clone();
        seq.unstuff();

        let mut t = Telegram::empty();

        t.master_state = check_master_sequence(&seq);
        if t.master_state != TelegramState::Ok {
            return t;
        }

        let nn0 = seq.at(4) as usize;
        let master = seq.range(0, 5 + nn0 + 1);
        t.create_master(&master);
        if t.master_state != TelegramState::Ok {
            return t;
        }

        // Tracks how far into `seq` the *accepted* master attempt starts:
        // 0 unless a master retry occurred, in which case it's the wire
        // length of the rejected first attempt plus its NAK byte. The
        // slave segment offset below is computed on top of this, not
        // re-derived from `t.slave_ack` (which by this point always
        // reads ACK — a NAK on the retried master already returned above).
        let mut master_retry_offset = 0usize;

        if t.kind != TelegramType::Broadcast {
            if seq.len() <= 5 + t.master_nn + 1 {
                t.slave_state = TelegramState::AckMissing;
                return t;
            }
            t.slave_ack = seq.at(5 + t.master_nn + 1);
            if t.slave_ack != ACK && t.slave_ack != NAK {
                t.slave_state = TelegramState::BadAck;
                return t;
            }

            if t.slave_ack == NAK {
                if seq.len() < master.len() + 1 {
                    t.master_state = TelegramState::Short;
                    return t;
                }
                master_retry_offset = master.len() + 1;
                t.master.clear();

                let tmp = seq.range(master_retry_offset, seq.len() - master_retry_offset);
                t.master_state = check_master_sequence(&tmp);
                if t.master_state != TelegramState::Ok {
                    return t;
                }

                let nn1 = tmp.at(4) as usize;
                let master2 = tmp.range(0, 5 + nn1 + 1);
                t.create_master(&master2);
                if t.master_state != TelegramState::Ok {
                    return t;
                }

                if tmp.len() <= 5 + t.master_nn + 1 {
                    t.slave_state = TelegramState::AckMissing;
                    return t;
                }
                t.slave_ack = tmp.at(5 + t.master_nn + 1);
                if t.slave_ack != ACK && t.slave_ack != NAK {
                    t.slave_state = TelegramState::BadAck;
                    return t;
                }

                if t.slave_ack == NAK {
                    if tmp.len() > 5 + t.master_nn + 2 {
                        t.master_state = TelegramState::Long;
                    } else {
                        t.master_state = TelegramState::Invalid;
                    }
                    return t;
                }
            }
        }

        if t.kind == TelegramType::MasterSlave {
            let offset = master_retry_offset + 5 + t.master_nn + 2;

            let seq2 = seq.range(offset, seq.len() - offset);
            t.slave_state = check_slave_sequence(&seq2);
            if t.slave_state != TelegramState::Ok {
                return t;
            }

            let snn0 = seq2.at(0) as usize;
            let slave = seq2.range(0, 1 + snn0 + 1);
            t.create_slave(&slave);
            if t.slave_state != TelegramState::Ok {
                return t;
            }

            if seq2.len() <= 1 + t.slave_nn + 1 {
                t.master_state = TelegramState::AckMissing;
                return t;
            }
            t.master_ack = seq2.at(1 + t.slave_nn + 1);
            if t.master_ack != ACK && t.master_ack != NAK {
                t.master_state = TelegramState::BadAck;
                return t;
            }

            if t.master_ack == NAK {
                if seq2.len() < slave.len() + 2 {
                    t.slave_state = TelegramState::Short;
                    return t;
                }
                let inner_offset = slave.len() + 2;
                t.slave.clear();

                let tmp = seq2.range(inner_offset, seq2.len() - inner_offset);
                t.slave_state = check_slave_sequence(&tmp);
                if t.slave_state != TelegramState::Ok {
                    return t;
                }

                let snn1 = seq2.at(inner_offset) as usize;
                let slave2 = seq2.range(inner_offset, 1 + snn1 + 1);
                t.create_slave(&slave2);

                if tmp.len() <= 1 + t.slave_nn + 1 {
                    t.master_state = TelegramState::AckMissing;
                    return t;
                }
                t.master_ack = tmp.at(1 + t.slave_nn + 1);
                if t.master_ack != ACK && t.master_ack != NAK {
                    t.master_state = TelegramState::BadAck;
                    return t;
                }

                if tmp.len() > 1 + t.slave_nn + 2 {
                    t.slave_state = TelegramState::Long;
                    t.slave.clear();
                    return t;
                }

                if t.master_ack == NAK {
                    t.slave_state = TelegramState::Invalid;
                    return t;
                }
            }
        }

        t
    }

    /// Validates and stores the master side from a sequence (stuffed or
    /// not) that may or may not include its trailing CRC byte.
    pub(crate) fn create_master(&mut self, seq: &Sequence) {
        self.master_state = TelegramState::Ok;
        let mut seq = seq.clone();
        seq.unstuff();

        if seq.len() < 6 {
            self.master_state = TelegramState::Short;
            return;
        }
        if !is_master_address(seq.at(0)) {
            self.master_state = TelegramState::BadQq;
            return;
        }
        if !is_address_valid(seq.at(1)) {
            self.master_state = TelegramState::BadZz;
            return;
        }
        let nn = seq.at(4) as usize;
        if nn > MAX_NN as usize {
            self.master_state = TelegramState::BadNn;
            return;
        }
        if seq.len() < 5 + nn {
            self.master_state = TelegramState::Short;
            return;
        }
        if seq.len() > 5 + nn + 1 {
            self.master_state = TelegramState::Long;
            return;
        }

        self.master_qq = seq.at(0);
        self.master_zz = seq.at(1);
        self.kind = TelegramType::of(self.master_zz);
        self.master_nn = nn;

        if seq.len() == 5 + nn {
            self.master = seq;
            self.master_crc = self.master.crc();
        } else {
            self.master = seq.range(0, 5 + nn);
            self.master_crc = seq.at(5 + nn);
            if self.master.crc() != self.master_crc {
                self.master_state = TelegramState::BadCrc;
            }
        }
    }

    /// Validates and stores the slave side from a sequence (stuffed or
    /// not) that may or may not include its trailing CRC byte.
    pub(crate) fn create_slave(&mut self, seq: &Sequence) {
        self.slave_state = TelegramState::Ok;
        let mut seq = seq.clone();
        seq.unstuff();

        if seq.len() < 1 {
            self.slave_state = TelegramState::Short;
            return;
        }
        let nn = seq.at(0) as usize;
        if nn > MAX_NN as usize {
            self.slave_state = TelegramState::BadNn;
            return;
        }
        if seq.len() < 1 + nn {
            self.slave_state = TelegramState::Short;
            return;
        }
        if seq.len() > 1 + nn + 1 {
            self.slave_state = TelegramState::Long;
            return;
        }

        self.slave_nn = nn;

        if seq.len() == 1 + nn {
            self.slave = seq;
            self.slave_crc = self.slave.crc();
        } else {
            self.slave = seq.range(0, 1 + nn);
            self.slave_crc = seq.at(1 + nn);
            if self.slave.crc() != self.slave_crc {
                self.slave_state = TelegramState::BadCrc;
            }
        }
    }

    /// `QQ`, the source address of the master part.
    pub fn master_qq(&self) -> u8 {
        self.master_qq
    }

    /// `ZZ`, the target address of the master part.
    pub fn master_zz(&self) -> u8 {
        self.master_zz
    }

    /// The unstuffed master bytes (`QQ ZZ PB SB NN D1..DN`, no CRC).
    pub fn master(&self) -> &Sequence {
        &self.master
    }

    /// `NN` of the master part.
    pub fn master_nn(&self) -> usize {
        self.master_nn
    }

    /// CRC-8 of the master part.
    pub fn master_crc(&self) -> u8 {
        self.master_crc
    }

    /// Validity classification of the master part.
    pub fn master_state(&self) -> TelegramState {
        self.master_state
    }

    /// The slave's ACK/NAK byte in response to the master part.
    pub fn slave_ack(&self) -> u8 {
        self.slave_ack
    }

    /// The unstuffed slave bytes (`NN D1..DN`, no CRC).
    pub fn slave(&self) -> &Sequence {
        &self.slave
    }

    /// `NN` of the slave part.
    pub fn slave_nn(&self) -> usize {
        self.slave_nn
    }

    /// CRC-8 of the slave part.
    pub fn slave_crc(&self) -> u8 {
        self.slave_crc
    }

    /// Validity classification of the slave part.
    pub fn slave_state(&self) -> TelegramState {
        self.slave_state
    }

    /// The master's ACK/NAK byte in response to the slave part (MS only).
    pub fn master_ack(&self) -> u8 {
        self.master_ack
    }

    /// The telegram's class.
    pub fn kind(&self) -> TelegramType {
        self.kind
    }

    /// Whether the telegram is fully valid: both sides `Ok` for MS, the
    /// master side alone `Ok` otherwise.
    pub fn is_valid(&self) -> bool {
        if self.kind != TelegramType::MasterSlave {
            self.master_state == TelegramState::Ok
        } else {
            self.master_state == TelegramState::Ok && self.slave_state == TelegramState::Ok
        }
    }
}

/// Pre-check applied before slicing out a candidate master segment during
/// [`Telegram::parse`]: unlike [`Telegram::create_master`], this always
/// requires the CRC byte to be present.
fn check_master_sequence(seq: &Sequence) -> TelegramState {
    if seq.len() < 6 {
        return TelegramState::Short;
    }
    if !is_master_address(seq.at(0)) {
        return TelegramState::BadQq;
    }
    if !is_address_valid(seq.at(1)) {
        return TelegramState::BadZz;
    }
    let nn = seq.at(4) as usize;
    if nn > MAX_NN as usize {
        return TelegramState::BadNn;
    }
    if seq.len() < 5 + nn + 1 {
        return TelegramState::Short;
    }
    TelegramState::Ok
}

/// Pre-check applied before slicing out a candidate slave segment during
/// [`Telegram::parse`]; always requires the CRC byte to be present.
fn check_slave_sequence(seq: &Sequence) -> TelegramState {
    if seq.len() < 2 {
        return TelegramState::Short;
    }
    let nn = seq.at(0) as usize;
    if nn > MAX_NN as usize {
        return TelegramState::BadNn;
    }
    if seq.len() < 1 + nn + 1 {
        return TelegramState::Short;
    }
    TelegramState::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_ms_normal() {
        // AA AA AA FF 52 B5 09 03 0D 06 00 43 00 03 B0 FB A9 01 D0 00 AA AA AA
        let wire: Vec<u8> = vec![
            0xFF, 0x52, 0xB5, 0x09, 0x03, 0x0D, 0x06, 0x00, 0x43, 0x00, 0x03, 0xB0, 0xFB, 0xA9,
            0x01, 0xD0, 0x00,
        ];
        let s = Sequence::from_stuffed(&wire);
        let t = Telegram::parse(&s);
        assert_eq!(t.master_state(), TelegramState::Ok);
        assert_eq!(t.slave_state(), TelegramState::Ok);
        assert_eq!(t.kind(), TelegramType::MasterSlave);
        assert_eq!(
            t.master().as_slice(),
            &[0xFF, 0x52, 0xB5, 0x09, 0x03, 0x0D, 0x06, 0x00]
        );
        assert_eq!(t.slave().as_slice(), &[0x03, 0xB0, 0xFB, 0xAA, 0xD0]);
    }

    #[test]
    fn parse_accounts_for_master_retry_offset_before_the_slave_segment() {
        // master1 + NAK + master2 (retry, accepted) + ACK + slave + CRC:
        // the slave segment must be located past *both* master attempts,
        // not re-derived as if only one had ever been sent.
        let master1 = Telegram::build_master(0x10, &[0x52, 0xB5, 0x09, 0x00]);
        let master2 = Telegram::build_master(0x10, &[0x52, 0xB5, 0x09, 0x00]);
        let slave = Telegram::build_slave(&[0x00]);

        let mut wire = Vec::new();
        wire.extend_from_slice(master1.master().as_slice());
        wire.push(master1.master_crc());
        wire.push(NAK);
        wire.extend_from_slice(master2.master().as_slice());
        wire.push(master2.master_crc());
        wire.push(ACK);
        wire.extend_from_slice(slave.slave().as_slice());
        wire.push(slave.slave_crc());

        let t = Telegram::parse(&Sequence::from_bytes(&wire));
        assert_eq!(t.master_state(), TelegramState::Ok);
        assert_eq!(t.slave_state(), TelegramState::Ok);
        assert_eq!(t.master().as_slice(), master2.master().as_slice());
        assert_eq!(t.slave().as_slice(), slave.slave().as_slice());
    }

    #[test]
    fn master_classifier_rejects_bad_nn() {
        let mut bytes = vec![0x10, 0x52, 0xB5, 0x09, 17];
        bytes.extend_from_slice(&[0u8; 17]);
        let mut t = Telegram::empty();
        t.create_master(&Sequence::from_bytes(&bytes));
        assert_eq!(t.master_state(), TelegramState::BadNn);
    }

    #[test]
    fn master_classifier_accepts_nn_16() {
        let mut bytes = vec![0x10, 0x52, 0xB5, 0x09, 16];
        bytes.extend_from_slice(&[0x11u8; 16]);
        let mut t = Telegram::empty();
        t.create_master(&Sequence::from_bytes(&bytes));
        assert_eq!(t.master_state(), TelegramState::Ok);
    }

    #[test]
    fn master_classifier_rejects_bad_qq() {
        let bytes = vec![0xAB, 0x52, 0xB5, 0x09, 0x00];
        let mut t = Telegram::empty();
        t.create_master(&Sequence::from_bytes(&bytes));
        assert_eq!(t.master_state(), TelegramState::BadQq);
    }

    #[test]
    fn master_classifier_rejects_short() {
        let bytes = vec![0x10, 0x52, 0xB5];
        let mut t = Telegram::empty();
        t.create_master(&Sequence::from_bytes(&bytes));
        assert_eq!(t.master_state(), TelegramState::Short);
    }

    #[test]
    fn build_master_computes_crc() {
        let t = Telegram::build_master(0x10, &[0x52, 0xB5, 0x09, 0x00]);
        assert_eq!(t.master_state(), TelegramState::Ok);
        assert_eq!(t.master_qq(), 0x10);
        assert_eq!(t.master_zz(), 0x52);
    }

    #[test]
    fn broadcast_classification() {
        let t = Telegram::build_master(0x10, &[0xFE, 0xB5, 0x05, 0x02, 0x27, 0x00]);
        assert_eq!(t.kind(), TelegramType::Broadcast);
    }
}
