//! Telemetry packet decoding.
//!
//! Raw telemetry is a byte synchronized stream of CCSDS space packets. Every instrument TM
//! packet carries a PUS data field header with the service type, subtype and packet time
//! (see [DataHeader]).
use std::collections::HashMap;
use std::fmt::Display;
use std::io::{ErrorKind, Read};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::time::ScetTime;
use crate::{Error, Result};

pub type Apid = u16;

/// Packet is the first packet in a packet group
pub const SEQ_FIRST: u8 = 1;
/// Packet is a part of a packet group, but not first and not last
pub const SEQ_CONTINUATION: u8 = 0;
/// Packet is the last packet in a packet group
pub const SEQ_LAST: u8 = 2;
/// Packet is not part of a packet group, i.e., standalone.
pub const SEQ_UNSEGMENTED: u8 = 3;

/// CCSDS Primary Header
///
/// The primary header format is common to all CCSDS space packets.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub version: u8,
    pub type_flag: u8,
    pub has_secondary_header: bool,
    pub apid: Apid,
    /// Defines a packets grouping. See the `SEQ_*` values.
    pub sequence_flags: u8,
    pub sequence_id: u16,
    pub len_minus1: u16,
}

impl PrimaryHeader {
    /// Size of a ``PrimaryHeader``
    pub const LEN: usize = 6;
    pub const SEQ_MAX: u16 = 16383;

    /// Decode from bytes. Returns `None` if there are not enough bytes to construct the
    /// header.
    ///
    /// Same bit layout as the CCSDS space packet primary header decoder of the `ccsds` crate.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        let d1 = u16::from_be_bytes([buf[0], buf[1]]);
        let d2 = u16::from_be_bytes([buf[2], buf[3]]);
        let d3 = u16::from_be_bytes([buf[4], buf[5]]);

        Some(PrimaryHeader {
            version: (d1 >> 13 & 0x7) as u8,
            type_flag: (d1 >> 12 & 0x1) as u8,
            has_secondary_header: (d1 >> 11 & 0x1) == 1,
            apid: (d1 & 0x7ff),
            sequence_flags: (d2 >> 14 & 0x3) as u8,
            sequence_id: (d2 & 0x3fff),
            len_minus1: d3,
        })
    }

    /// Total packet length, including this header.
    #[must_use]
    pub fn packet_len(&self) -> usize {
        Self::LEN + self.len_minus1 as usize + 1
    }
}

/// PUS telemetry data field header following the primary header.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub pus_version: u8,
    pub service_type: u8,
    pub service_subtype: u8,
    pub destination_id: u8,
    /// Packet time. Bit 31 is set while the instrument clock is unsynchronized.
    pub scet_coarse: u32,
    pub scet_fine: u16,
}

impl DataHeader {
    pub const LEN: usize = 10;

    /// Decode from the bytes following the primary header.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `buf` is shorter than [DataHeader::LEN].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: Self::LEN,
            });
        }
        Ok(DataHeader {
            pus_version: (buf[0] >> 4) & 0x7,
            service_type: buf[1],
            service_subtype: buf[2],
            destination_id: buf[3],
            scet_coarse: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            scet_fine: u16::from_be_bytes([buf[8], buf[9]]),
        })
    }
}

/// A single instrument telemetry packet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TmPacket {
    pub header: PrimaryHeader,
    pub data_header: DataHeader,
    /// All packet bytes, including headers.
    pub data: Vec<u8>,
    /// Byte offset of this packet in the stream it was read from.
    #[serde(default)]
    pub offset: usize,
}

impl Display for TmPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TmPacket{{apid={}, seq={}, service={}/{}, ssid={:?}, len={}}}",
            self.header.apid,
            self.header.sequence_id,
            self.data_header.service_type,
            self.data_header.service_subtype,
            self.ssid(),
            self.data.len()
        )
    }
}

impl TmPacket {
    /// Decode a complete packet from `buf`.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if `buf` is shorter than the headers or the length given by the
    /// primary header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let Some(header) = PrimaryHeader::decode(buf) else {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: PrimaryHeader::LEN,
            });
        };
        if buf.len() < header.packet_len() {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: header.packet_len(),
            });
        }
        let data_header = DataHeader::decode(&buf[PrimaryHeader::LEN..header.packet_len()])?;
        Ok(TmPacket {
            header,
            data_header,
            data: buf[..header.packet_len()].to_vec(),
            offset: 0,
        })
    }

    /// Decode from the hex text used to store packets in level binary products.
    ///
    /// # Errors
    /// [Error::Decode] if `hex` is not valid hex, otherwise as [TmPacket::decode].
    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes =
            hex::decode(hex.trim()).map_err(|e| Error::Decode(format!("invalid hex: {e}")))?;
        Self::decode(&bytes)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.data)
    }

    /// Application data following both headers.
    #[must_use]
    pub fn app_data(&self) -> &[u8] {
        &self.data[PrimaryHeader::LEN + DataHeader::LEN..]
    }

    /// Structure id, the first application data byte of housekeeping and science packets.
    #[must_use]
    pub fn ssid(&self) -> Option<u8> {
        match self.data_header.service_type {
            3 | 21 => self.app_data().first().copied(),
            _ => None,
        }
    }

    /// Product key `(service_type, service_subtype, ssid)`.
    #[must_use]
    pub fn key(&self) -> (u8, u8, Option<u8>) {
        (
            self.data_header.service_type,
            self.data_header.service_subtype,
            self.ssid(),
        )
    }

    /// Packet time with the synchronization flag removed.
    #[must_use]
    pub fn scet(&self) -> ScetTime {
        ScetTime::new(
            self.data_header.scet_coarse & !crate::time::UNSYNCED_FLAG,
            self.data_header.scet_fine,
        )
    }

    #[must_use]
    pub fn is_first(&self) -> bool {
        self.header.sequence_flags == SEQ_FIRST
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.header.sequence_flags == SEQ_LAST
    }

    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.header.sequence_flags == SEQ_UNSEGMENTED
    }
}

/// Calculate the number of missing sequence ids.
///
/// `cur` is the current sequence id. `last` is the sequence id seen before `cur`.
#[must_use]
pub fn missing_packets(cur: u16, last: u16) -> u16 {
    let expected = if last + 1 > PrimaryHeader::SEQ_MAX {
        0
    } else {
        last + 1
    };
    if cur != expected {
        if last + 1 > cur {
            return cur + PrimaryHeader::SEQ_MAX - last;
        }
        return cur - last - 1;
    }
    0
}

struct PacketReaderIter<R: Read> {
    reader: R,
    offset: usize,
}

impl<R: Read> Iterator for PacketReaderIter<R> {
    type Item = Result<TmPacket>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = vec![0u8; PrimaryHeader::LEN];
        if let Err(err) = self.reader.read_exact(&mut buf) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return None;
            }
            return Some(Err(err.into()));
        }
        // can't fail, we have exactly enough bytes
        let header = PrimaryHeader::decode(&buf)?;
        buf.resize(header.packet_len(), 0);
        if let Err(err) = self.reader.read_exact(&mut buf[PrimaryHeader::LEN..]) {
            if err.kind() == ErrorKind::UnexpectedEof {
                warn!(offset = self.offset, "truncated packet at end of stream");
                return None;
            }
            return Some(Err(err.into()));
        }

        let offset = self.offset;
        self.offset += buf.len();
        Some(TmPacket::decode(&buf).map(|mut p| {
            p.offset = offset;
            p
        }))
    }
}

/// Return an iterator providing [TmPacket]s read from a byte synchronized packet stream.
///
/// Packets too short to contain the PUS data field header are returned as errors and the
/// stream continues with the next packet.
///
/// # Examples
/// ```
/// use stixcore::tmtc::read_packets;
///
/// let dat: &[u8] = &[
///     // primary header bytes, apid 1460, standalone, 12 data bytes
///     0x0d, 0xb4, 0xc0, 0x01, 0x00, 0x0b,
///     // data field header: service 3/25, coarse 10, fine 0
///     0x10, 0x03, 0x19, 0x00, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00,
///     // SID and one parameter byte
///     0x01, 0xff,
/// ];
///
/// let packets: Vec<_> = read_packets(dat).map(Result::unwrap).collect();
/// assert_eq!(packets[0].header.apid, 1460);
/// assert_eq!(packets[0].key(), (3, 25, Some(1)));
/// ```
pub fn read_packets<R>(reader: R) -> impl Iterator<Item = Result<TmPacket>>
where
    R: Read,
{
    PacketReaderIter { reader, offset: 0 }
}

/// Packets of one packet sequence according to the primary header sequence flags.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PacketSequence {
    pub apid: Apid,
    pub packets: Vec<TmPacket>,
}

impl PacketSequence {
    /// A sequence is complete when it is a single standalone packet, or starts with a first
    /// packet, ends with a last packet and has no sequence id gaps.
    #[must_use]
    pub fn complete(&self) -> bool {
        match (self.packets.first(), self.packets.last()) {
            (Some(first), _) if self.packets.len() == 1 => first.is_standalone(),
            (Some(first), Some(last)) => {
                first.is_first() && last.is_last() && !self.have_missing()
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn have_missing(&self) -> bool {
        self.packets.windows(2).any(|w| {
            missing_packets(w[1].header.sequence_id, w[0].header.sequence_id) > 0
        })
    }
}

/// Group packets into sequences per APID, dropping incomplete sequences.
///
/// Packet sequences of different APIDs may be interleaved.
pub fn collect_sequences<I>(packets: I) -> Vec<PacketSequence>
where
    I: IntoIterator<Item = TmPacket>,
{
    let mut open: HashMap<Apid, PacketSequence> = HashMap::default();
    let mut sequences = Vec::default();

    let mut emit = |seq: PacketSequence, sequences: &mut Vec<PacketSequence>| {
        if seq.complete() {
            sequences.push(seq);
        } else {
            warn!(
                apid = seq.apid,
                packets = seq.packets.len(),
                "dropping incomplete packet sequence"
            );
        }
    };

    for packet in packets {
        let apid = packet.header.apid;
        if packet.is_standalone() || packet.is_first() {
            if let Some(seq) = open.remove(&apid) {
                emit(seq, &mut sequences);
            }
        }
        if packet.is_standalone() {
            emit(
                PacketSequence {
                    apid,
                    packets: vec![packet],
                },
                &mut sequences,
            );
            continue;
        }
        let is_last = packet.is_last();
        let seq = open.entry(apid).or_insert_with(|| PacketSequence {
            apid,
            packets: Vec::default(),
        });
        seq.packets.push(packet);
        if is_last {
            if let Some(seq) = open.remove(&apid) {
                trace!(apid, packets = seq.packets.len(), "sequence complete");
                emit(seq, &mut sequences);
            }
        }
    }

    let mut remaining: Vec<PacketSequence> = open.into_values().collect();
    remaining.sort_by_key(|s| s.apid);
    for seq in remaining {
        emit(seq, &mut sequences);
    }
    sequences
}

/// Helpers to build packets in tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Encode a TM packet with the given header values and application data.
    pub fn packet_bytes(
        apid: Apid,
        sequence_flags: u8,
        sequence_id: u16,
        (service_type, service_subtype): (u8, u8),
        (coarse, fine): (u32, u16),
        app_data: &[u8],
    ) -> Vec<u8> {
        let data_len = DataHeader::LEN + app_data.len();
        let mut buf = Vec::with_capacity(PrimaryHeader::LEN + data_len);
        buf.extend_from_slice(&(0x0800 | apid).to_be_bytes());
        buf.extend_from_slice(
            &((u16::from(sequence_flags) << 14) | (sequence_id & 0x3fff)).to_be_bytes(),
        );
        buf.extend_from_slice(&((data_len - 1) as u16).to_be_bytes());
        buf.extend_from_slice(&[0x10, service_type, service_subtype, 0]);
        buf.extend_from_slice(&coarse.to_be_bytes());
        buf.extend_from_slice(&fine.to_be_bytes());
        buf.extend_from_slice(app_data);
        buf
    }

    pub fn packet(
        sequence_flags: u8,
        sequence_id: u16,
        service: (u8, u8),
        time: (u32, u16),
        app_data: &[u8],
    ) -> TmPacket {
        TmPacket::decode(&packet_bytes(
            1460,
            sequence_flags,
            sequence_id,
            service,
            time,
            app_data,
        ))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn decode_headers() {
        let p = packet(SEQ_UNSEGMENTED, 7, (21, 6), (0x8000_0010, 5), &[30, 1, 2]);
        assert_eq!(p.header.apid, 1460);
        assert!(p.header.has_secondary_header);
        assert_eq!(p.header.sequence_id, 7);
        assert_eq!(p.data_header.pus_version, 1);
        assert_eq!(p.key(), (21, 6, Some(30)));
        assert_eq!(p.app_data(), &[30, 1, 2]);
        assert_eq!(p.scet(), ScetTime::new(0x10, 5));
        assert_eq!(TmPacket::from_hex(&p.to_hex()).unwrap(), p);
    }

    #[test]
    fn decode_too_short() {
        let bytes = packet_bytes(1460, SEQ_UNSEGMENTED, 0, (5, 1), (0, 0), &[]);
        assert!(matches!(
            TmPacket::decode(&bytes[..8]),
            Err(Error::NotEnoughData { .. })
        ));
        assert!(matches!(TmPacket::from_hex("zz"), Err(Error::Decode(_))));
    }

    #[test]
    fn read_stream() {
        let mut dat = packet_bytes(1460, SEQ_UNSEGMENTED, 0, (3, 25), (1, 0), &[1, 0]);
        dat.extend(packet_bytes(1460, SEQ_UNSEGMENTED, 1, (3, 25), (2, 0), &[2]));
        // truncated trailing packet is ignored
        dat.extend(&packet_bytes(1460, SEQ_UNSEGMENTED, 2, (3, 25), (3, 0), &[1])[..9]);

        let packets: Vec<TmPacket> = read_packets(dat.as_slice()).map(Result::unwrap).collect();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].offset, packets[0].data.len());
        assert_eq!(packets[1].ssid(), Some(2));
    }

    #[test]
    fn test_missing_packets() {
        assert_eq!(missing_packets(5, 4), 0);
        assert_eq!(missing_packets(5, 3), 1);
        assert_eq!(missing_packets(0, PrimaryHeader::SEQ_MAX), 0);
        assert_eq!(missing_packets(0, PrimaryHeader::SEQ_MAX - 1), 1);
    }

    #[test]
    fn sequences() {
        let s = (21, 6);
        let packets = vec![
            packet(SEQ_UNSEGMENTED, 0, s, (1, 0), &[30]),
            packet(SEQ_FIRST, 1, s, (2, 0), &[20]),
            packet(SEQ_CONTINUATION, 2, s, (2, 0), &[20]),
            packet(SEQ_LAST, 3, s, (2, 0), &[20]),
            // missing first packet
            packet(SEQ_CONTINUATION, 5, s, (3, 0), &[20]),
            packet(SEQ_LAST, 6, s, (3, 0), &[20]),
            // never finished
            packet(SEQ_FIRST, 7, s, (4, 0), &[20]),
        ];
        let sequences = collect_sequences(packets);
        let lens: Vec<usize> = sequences.iter().map(|s| s.packets.len()).collect();
        assert_eq!(lens, vec![1, 3]);
    }
}
