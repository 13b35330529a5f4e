//! ISO 7816-4 APDU command/response framing.
//!
//! Commands are serialised into one of the standard cases (1, 2S, 3S, 4S, or
//! the extended forms) based purely on the payload and expected-length
//! fields; callers never pick the case themselves. Responses are the
//! mirror image: a data payload followed by the two status bytes SW1 SW2.
//!
//! The codec does not interpret status words. [`Status`] carries a couple of
//! convenience accessors for conventions like `63CX` retry counters, but
//! acting on them is an application concern.

use byteorder::{BigEndian, ByteOrder};

use crate::errors::{Error, Result};

/// Largest command payload (Lc) representable on the wire.
pub const MAX_DATA_LEN: usize = 65535;
/// Largest expected-response length (Le) representable on the wire.
pub const MAX_LE: u32 = 65536;

/// A command APDU.
///
/// `le` is the expected (maximum) response length. Zero is not a legal value;
/// "give me everything" is expressed as 256 (short) or 65536 (extended),
/// which encode as zero bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub cla: u8,       // Class byte.
    pub ins: u8,       // Instruction byte.
    pub p1: u8,        // First parameter.
    pub p2: u8,        // Second parameter.
    pub data: Vec<u8>, // Command data, 0-65535 bytes.
    pub le: Option<u32>,
}

impl Command {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    pub fn with_data<T: Into<Vec<u8>>>(mut self, data: T) -> Self {
        self.data = data.into();
        self
    }

    /// Sets the expected response length.
    pub fn expect(mut self, le: u32) -> Self {
        self.le = Some(le);
        self
    }

    /// True if this command can only be carried in the extended form.
    pub fn is_extended(&self) -> bool {
        self.data.len() > 255 || self.le.map_or(false, |le| le > 256)
    }

    /// Serialises the command.
    ///
    /// Short form: `CLA INS P1 P2 [Lc data] [Le]`, with `Le = 0x00` meaning
    /// 256. Extended form: `CLA INS P1 P2 00 [Lc: u16 data] [Le: u16]`, with
    /// `Le = 0x0000` meaning 65536. The leading `00` marker is emitted once,
    /// even when only Le is present.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_DATA_LEN {
            return Err(Error::invalid(format!(
                "command data too long: {} > {}",
                self.data.len(),
                MAX_DATA_LEN
            )));
        }
        match self.le {
            Some(0) => {
                return Err(Error::invalid(
                    "Le of 0 is not a legal value, use 256 or 65536",
                ))
            }
            Some(le) if le > MAX_LE => {
                return Err(Error::invalid(format!("Le too large: {} > {}", le, MAX_LE)))
            }
            _ => (),
        }

        let mut bin = vec![self.cla, self.ins, self.p1, self.p2];
        if self.is_extended() {
            bin.push(0x00);
            if !self.data.is_empty() {
                let mut lc = [0u8; 2];
                BigEndian::write_u16(&mut lc, self.data.len() as u16);
                bin.extend_from_slice(&lc);
                bin.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                let mut b = [0u8; 2];
                BigEndian::write_u16(&mut b, if le == MAX_LE { 0 } else { le as u16 });
                bin.extend_from_slice(&b);
            }
        } else {
            if !self.data.is_empty() {
                bin.push(self.data.len() as u8);
                bin.extend_from_slice(&self.data);
            }
            if let Some(le) = self.le {
                bin.push(if le == 256 { 0 } else { le as u8 });
            }
        }
        Ok(bin)
    }

    /// Parses a serialised command; the exact inverse of [`Command::encode`]
    /// over legal frames.
    pub fn decode(bin: &[u8]) -> Result<Self> {
        let (&[cla, ins, p1, p2], body) = bin
            .split_first_chunk::<4>()
            .ok_or_else(|| Error::protocol("command shorter than a header"))?;
        let mut cmd = Command::new(cla, ins, p1, p2);

        match body.len() {
            0 => (), // Case 1.
            1 => {
                // Case 2S; 0x00 means 256.
                cmd.le = Some(match body[0] {
                    0 => 256,
                    le => le as u32,
                });
            }
            _ if body[0] == 0x00 => {
                // Extended; the marker byte is followed by u16 length fields.
                let rest = &body[1..];
                if rest.len() == 2 {
                    cmd.le = Some(match BigEndian::read_u16(rest) {
                        0 => MAX_LE,
                        le => le as u32,
                    });
                } else if rest.len() > 2 {
                    let lc = BigEndian::read_u16(rest) as usize;
                    if lc == 0 {
                        return Err(Error::protocol("extended Lc of zero"));
                    }
                    let rest = &rest[2..];
                    if rest.len() == lc {
                        cmd.data = rest.to_vec();
                    } else if rest.len() == lc + 2 {
                        cmd.data = rest[..lc].to_vec();
                        cmd.le = Some(match BigEndian::read_u16(&rest[lc..]) {
                            0 => MAX_LE,
                            le => le as u32,
                        });
                    } else {
                        return Err(Error::protocol("extended body length mismatch"));
                    }
                } else {
                    return Err(Error::protocol("truncated extended length field"));
                }
            }
            _ => {
                // Case 3S or 4S.
                let lc = body[0] as usize;
                let rest = &body[1..];
                if rest.len() == lc {
                    cmd.data = rest.to_vec();
                } else if rest.len() == lc + 1 {
                    cmd.data = rest[..lc].to_vec();
                    cmd.le = Some(match rest[lc] {
                        0 => 256,
                        le => le as u32,
                    });
                } else {
                    return Err(Error::protocol("short body length mismatch"));
                }
            }
        }
        Ok(cmd)
    }
}

/// The two trailing status bytes of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u8, pub u8);

impl Status {
    /// The combined status word, `(SW1 << 8) | SW2`.
    pub fn sw(&self) -> u16 {
        (self.0 as u16) << 8 | self.1 as u16
    }

    /// 0x9000, the universal "all good".
    pub fn is_ok(&self) -> bool {
        self.sw() == 0x9000
    }

    /// For `63CX` statuses, the remaining retry count X.
    pub fn retry_counter(&self) -> Option<u8> {
        match (self.0, self.1) {
            (0x63, x) if x & 0xF0 == 0xC0 => Some(x & 0x0F),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", self.sw())
    }
}

/// A response APDU: payload plus status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub status: Status,
}

impl Response {
    pub fn new<T: Into<Vec<u8>>>(status: Status, data: T) -> Self {
        Self {
            data: data.into(),
            status,
        }
    }

    /// Splits a wire response into payload and status. Anything shorter than
    /// the two mandatory status bytes is malformed.
    pub fn decode(bin: &[u8]) -> Result<Self> {
        let (data, &[sw1, sw2]) = bin
            .split_last_chunk::<2>()
            .ok_or_else(|| Error::protocol("response shorter than SW1 SW2"))?;
        Ok(Self {
            data: data.to_vec(),
            status: Status(sw1, sw2),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bin = self.data.clone();
        bin.push(self.status.0);
        bin.push(self.status.1);
        bin
    }

    pub fn sw(&self) -> u16 {
        self.status.sw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_encode_case_1() {
        let bin = Command::new(0x00, 0xA4, 0x04, 0x00).encode().unwrap();
        assert_eq!(bin, vec![0x00, 0xA4, 0x04, 0x00]);
    }

    #[test]
    fn test_encode_case_2s() {
        let bin = Command::new(0x00, 0xB0, 0x00, 0x00)
            .expect(0x0F)
            .encode()
            .unwrap();
        assert_eq!(bin, vec![0x00, 0xB0, 0x00, 0x00, 0x0F]);
    }

    #[test]
    fn test_encode_case_2s_le_256() {
        // READ BINARY asking for the maximum; Le=256 encodes as 0x00.
        let bin = Command::new(0x00, 0xB0, 0x00, 0x00)
            .expect(256)
            .encode()
            .unwrap();
        assert_eq!(bin, vec![0x00, 0xB0, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_case_3s() {
        // SELECT by DF name, no Le.
        let bin = Command::new(0x00, 0xA4, 0x04, 0x0C)
            .with_data(vec![
                0xD3, 0x92, 0x10, 0x00, 0x31, 0x00, 0x01, 0x01, 0x04, 0x08,
            ])
            .encode()
            .unwrap();
        assert_eq!(
            bin,
            vec![
                0x00, 0xA4, 0x04, 0x0C, 0x0A, 0xD3, 0x92, 0x10, 0x00, 0x31, 0x00, 0x01, 0x01,
                0x04, 0x08
            ]
        );
    }

    #[test]
    fn test_encode_case_4s() {
        let bin = Command::new(0x00, 0xA4, 0x04, 0x00)
            .with_data(vec![0x31, 0x50, 0x41, 0x59])
            .expect(256)
            .encode()
            .unwrap();
        assert_eq!(
            bin,
            vec![0x00, 0xA4, 0x04, 0x00, 0x04, 0x31, 0x50, 0x41, 0x59, 0x00]
        );
    }

    #[test]
    fn test_encode_extended_le_only() {
        // Le=65536 encodes as 00 00 after the extended marker.
        let bin = Command::new(0x00, 0xB0, 0x00, 0x00)
            .expect(65536)
            .encode()
            .unwrap();
        assert_eq!(bin, vec![0x00, 0xB0, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_extended_le_300() {
        let bin = Command::new(0x00, 0xB0, 0x00, 0x00)
            .expect(300)
            .encode()
            .unwrap();
        assert_eq!(bin, vec![0x00, 0xB0, 0x00, 0x00, 0x00, 0x01, 0x2C]);
    }

    #[test]
    fn test_encode_extended_data() {
        let data = vec![0x69; 300];
        let bin = Command::new(0x00, 0xD6, 0x00, 0x00)
            .with_data(data.clone())
            .encode()
            .unwrap();
        assert_eq!(&bin[..7], &[0x00, 0xD6, 0x00, 0x00, 0x00, 0x01, 0x2C]);
        assert_eq!(&bin[7..], data.as_slice());
    }

    #[test]
    fn test_encode_extended_data_and_le() {
        // A short payload rides along in extended form when Le forces it.
        let bin = Command::new(0x00, 0xCB, 0x3F, 0xFF)
            .with_data(vec![0x5C, 0x01, 0x7F])
            .expect(65536)
            .encode()
            .unwrap();
        assert_eq!(
            bin,
            vec![0x00, 0xCB, 0x3F, 0xFF, 0x00, 0x00, 0x03, 0x5C, 0x01, 0x7F, 0x00, 0x00]
        );
    }

    #[test]
    fn test_encode_le_zero_rejected() {
        let err = Command::new(0x00, 0xB0, 0x00, 0x00)
            .expect(0)
            .encode()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_encode_le_too_large_rejected() {
        let err = Command::new(0x00, 0xB0, 0x00, 0x00)
            .expect(65537)
            .encode()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_decode_rejects_runt() {
        let err = Command::decode(&[0x00, 0xA4, 0x04]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        // Lc claims 4 bytes, only 2 follow (and it's not a valid 4S either).
        let err = Command::decode(&[0x00, 0xA4, 0x04, 0x00, 0x04, 0x31, 0x50]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn test_round_trip() {
        let cases = vec![
            Command::new(0x00, 0xA4, 0x04, 0x00),
            Command::new(0x00, 0xB0, 0x00, 0x00).expect(1),
            Command::new(0x00, 0xB0, 0x00, 0x00).expect(256),
            Command::new(0x00, 0xB0, 0x00, 0x00).expect(257),
            Command::new(0x00, 0xB0, 0x00, 0x00).expect(65536),
            Command::new(0x80, 0xCA, 0x9F, 0x7F).with_data(vec![0x01]),
            Command::new(0x80, 0xCA, 0x9F, 0x7F).with_data(vec![0xAB; 255]),
            Command::new(0x80, 0xCA, 0x9F, 0x7F).with_data(vec![0xAB; 256]),
            Command::new(0x80, 0xCA, 0x9F, 0x7F).with_data(vec![0xAB; 65535]),
            Command::new(0x00, 0x20, 0x00, 0x80)
                .with_data(vec![0x31, 0x32, 0x33, 0x34])
                .expect(256),
            Command::new(0x00, 0x20, 0x00, 0x80)
                .with_data(vec![0x31; 4])
                .expect(65536),
            Command::new(0x00, 0x20, 0x00, 0x80)
                .with_data(vec![0x31; 900])
                .expect(2),
        ];
        for cmd in cases {
            let bin = cmd.encode().expect("couldn't encode");
            let back = Command::decode(&bin).expect("couldn't decode");
            assert_eq!(back, cmd, "round trip mismatch for {:02X?}", &bin[..bin.len().min(8)]);
            // Case selection: the short/extended split is a function of the fields.
            assert_eq!(
                bin.len() > 5 && bin[4] == 0x00,
                cmd.is_extended(),
                "wrong case for {:02X?}",
                &bin[..bin.len().min(8)]
            );
        }
    }

    #[test]
    fn test_decode_response() {
        let rsp = Response::decode(&[0x01, 0x02, 0x03, 0x04, 0x90, 0x00]).unwrap();
        assert_eq!(rsp.data, vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(rsp.status, Status(0x90, 0x00));
        assert_eq!(rsp.sw(), 0x9000);
        assert!(rsp.status.is_ok());
    }

    #[test]
    fn test_decode_response_status_only() {
        let rsp = Response::decode(&[0x63, 0xC2]).unwrap();
        assert_eq!(rsp.data, Vec::<u8>::new());
        assert_eq!(rsp.sw(), 0x63C2);
        assert_eq!(rsp.status.retry_counter(), Some(2));
    }

    #[test]
    fn test_decode_response_too_short() {
        for bin in [&[][..], &[0x90][..]] {
            let err = Response::decode(bin).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ProtocolError);
        }
    }

    #[test]
    fn test_response_encode_is_wire_form() {
        let rsp = Response::new(Status(0x6A, 0x82), vec![0xDE, 0xAD]);
        assert_eq!(rsp.encode(), vec![0xDE, 0xAD, 0x6A, 0x82]);
        assert_eq!(Response::decode(&rsp.encode()).unwrap(), rsp);
    }

    #[test]
    fn test_retry_counter_only_for_63cx() {
        assert_eq!(Status(0x63, 0xC0).retry_counter(), Some(0));
        assert_eq!(Status(0x63, 0xCF).retry_counter(), Some(15));
        assert_eq!(Status(0x63, 0x40).retry_counter(), None);
        assert_eq!(Status(0x90, 0x00).retry_counter(), None);
    }
}
