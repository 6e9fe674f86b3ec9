//! Per-channel descrambling pipeline.
//!
//! A [`Descrambler`] owns everything one channel needs to turn raw
//! multicast datagrams into cleartext TS: the RTP framer, the PSI walker,
//! the master-key schedule and the current working-key pair. Datagrams
//! are processed in place, strictly in arrival order.

mod ecm;
mod error;
mod psi;
mod rtp;
mod ts;

pub use error::DescrambleError;
pub use ts::TS_PACKET_SIZE;

use aes::Aes128;

use ecm::WorkingKeys;
use psi::PsiWalker;
use rtp::RtpFramer;
use ts::{descramble_packet, pid};

/// Stateful RTP → PSI → ECM → TS pipeline for one channel.
pub struct Descrambler {
    framer: RtpFramer,
    walker: PsiWalker,
    keys: WorkingKeys,
    master: Aes128,
}

impl Descrambler {
    pub fn new(master_key: &[u8; 16]) -> Self {
        Self {
            framer: RtpFramer::new(),
            walker: PsiWalker::new(),
            keys: WorkingKeys::new(),
            master: ecm::master_cipher(master_key),
        }
    }

    /// Descramble one datagram in place and return the offset at which
    /// the TS payload starts.
    ///
    /// The payload after the RTP header must be a whole number of
    /// 188-byte packets. Each packet is run through the PSI walker, the
    /// ECM processor when it sits on the ECM PID, and the descrambler.
    pub fn process_datagram(&mut self, datagram: &mut [u8]) -> Result<usize, DescrambleError> {
        let offset = self.framer.frame(datagram)?;
        let payload = &mut datagram[offset..];
        if payload.len() % TS_PACKET_SIZE != 0 {
            return Err(DescrambleError::RtpPayloadLength(datagram.len()));
        }
        for pkt in payload.chunks_exact_mut(TS_PACKET_SIZE) {
            self.process_packet(pkt)?;
        }
        Ok(offset)
    }

    fn process_packet(&mut self, pkt: &mut [u8]) -> Result<(), DescrambleError> {
        self.walker.inspect(pkt)?;
        if self.walker.ecm_pid() == Some(pid(pkt)) {
            self.keys.install_from_ecm(&self.master, pkt)?;
        }
        descramble_packet(pkt, &self.keys);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use aes::cipher::{BlockEncrypt, KeyInit};
    use aes::{Aes128, Block};

    use super::ecm::ECM_MAGIC;
    use super::ts::SYNC_BYTE;
    use super::*;

    const MASTER: [u8; 16] = [7u8; 16];
    const EVEN_KEY: [u8; 16] = [0x11; 16];
    const ODD_KEY: [u8; 16] = [0x99; 16];

    fn ts_packet(pid_val: u16) -> [u8; 188] {
        let mut pkt = [0u8; 188];
        pkt[0] = SYNC_BYTE;
        pkt[1] = (pid_val >> 8) as u8;
        pkt[2] = pid_val as u8;
        pkt
    }

    fn pat(pmt_pid: u16) -> [u8; 188] {
        let mut pkt = ts_packet(0);
        pkt[15] = (pmt_pid >> 8) as u8;
        pkt[16] = pmt_pid as u8;
        pkt
    }

    fn pmt(pmt_pid: u16, ecm_pid: u16) -> [u8; 188] {
        let mut pkt = ts_packet(pmt_pid);
        pkt[5] = 0x02;
        pkt[16] = 6; // program-info length
        pkt[17..23].copy_from_slice(&[
            0x09,
            0x04,
            0x56,
            0x01,
            (ecm_pid >> 8) as u8,
            ecm_pid as u8,
        ]);
        pkt
    }

    fn ecm(ecm_pid: u16) -> [u8; 188] {
        let mut plain = [0u8; 64];
        plain[..3].copy_from_slice(&ECM_MAGIC);
        plain[9..25].copy_from_slice(&EVEN_KEY);
        plain[25..41].copy_from_slice(&ODD_KEY);

        let mut pkt = ts_packet(ecm_pid);
        pkt[5] = 0x81;
        pkt[29..93].copy_from_slice(&plain);
        let cipher = Aes128::new(&MASTER.into());
        for block in pkt[29..93].chunks_exact_mut(16) {
            cipher.encrypt_block(Block::from_mut_slice(block));
        }
        pkt
    }

    fn scrambled(pid_val: u16, key: &[u8; 16]) -> ([u8; 188], [u8; 188]) {
        let mut clear = ts_packet(pid_val);
        clear[3] = 3 << 6;
        for (i, b) in clear[4..].iter_mut().enumerate() {
            *b = (i * 3) as u8;
        }
        let mut enc = clear;
        let cipher = Aes128::new(key.into());
        let mut body = &mut enc[4..];
        while body.len() > 16 {
            let (block, rest) = body.split_at_mut(16);
            cipher.encrypt_block(Block::from_mut_slice(block));
            body = rest;
        }
        (clear, enc)
    }

    fn datagram(seq: u16, packets: &[[u8; 188]]) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf[0] = 0x80;
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        for pkt in packets {
            buf.extend_from_slice(pkt);
        }
        buf
    }

    #[test]
    fn test_full_pipeline_descrambles_stream() {
        let mut descrambler = Descrambler::new(&MASTER);
        let (clear, enc) = scrambled(0x0200, &ODD_KEY);

        // PSI and the ECM arrive first, then a scrambled packet.
        let mut dgram = datagram(1, &[pat(0x0042), pmt(0x0042, 0x0123), ecm(0x0123), enc]);
        let offset = descrambler.process_datagram(&mut dgram).unwrap();
        assert_eq!(offset, 12);

        let out = &dgram[12 + 3 * 188..];
        assert_eq!(out, &clear);
    }

    #[test]
    fn test_scrambled_before_first_ecm_passes_through() {
        let mut descrambler = Descrambler::new(&MASTER);
        let (_, enc) = scrambled(0x0200, &ODD_KEY);

        let mut dgram = datagram(1, &[pat(0x0042), pmt(0x0042, 0x0123), enc]);
        descrambler.process_datagram(&mut dgram).unwrap();

        // No key installed yet: the packet comes out as it went in.
        assert_eq!(&dgram[12 + 2 * 188..], &enc);
    }

    #[test]
    fn test_misaligned_payload_rejected() {
        let mut descrambler = Descrambler::new(&MASTER);
        let mut dgram = datagram(1, &[ts_packet(0x0100)]);
        dgram.push(0);
        assert_eq!(
            descrambler.process_datagram(&mut dgram),
            Err(DescrambleError::RtpPayloadLength(12 + 188 + 1))
        );
    }

    #[test]
    fn test_empty_payload_is_aligned() {
        let mut descrambler = Descrambler::new(&MASTER);
        let mut dgram = datagram(1, &[]);
        assert_eq!(descrambler.process_datagram(&mut dgram), Ok(12));
    }
}
