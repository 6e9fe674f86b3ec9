//! PSI table walk: PAT → PMT → ECM PID discovery.
//!
//! The walker only supports the layout these streams actually use: a
//! single program, sections starting right after the TS header with a
//! zero pointer field, and the ECM PID announced through a CA descriptor
//! in the PMT program-info loop. Anything else is a hard error — the
//! engine gives up rather than guessing at a layout it cannot descramble.

use super::error::DescrambleError;
use super::ts::{self, SYNC_BYTE};

/// Well-known PIDs.
pub mod pid {
    /// Program Association Table PID.
    pub const PAT: u16 = 0x0000;
}

/// Table ids of the sections the walker inspects.
pub mod table_id {
    /// Program Association Section.
    pub const PAT: u8 = 0x00;
    /// Program Map Section.
    pub const PMT: u8 = 0x02;
}

/// Conditional-access descriptor tag in the PMT program-info loop.
const CA_DESCRIPTOR_TAG: u8 = 0x09;

/// CA system id of the scrambling system this relay understands.
const CA_SYSTEM_ID: u16 = 0x5601;

/// Incremental PSI scanner for one channel.
#[derive(Debug, Default)]
pub struct PsiWalker {
    pmt_pid: Option<u16>,
    ecm_pid: Option<u16>,
}

impl PsiWalker {
    pub fn new() -> Self {
        Self::default()
    }

    /// PID carrying the ECMs, once the PMT has been seen.
    pub fn ecm_pid(&self) -> Option<u16> {
        self.ecm_pid
    }

    /// Inspect one 188-byte TS packet, learning the PMT PID from the PAT
    /// and the ECM PID from the PMT's CA descriptor.
    pub fn inspect(&mut self, pkt: &[u8]) -> Result<(), DescrambleError> {
        if pkt[0] != SYNC_BYTE {
            return Err(DescrambleError::TsSync(pkt[0]));
        }
        let pid_val = ts::pid(pkt);

        if self.pmt_pid.is_none() && pid_val == pid::PAT {
            if pkt[4] != 0 {
                return Err(DescrambleError::PatPointer);
            }
            if pkt[5] != table_id::PAT {
                return Err(DescrambleError::PatTable(pkt[5]));
            }
            self.pmt_pid = Some(u16::from_be_bytes([pkt[15], pkt[16]]) & 0x1FFF);
        }

        if self.ecm_pid.is_none() && self.pmt_pid == Some(pid_val) {
            if pkt[4] != 0 {
                return Err(DescrambleError::PmtPointer);
            }
            if pkt[5] != table_id::PMT {
                return Err(DescrambleError::PmtTable(pkt[5]));
            }
            let pi_length = (u16::from_be_bytes([pkt[15], pkt[16]]) & 0x03FF) as usize;
            let end = (17 + pi_length).min(pkt.len());
            self.ecm_pid = Some(find_ecm_pid(&pkt[17..end])?);
        }

        Ok(())
    }
}

/// Scan a `(tag, length, value)` descriptor loop for a CA descriptor with
/// the supported system id and return the PID it announces.
fn find_ecm_pid(mut descriptors: &[u8]) -> Result<u16, DescrambleError> {
    while descriptors.len() >= 2 {
        let tag = descriptors[0];
        let length = descriptors[1] as usize;
        let value = descriptors
            .get(2..2 + length)
            .ok_or(DescrambleError::EcmPidNotFound)?;
        if tag == CA_DESCRIPTOR_TAG && length >= 4 {
            let caid = u16::from_be_bytes([value[0], value[1]]);
            if caid == CA_SYSTEM_ID {
                return Ok(u16::from_be_bytes([value[2], value[3]]));
            }
        }
        descriptors = &descriptors[2 + length..];
    }
    Err(DescrambleError::EcmPidNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_packet(pid_val: u16) -> [u8; 188] {
        let mut pkt = [0u8; 188];
        pkt[0] = SYNC_BYTE;
        pkt[1] = (pid_val >> 8) as u8;
        pkt[2] = pid_val as u8;
        pkt
    }

    fn pat_packet(pmt_pid: u16) -> [u8; 188] {
        let mut pkt = ts_packet(pid::PAT);
        pkt[15] = (pmt_pid >> 8) as u8;
        pkt[16] = pmt_pid as u8;
        pkt
    }

    fn pmt_packet(pmt_pid: u16, program_info: &[u8]) -> [u8; 188] {
        let mut pkt = ts_packet(pmt_pid);
        pkt[5] = table_id::PMT;
        pkt[15] = (program_info.len() >> 8) as u8;
        pkt[16] = program_info.len() as u8;
        pkt[17..17 + program_info.len()].copy_from_slice(program_info);
        pkt
    }

    #[test]
    fn test_pat_then_pmt_discovers_ecm_pid() {
        let mut walker = PsiWalker::new();

        // PAT announcing the PMT on 0x2042; the PID mask keeps 13 bits.
        walker.inspect(&pat_packet(0x2042)).unwrap();
        assert_eq!(walker.ecm_pid(), None);

        // PMT with one CA descriptor for system 0x5601, ECM PID 0x0123.
        let pmt = pmt_packet(0x0042, &[0x09, 0x04, 0x56, 0x01, 0x01, 0x23]);
        walker.inspect(&pmt).unwrap();
        assert_eq!(walker.ecm_pid(), Some(0x0123));
    }

    #[test]
    fn test_foreign_descriptors_are_skipped() {
        let mut walker = PsiWalker::new();
        walker.inspect(&pat_packet(0x0042)).unwrap();

        // A registration descriptor and a CA descriptor for some other
        // system come first.
        let info = [
            0x05, 0x02, 0xAA, 0xBB, // registration
            0x09, 0x04, 0x12, 0x34, 0x0F, 0xFF, // CA, wrong system id
            0x09, 0x04, 0x56, 0x01, 0x04, 0x56, // CA, ours
        ];
        walker.inspect(&pmt_packet(0x0042, &info)).unwrap();
        assert_eq!(walker.ecm_pid(), Some(0x0456));
    }

    #[test]
    fn test_bad_sync_byte() {
        let mut walker = PsiWalker::new();
        let mut pkt = ts_packet(0);
        pkt[0] = 0x48;
        assert_eq!(walker.inspect(&pkt), Err(DescrambleError::TsSync(0x48)));
    }

    #[test]
    fn test_pat_pointer_and_table_id_checks() {
        let mut walker = PsiWalker::new();
        let mut pkt = pat_packet(0x0042);
        pkt[4] = 1;
        assert_eq!(walker.inspect(&pkt), Err(DescrambleError::PatPointer));

        let mut walker = PsiWalker::new();
        let mut pkt = pat_packet(0x0042);
        pkt[5] = 0x42;
        assert_eq!(walker.inspect(&pkt), Err(DescrambleError::PatTable(0x42)));
    }

    #[test]
    fn test_pmt_pointer_and_table_id_checks() {
        let mut walker = PsiWalker::new();
        walker.inspect(&pat_packet(0x0042)).unwrap();
        let mut pkt = pmt_packet(0x0042, &[]);
        pkt[4] = 1;
        assert_eq!(walker.inspect(&pkt), Err(DescrambleError::PmtPointer));

        let mut walker = PsiWalker::new();
        walker.inspect(&pat_packet(0x0042)).unwrap();
        let mut pkt = pmt_packet(0x0042, &[]);
        pkt[5] = 0x00;
        assert_eq!(walker.inspect(&pkt), Err(DescrambleError::PmtTable(0x00)));
    }

    #[test]
    fn test_missing_ca_descriptor() {
        let mut walker = PsiWalker::new();
        walker.inspect(&pat_packet(0x0042)).unwrap();
        let pmt = pmt_packet(0x0042, &[0x05, 0x02, 0xAA, 0xBB]);
        assert_eq!(walker.inspect(&pmt), Err(DescrambleError::EcmPidNotFound));
    }

    #[test]
    fn test_overlong_descriptor_length_fails_cleanly() {
        let mut walker = PsiWalker::new();
        walker.inspect(&pat_packet(0x0042)).unwrap();
        // Descriptor claims more bytes than the loop holds.
        let pmt = pmt_packet(0x0042, &[0x09, 0x7F, 0x56, 0x01]);
        assert_eq!(walker.inspect(&pmt), Err(DescrambleError::EcmPidNotFound));
    }

    #[test]
    fn test_unrelated_pids_are_ignored() {
        let mut walker = PsiWalker::new();
        walker.inspect(&ts_packet(0x0100)).unwrap();
        assert_eq!(walker.ecm_pid(), None);
    }
}
